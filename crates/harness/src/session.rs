//! Driver session capabilities consumed by the harness
//!
//! Sessions are acquired and released by the runner. The harness only
//! asks a live session for diagnostics.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HarnessResult;
use crate::model::ConsoleEntry;

/// Browser identity reported alongside a terminal failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserInfo {
    pub name: String,
    pub version: Option<String>,
}

/// A browser automation session bound to one attempt
#[async_trait]
pub trait DriverSession: Send + Sync {
    /// Stable identifier for logging
    fn id(&self) -> &str;

    /// Whether the session has not been released yet
    fn is_live(&self) -> bool;

    /// PNG screenshot of the current viewport
    async fn screenshot(&self) -> HarnessResult<Vec<u8>>;

    /// Current page markup
    async fn page_source(&self) -> HarnessResult<String>;

    /// Console entries since session start; `Ok(None)` when the browser
    /// does not expose its console
    async fn console_log(&self) -> HarnessResult<Option<Vec<ConsoleEntry>>>;

    /// Browser name and version; `Ok(None)` when the session cannot
    /// describe itself
    async fn browser_info(&self) -> HarnessResult<Option<BrowserInfo>> {
        Ok(None)
    }
}
