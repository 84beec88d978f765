//! Playwright-backed session attached over the Chrome DevTools Protocol
//!
//! The runner owns the browser; this adapter only attaches to its CDP
//! endpoint to read diagnostics from the most recently opened page. Each
//! capture runs a short Node script through Playwright.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};
use crate::model::ConsoleEntry;
use crate::session::{BrowserInfo, DriverSession};

/// What a generated script captures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    Screenshot,
    PageSource,
    BrowserInfo,
}

#[derive(Debug, Deserialize)]
struct ScriptBrowserInfo {
    name: String,
    version: Option<String>,
}

/// Driver session reached through a CDP endpoint such as
/// `http://127.0.0.1:9222`
#[derive(Debug)]
pub struct CdpSession {
    id: String,
    endpoint: String,
    node_binary: PathBuf,
    live: AtomicBool,
}

impl CdpSession {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            node_binary: PathBuf::from("node"),
            live: AtomicBool::new(true),
        }
    }

    /// Use a specific `node` binary
    pub fn with_node(mut self, node_binary: impl Into<PathBuf>) -> Self {
        self.node_binary = node_binary.into();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Mark the session released; later captures yield nothing
    pub fn release(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    /// Build the Node script for one capture writing to `output`
    fn build_script(&self, capture: Capture, output: &Path) -> String {
        // JSON string literals are valid JS string literals.
        let endpoint = serde_json::Value::from(self.endpoint.as_str()).to_string();
        let output = serde_json::Value::from(output.to_string_lossy().as_ref()).to_string();

        let body = match capture {
            Capture::Screenshot => format!(
                "    await page.screenshot({{ path: {}, fullPage: true }});",
                output
            ),
            Capture::PageSource => format!(
                "    fs.writeFileSync({}, await page.content(), 'utf8');",
                output
            ),
            Capture::BrowserInfo => format!(
                "    fs.writeFileSync({}, JSON.stringify({{ name: browser.browserType().name(), version: browser.version() }}));",
                output
            ),
        };

        format!(
            r#"
const {{ chromium }} = require('playwright');
const fs = require('fs');

(async () => {{
  try {{
    const browser = await chromium.connectOverCDP({endpoint});
    const pages = browser.contexts().flatMap(c => c.pages());
    if (pages.length === 0) {{
      throw new Error('no open page on ' + {endpoint});
    }}
    const page = pages[pages.length - 1];
{body}
    process.exit(0);
  }} catch (error) {{
    console.error(JSON.stringify({{ success: false, error: error.message }}));
    process.exit(1);
  }}
}})();
"#,
            endpoint = endpoint,
            body = body,
        )
    }

    /// Run a capture script and return the bytes it wrote
    async fn run_capture(&self, capture: Capture) -> HarnessResult<Vec<u8>> {
        if !self.is_live() {
            return Err(HarnessError::SessionUnavailable(format!("{} released", self.id)));
        }

        let temp_dir = tempfile::tempdir()?;
        let output_path = temp_dir.path().join("capture.out");
        let script_path = temp_dir.path().join("capture.js");
        tokio::fs::write(&script_path, self.build_script(capture, &output_path)).await?;

        debug!("Running {:?} capture for session {}", capture, self.id);

        let output = Command::new(&self.node_binary)
            .arg(&script_path)
            .current_dir(temp_dir.path())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HarnessError::Capture(format!(
                "{:?} script failed: {}",
                capture,
                stderr.trim()
            )));
        }

        Ok(tokio::fs::read(&output_path).await?)
    }
}

#[async_trait]
impl DriverSession for CdpSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn screenshot(&self) -> HarnessResult<Vec<u8>> {
        self.run_capture(Capture::Screenshot).await
    }

    async fn page_source(&self) -> HarnessResult<String> {
        let bytes = self.run_capture(Capture::PageSource).await?;
        String::from_utf8(bytes).map_err(|e| HarnessError::Capture(format!("page source: {}", e)))
    }

    async fn console_log(&self) -> HarnessResult<Option<Vec<ConsoleEntry>>> {
        // Console history is not replayed to a newly attached CDP client.
        Ok(None)
    }

    async fn browser_info(&self) -> HarnessResult<Option<BrowserInfo>> {
        let bytes = self.run_capture(Capture::BrowserInfo).await?;
        let info: ScriptBrowserInfo = serde_json::from_slice(&bytes)?;
        Ok(Some(BrowserInfo {
            name: info.name,
            version: info.version,
        }))
    }
}
