//! Warden test lifecycle harness
//!
//! This crate decides when a failing browser test runs again and when its
//! diagnostics are captured:
//! - Observes runner callbacks and keeps suite counters
//! - Grants a bounded number of retries per test unit
//! - Captures screenshot, page source and console log once retries are
//!   exhausted, exactly once per unit
//! - Streams events, artifact bundles and the final summary to an
//!   injected report sink
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Runner (external)  ── callbacks + AttemptContext ──┐       │
//! ├─────────────────────────────────────────────────────┼───────┤
//! │  LifecycleController                                ▼       │
//! │    ├── RetryPolicy         (unit, execution) -> attempts    │
//! │    ├── ArtifactCollector   session -> ArtifactBundle        │
//! │    │     ├── {test}_{TAG}_{ts}.png                          │
//! │    │     ├── pagesource/{test}_{TAG}_{ts}.html              │
//! │    │     └── logs/{test}_{TAG}_{ts}.log                     │
//! │    └── ReportSink          events, bundles, SuiteSummary    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod artifact;
pub mod cdp;
pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod replay;
pub mod report;
pub mod retry;
pub mod session;

pub use artifact::{ArtifactBundle, ArtifactCollector, ArtifactKind, ArtifactRef};
pub use config::HarnessConfig;
pub use controller::{FailureDisposition, LifecycleController, UnitState};
pub use error::{HarnessError, HarnessResult};
pub use model::{AttemptContext, ConsoleEntry, Outcome, OutcomeKind, TestUnit};
pub use replay::{Replay, RunnerEvent};
pub use report::{
    EventStatus, JsonlReportSink, MemoryReportSink, ReportEvent, ReportSink, SuiteSummary,
};
pub use retry::{AttemptState, RetryDecision, RetryPolicy};
pub use session::{BrowserInfo, DriverSession};
