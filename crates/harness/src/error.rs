//! Error types for the lifecycle harness

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Suite has not been started")]
    SuiteNotStarted,

    #[error("Suite already started: {0}")]
    SuiteAlreadyStarted(String),

    #[error("Invalid transition for '{unit}': {from} -> {to}")]
    InvalidTransition {
        unit: String,
        from: String,
        to: String,
    },

    #[error("Report sink error: {0}")]
    ReportSink(String),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Capture timed out after {0} ms")]
    CaptureTimeout(u64),

    #[error("Driver session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("Runner event error at line {line}: {reason}")]
    RunnerEvent { line: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
