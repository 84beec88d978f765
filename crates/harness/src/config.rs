//! Harness configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HarnessError, HarnessResult};

/// Default number of retries granted to a failing test unit
pub const DEFAULT_RETRY_CEILING: u32 = 3;

/// Harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Name reported for the suite execution
    pub suite_name: String,

    /// Retry configuration
    pub retry: RetryConfig,

    /// Artifact capture configuration
    pub artifacts: ArtifactConfig,

    /// Report output configuration
    pub report: ReportConfig,

    /// Free-form environment facts recorded when the suite opens
    pub system_info: BTreeMap<String, String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let mut system_info = BTreeMap::new();
        system_info.insert("OS".to_string(), std::env::consts::OS.to_string());

        Self {
            suite_name: "default".to_string(),
            retry: RetryConfig::default(),
            artifacts: ArtifactConfig::default(),
            report: ReportConfig::default(),
            system_info,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries permitted per unit per suite execution (0 disables retries)
    pub ceiling: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_RETRY_CEILING,
        }
    }
}

/// Artifact capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Root directory; page sources and logs live in subdirectories
    pub root: PathBuf,

    /// Upper bound on each individual call into the session (browser
    /// info, screenshot, page source, console log). These run one after
    /// another, so a terminal failure can spend up to
    /// [`ArtifactConfig::worst_case_capture`] on diagnostics.
    pub capture_timeout_ms: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("test-output/artifacts"),
            capture_timeout_ms: 10_000,
        }
    }
}

/// Browser info plus the three sub-captures
const SESSION_CALLS_PER_CAPTURE: u32 = 4;

impl ArtifactConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    /// Longest a terminal failure can block its worker on diagnostics
    pub fn worst_case_capture(&self) -> Duration {
        self.capture_timeout() * SESSION_CALLS_PER_CAPTURE
    }
}

/// Report output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Directory receiving the JSON-lines report
    pub output_dir: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("test-output"),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> HarnessResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> HarnessResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `WARDEN_*` environment overrides
    pub fn apply_env(&mut self) -> HarnessResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> HarnessResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("WARDEN_RETRY_CEILING") {
            self.retry.ceiling = value.trim().parse().map_err(|_| {
                HarnessError::InvalidConfig(format!("WARDEN_RETRY_CEILING: '{}'", value))
            })?;
        }

        if let Some(value) = lookup("WARDEN_ARTIFACT_ROOT") {
            self.artifacts.root = PathBuf::from(value);
        }

        if let Some(value) = lookup("WARDEN_REPORT_DIR") {
            self.report.output_dir = PathBuf::from(value);
        }

        if let Some(value) = lookup("WARDEN_CAPTURE_TIMEOUT_MS") {
            self.artifacts.capture_timeout_ms = value.trim().parse().map_err(|_| {
                HarnessError::InvalidConfig(format!("WARDEN_CAPTURE_TIMEOUT_MS: '{}'", value))
            })?;
        }

        self.validate()
    }

    /// Reject configurations the controller cannot honour
    pub fn validate(&self) -> HarnessResult<()> {
        if self.suite_name.trim().is_empty() {
            return Err(HarnessError::InvalidConfig("suite_name must not be empty".to_string()));
        }
        if self.artifacts.capture_timeout_ms == 0 {
            return Err(HarnessError::InvalidConfig(
                "artifacts.capture_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
