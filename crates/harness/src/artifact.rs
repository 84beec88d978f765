//! Diagnostic artifact capture for terminal failures
//!
//! Layout under the artifact root:
//!
//! ```text
//! <root>/{test}_{TAG}_{yyyyMMdd_HHmmss}.png      ({test} gains ~{digest} when sanitised)
//! <root>/pagesource/{test}_{TAG}_{yyyyMMdd_HHmmss}.html
//! <root>/logs/{test}_{TAG}_{yyyyMMdd_HHmmss}.log
//! ```
//!
//! Each sub-capture is attempted independently and bounded by a timeout.
//! Files are published with a hard link from a private temp file, so an
//! existing artifact is never overwritten and readers never see a partial
//! write.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ArtifactConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::model::{ConsoleEntry, OutcomeKind, TestUnit};
use crate::session::DriverSession;

static UNSAFE_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("static regex"));

/// Kind of captured artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Screenshot,
    PageSource,
    ConsoleLog,
}

impl ArtifactKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "png",
            ArtifactKind::PageSource => "html",
            ArtifactKind::ConsoleLog => "log",
        }
    }

    /// Subdirectory under the artifact root; screenshots live at the root
    pub fn subdir(&self) -> Option<&'static str> {
        match self {
            ArtifactKind::Screenshot => None,
            ArtifactKind::PageSource => Some("pagesource"),
            ArtifactKind::ConsoleLog => Some("logs"),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Screenshot => "screenshot",
            ArtifactKind::PageSource => "page source",
            ArtifactKind::ConsoleLog => "console log",
        }
    }
}

/// A persisted artifact file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

/// Console log artifact with the entries it was rendered from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLogArtifact {
    pub file: ArtifactRef,
    pub entries: Vec<ConsoleEntry>,
}

/// Diagnostics captured for one terminal failure. Never mutated after
/// [`ArtifactCollector::capture`] returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactBundle {
    pub unit_name: String,
    pub outcome: OutcomeKind,
    pub captured_at: DateTime<Utc>,
    pub screenshot: Option<ArtifactRef>,
    pub page_markup: Option<ArtifactRef>,
    pub console_log: Option<ConsoleLogArtifact>,

    /// Sub-captures the session does not support
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsupported: Vec<ArtifactKind>,

    /// Sub-captures that failed, timed out or could not be saved
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl ArtifactBundle {
    fn new(unit: &TestUnit, outcome: OutcomeKind, captured_at: DateTime<Utc>) -> Self {
        Self {
            unit_name: unit.name.clone(),
            outcome,
            captured_at,
            screenshot: None,
            page_markup: None,
            console_log: None,
            unsupported: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// True when no artifact at all was persisted
    pub fn is_empty(&self) -> bool {
        self.screenshot.is_none() && self.page_markup.is_none() && self.console_log.is_none()
    }

    /// All persisted files, screenshot first
    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactRef> {
        self.screenshot
            .iter()
            .chain(self.page_markup.iter())
            .chain(self.console_log.iter().map(|c| &c.file))
    }

    /// Reference carried by the fail event: the screenshot when present
    pub fn primary_path(&self) -> Option<&Path> {
        self.artifacts().next().map(|a| a.path.as_path())
    }
}

/// Captures screenshot, page markup and console log from a live session
#[derive(Debug, Clone)]
pub struct ArtifactCollector {
    root: PathBuf,
    capture_timeout: Duration,
}

impl ArtifactCollector {
    pub fn new(config: &ArtifactConfig) -> Self {
        Self {
            root: config.root.clone(),
            capture_timeout: config.capture_timeout(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File stem shared by every artifact of one bundle.
    ///
    /// Names that need sanitising get a `~` and a digest of the raw name
    /// appended. `~` never survives sanitising, so distinct units never
    /// share a stem, and an existing file under a stem always belongs to
    /// the same unit, outcome and second.
    pub fn file_stem(unit: &TestUnit, outcome: OutcomeKind, at: DateTime<Utc>) -> String {
        let sanitized = UNSAFE_FILENAME_CHARS.replace_all(&unit.name, "_");
        let name = if sanitized == unit.name.as_str() {
            unit.name.clone()
        } else {
            format!("{}~{}", sanitized, &hash(unit.name.as_bytes())[..12])
        };
        format!("{}_{}_{}", name, outcome.tag(), at.format("%Y%m%d_%H%M%S"))
    }

    /// Path an artifact of `kind` with the given stem is published under
    pub fn artifact_path(&self, kind: ArtifactKind, stem: &str) -> PathBuf {
        let dir = match kind.subdir() {
            Some(sub) => self.root.join(sub),
            None => self.root.clone(),
        };
        dir.join(format!("{}.{}", stem, kind.extension()))
    }

    /// Capture a bundle for `unit`. Never fails: every problem is recorded
    /// in [`ArtifactBundle::failures`] instead.
    pub async fn capture(
        &self,
        unit: &TestUnit,
        session: Option<&dyn DriverSession>,
        outcome: OutcomeKind,
    ) -> ArtifactBundle {
        let captured_at = Utc::now();
        let mut bundle = ArtifactBundle::new(unit, outcome, captured_at);

        let session = match session {
            Some(s) if s.is_live() => s,
            Some(s) => {
                warn!("Session {} already released, no artifacts for {}", s.id(), unit.name);
                bundle.failures.push(format!("driver session {} is not live", s.id()));
                return bundle;
            }
            None => {
                warn!("No driver session bound to {}, no artifacts captured", unit.name);
                bundle.failures.push("no driver session bound to attempt".to_string());
                return bundle;
            }
        };

        let stem = Self::file_stem(unit, outcome, captured_at);
        debug!("Capturing artifacts for {} as {}", unit.name, stem);

        match self.bounded(session.screenshot()).await {
            Ok(png) => match self.persist(ArtifactKind::Screenshot, &stem, &png).await {
                Ok(artifact) => bundle.screenshot = Some(artifact),
                Err(e) => bundle.failures.push(save_failure(ArtifactKind::Screenshot, &e)),
            },
            Err(e) => bundle.failures.push(fetch_failure(ArtifactKind::Screenshot, &e)),
        }

        match self.bounded(session.page_source()).await {
            Ok(markup) => match self.persist(ArtifactKind::PageSource, &stem, markup.as_bytes()).await {
                Ok(artifact) => bundle.page_markup = Some(artifact),
                Err(e) => bundle.failures.push(save_failure(ArtifactKind::PageSource, &e)),
            },
            Err(e) => bundle.failures.push(fetch_failure(ArtifactKind::PageSource, &e)),
        }

        match self.bounded(session.console_log()).await {
            Ok(Some(entries)) => {
                let rendered: String = entries.iter().map(|e| format!("{}\n", e)).collect();
                match self.persist(ArtifactKind::ConsoleLog, &stem, rendered.as_bytes()).await {
                    Ok(file) => bundle.console_log = Some(ConsoleLogArtifact { file, entries }),
                    Err(e) => bundle.failures.push(save_failure(ArtifactKind::ConsoleLog, &e)),
                }
            }
            Ok(None) => {
                debug!("Console log not supported by session {}", session.id());
                bundle.unsupported.push(ArtifactKind::ConsoleLog);
            }
            Err(e) => bundle.failures.push(fetch_failure(ArtifactKind::ConsoleLog, &e)),
        }

        info!(
            "Captured {} artifact(s) for {} ({} failed)",
            bundle.artifacts().count(),
            unit.name,
            bundle.failures.len()
        );
        bundle
    }

    async fn bounded<T, F>(&self, fut: F) -> HarnessResult<T>
    where
        F: Future<Output = HarnessResult<T>>,
    {
        match tokio::time::timeout(self.capture_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::CaptureTimeout(
                self.capture_timeout.as_millis() as u64,
            )),
        }
    }

    /// Publish `data` without overwriting an existing artifact
    async fn persist(&self, kind: ArtifactKind, stem: &str, data: &[u8]) -> HarnessResult<ArtifactRef> {
        let path = self.artifact_path(kind, stem);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir).await?;

        let tmp_path = dir.join(format!(".{}.{}.{}.tmp", stem, kind.extension(), Uuid::new_v4()));
        fs::write(&tmp_path, data).await?;

        let published = match fs::hard_link(&tmp_path, &path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => {
                debug!("Hard link unavailable ({}), writing {} directly", e, path.display());
                write_new(&path, data).await
            }
        };
        if let Err(e) = fs::remove_file(&tmp_path).await {
            debug!("Could not remove temp file {}: {}", tmp_path.display(), e);
        }

        if published? {
            debug!("Stored {} ({} bytes)", path.display(), data.len());
            Ok(ArtifactRef {
                kind,
                path,
                sha256: hash(data),
                bytes: data.len() as u64,
            })
        } else {
            info!("Artifact {} already exists, keeping it", path.display());
            let existing = fs::read(&path).await?;
            Ok(ArtifactRef {
                kind,
                path,
                sha256: hash(&existing),
                bytes: existing.len() as u64,
            })
        }
    }
}

async fn write_new(path: &Path, data: &[u8]) -> HarnessResult<bool> {
    let file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await;
    match file {
        Ok(mut file) => {
            file.write_all(data).await?;
            file.flush().await?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn fetch_failure(kind: ArtifactKind, err: &HarnessError) -> String {
    warn!("Failed to capture {}: {}", kind.as_str(), err);
    format!("{} capture failed: {}", kind.as_str(), err)
}

fn save_failure(kind: ArtifactKind, err: &HarnessError) -> String {
    warn!("Failed to save {}: {}", kind.as_str(), err);
    format!("{} could not be saved: {}", kind.as_str(), err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct StubSession {
        live: AtomicBool,
        console: Option<Vec<ConsoleEntry>>,
        fail_screenshot: bool,
        hang_markup: bool,
    }

    impl StubSession {
        fn healthy() -> Self {
            Self {
                live: AtomicBool::new(true),
                console: Some(vec![ConsoleEntry::new(
                    Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
                    "SEVERE",
                    "Uncaught TypeError",
                )]),
                fail_screenshot: false,
                hang_markup: false,
            }
        }
    }

    #[async_trait]
    impl DriverSession for StubSession {
        fn id(&self) -> &str {
            "stub"
        }

        fn is_live(&self) -> bool {
            self.live.load(Ordering::SeqCst)
        }

        async fn screenshot(&self) -> HarnessResult<Vec<u8>> {
            if self.fail_screenshot {
                return Err(HarnessError::Capture("renderer crashed".to_string()));
            }
            Ok(b"\x89PNG fake".to_vec())
        }

        async fn page_source(&self) -> HarnessResult<String> {
            if self.hang_markup {
                futures::future::pending::<()>().await;
            }
            Ok("<html><body>checkout</body></html>".to_string())
        }

        async fn console_log(&self) -> HarnessResult<Option<Vec<ConsoleEntry>>> {
            Ok(self.console.clone())
        }
    }

    fn collector(root: &Path) -> ArtifactCollector {
        ArtifactCollector::new(&ArtifactConfig {
            root: root.to_path_buf(),
            capture_timeout_ms: 200,
        })
    }

    #[test]
    fn test_file_stem_is_deterministic_and_safe() {
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let unit = TestUnit::new("cart/add item", "s");
        let stem = ArtifactCollector::file_stem(&unit, OutcomeKind::Failed, at);
        assert!(stem.starts_with("cart_add_item~"));
        assert!(stem.ends_with("_FAILURE_20240506_070809"));
        assert!(!stem.contains('/'));
        assert_eq!(stem, ArtifactCollector::file_stem(&unit, OutcomeKind::Failed, at));

        let plain = TestUnit::new("Checkout", "s");
        assert_eq!(
            ArtifactCollector::file_stem(&plain, OutcomeKind::Failed, at),
            "Checkout_FAILURE_20240506_070809"
        );
    }

    #[test]
    fn test_sanitised_names_never_share_a_stem() {
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let names = ["cart/add", "cart_add", "a b", "a_b", " a", "a", "Тест", "试验", "cart?add"];

        let stems: std::collections::HashSet<_> = names
            .iter()
            .map(|n| ArtifactCollector::file_stem(&TestUnit::new(*n, "s"), OutcomeKind::Failed, at))
            .collect();

        assert_eq!(stems.len(), names.len());
    }

    #[test]
    fn test_artifact_layout() {
        let c = collector(Path::new("/out"));
        assert_eq!(c.artifact_path(ArtifactKind::Screenshot, "x"), PathBuf::from("/out/x.png"));
        assert_eq!(
            c.artifact_path(ArtifactKind::PageSource, "x"),
            PathBuf::from("/out/pagesource/x.html")
        );
        assert_eq!(c.artifact_path(ArtifactKind::ConsoleLog, "x"), PathBuf::from("/out/logs/x.log"));
    }

    #[tokio::test]
    async fn test_full_capture() {
        let tmp = TempDir::new().unwrap();
        let c = collector(tmp.path());
        let session = StubSession::healthy();

        let bundle = c
            .capture(&TestUnit::new("Checkout", "s"), Some(&session), OutcomeKind::Failed)
            .await;

        assert!(bundle.failures.is_empty());
        assert_eq!(bundle.artifacts().count(), 3);
        let log = bundle.console_log.as_ref().unwrap();
        assert_eq!(log.entries.len(), 1);
        let text = std::fs::read_to_string(&log.file.path).unwrap();
        assert!(text.contains("SEVERE Uncaught TypeError"));
        assert_eq!(bundle.primary_path(), bundle.screenshot.as_ref().map(|s| s.path.as_path()));
        assert_eq!(bundle.screenshot.as_ref().unwrap().sha256, hash(b"\x89PNG fake"));
    }

    #[tokio::test]
    async fn test_one_failing_subcapture_does_not_block_others() {
        let tmp = TempDir::new().unwrap();
        let c = collector(tmp.path());
        let session = StubSession {
            fail_screenshot: true,
            ..StubSession::healthy()
        };

        let bundle = c
            .capture(&TestUnit::new("Checkout", "s"), Some(&session), OutcomeKind::Failed)
            .await;

        assert!(bundle.screenshot.is_none());
        assert!(bundle.page_markup.is_some());
        assert!(bundle.console_log.is_some());
        assert_eq!(bundle.failures.len(), 1);
        assert!(bundle.failures[0].contains("renderer crashed"));
    }

    #[tokio::test]
    async fn test_hanging_subcapture_times_out() {
        let tmp = TempDir::new().unwrap();
        let c = collector(tmp.path());
        let session = StubSession {
            hang_markup: true,
            ..StubSession::healthy()
        };

        let bundle = c
            .capture(&TestUnit::new("Slow", "s"), Some(&session), OutcomeKind::Failed)
            .await;

        assert!(bundle.page_markup.is_none());
        assert!(bundle.screenshot.is_some());
        assert!(bundle.console_log.is_some());
        assert!(bundle.failures[0].contains("timed out"));
    }

    #[tokio::test]
    async fn test_released_session_yields_empty_bundle() {
        let tmp = TempDir::new().unwrap();
        let c = collector(tmp.path());
        let session = StubSession::healthy();
        session.live.store(false, Ordering::SeqCst);

        let bundle = c
            .capture(&TestUnit::new("Gone", "s"), Some(&session), OutcomeKind::Failed)
            .await;

        assert!(bundle.is_empty());
        assert_eq!(bundle.failures.len(), 1);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_existing_artifact_is_not_overwritten() {
        let tmp = TempDir::new().unwrap();
        let c = collector(tmp.path());

        let first = c.persist(ArtifactKind::PageSource, "Dup_FAILURE_1", b"first").await.unwrap();
        let second = c.persist(ArtifactKind::PageSource, "Dup_FAILURE_1", b"second").await.unwrap();

        assert_eq!(first.path, second.path);
        assert_eq!(second.sha256, hash(b"first"));
        assert_eq!(std::fs::read(&first.path).unwrap(), b"first");

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("pagesource"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
