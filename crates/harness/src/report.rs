//! Report sinks: durable, append-only destinations for lifecycle records

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};
use uuid::Uuid;

use crate::artifact::ArtifactBundle;
use crate::error::{HarnessError, HarnessResult};

/// Severity of a report event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Info,
    Pass,
    Fail,
    Skip,
    Warning,
}

/// One entry in the report event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEvent {
    pub timestamp: DateTime<Utc>,
    pub test_name: String,
    pub status: EventStatus,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack_frames: Vec<String>,
}

impl ReportEvent {
    pub fn new(status: EventStatus, test_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            test_name: test_name.into(),
            status,
            message: message.into(),
            artifact: None,
            duration_ms: None,
            stack_frames: Vec::new(),
        }
    }

    pub fn info(test_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventStatus::Info, test_name, message)
    }

    pub fn pass(test_name: impl Into<String>, duration_ms: u64) -> Self {
        let mut event = Self::new(EventStatus::Pass, test_name, format!("passed in {} ms", duration_ms));
        event.duration_ms = Some(duration_ms);
        event
    }

    pub fn fail(test_name: impl Into<String>, reason: impl Into<String>, stack_frames: Vec<String>) -> Self {
        let mut event = Self::new(EventStatus::Fail, test_name, reason);
        event.stack_frames = stack_frames;
        event
    }

    pub fn skip(test_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(EventStatus::Skip, test_name, reason)
    }

    pub fn warning(test_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventStatus::Warning, test_name, message)
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact = Some(path.into());
        self
    }
}

/// Identity of one suite execution, recorded when the sink opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteInfo {
    pub name: String,
    pub execution_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub system_info: BTreeMap<String, String>,
}

/// Frozen suite counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteSummary {
    pub suite: String,
    pub execution_id: Uuid,
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Retry credits consumed across all units
    pub retries: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub aborted: bool,
}

impl SuiteSummary {
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }

    pub fn success(&self) -> bool {
        self.failed == 0 && !self.aborted
    }
}

/// A line in the report stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum ReportRecord {
    SuiteStarted(SuiteInfo),
    Event(ReportEvent),
    Bundle(ArtifactBundle),
    Summary(SuiteSummary),
}

/// Destination for lifecycle records, scoped to one suite execution
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Open the sink for a suite execution
    async fn open(&self, suite: &SuiteInfo) -> HarnessResult<()>;

    /// Append one event
    async fn append(&self, event: ReportEvent) -> HarnessResult<()>;

    /// Take ownership of a captured bundle
    async fn attach(&self, bundle: ArtifactBundle) -> HarnessResult<()>;

    /// Record the final summary
    async fn finish(&self, summary: &SuiteSummary) -> HarnessResult<()>;

    /// Flush and release the sink
    async fn close(&self) -> HarnessResult<()>;
}

/// JSON-lines report file, one record per line
pub struct JsonlReportSink {
    output_dir: PathBuf,
    writer: tokio::sync::Mutex<Option<BufWriter<File>>>,
    path: Mutex<Option<PathBuf>>,
}

impl JsonlReportSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            writer: tokio::sync::Mutex::new(None),
            path: Mutex::new(None),
        }
    }

    /// Path of the report file once opened
    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().clone()
    }

    /// Read every record back from a report file
    pub async fn read_records(path: &Path) -> HarnessResult<Vec<ReportRecord>> {
        let content = fs::read_to_string(path).await?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(HarnessError::from))
            .collect()
    }

    async fn write_record(&self, record: &ReportRecord) -> HarnessResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| HarnessError::ReportSink("report sink is not open".to_string()))?;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ReportSink for JsonlReportSink {
    async fn open(&self, suite: &SuiteInfo) -> HarnessResult<()> {
        {
            let mut guard = self.writer.lock().await;
            if guard.is_some() {
                return Err(HarnessError::ReportSink("report sink already open".to_string()));
            }

            fs::create_dir_all(&self.output_dir).await?;
            let file_name = format!(
                "report_{}_{}.jsonl",
                suite.name.replace(|c: char| !c.is_ascii_alphanumeric() && c != '-', "_"),
                suite.started_at.format("%Y%m%d_%H%M%S")
            );
            let path = self.output_dir.join(file_name);
            let file = OpenOptions::new().create(true).append(true).open(&path).await?;

            info!("Writing report to: {}", path.display());
            *self.path.lock() = Some(path);
            *guard = Some(BufWriter::new(file));
        }

        self.write_record(&ReportRecord::SuiteStarted(suite.clone())).await
    }

    async fn append(&self, event: ReportEvent) -> HarnessResult<()> {
        self.write_record(&ReportRecord::Event(event)).await
    }

    async fn attach(&self, bundle: ArtifactBundle) -> HarnessResult<()> {
        self.write_record(&ReportRecord::Bundle(bundle)).await
    }

    async fn finish(&self, summary: &SuiteSummary) -> HarnessResult<()> {
        self.write_record(&ReportRecord::Summary(summary.clone())).await
    }

    async fn close(&self) -> HarnessResult<()> {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            writer.flush().await?;
            writer.shutdown().await?;
            debug!("Report sink closed");
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<ReportRecord>,
    open: bool,
    closed: bool,
}

/// In-memory sink; clones share the same record buffer
#[derive(Debug, Clone, Default)]
pub struct MemoryReportSink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ReportRecord> {
        self.state.lock().records.clone()
    }

    pub fn events(&self) -> Vec<ReportEvent> {
        self.state
            .lock()
            .records
            .iter()
            .filter_map(|r| match r {
                ReportRecord::Event(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    /// Events for one test, in arrival order
    pub fn events_for(&self, test_name: &str) -> Vec<ReportEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.test_name == test_name)
            .collect()
    }

    pub fn bundles(&self) -> Vec<ArtifactBundle> {
        self.state
            .lock()
            .records
            .iter()
            .filter_map(|r| match r {
                ReportRecord::Bundle(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn summary(&self) -> Option<SuiteSummary> {
        self.state.lock().records.iter().rev().find_map(|r| match r {
            ReportRecord::Summary(s) => Some(s.clone()),
            _ => None,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn push(&self, record: ReportRecord) -> HarnessResult<()> {
        let mut state = self.state.lock();
        if !state.open || state.closed {
            return Err(HarnessError::ReportSink("report sink is not open".to_string()));
        }
        state.records.push(record);
        Ok(())
    }
}

#[async_trait]
impl ReportSink for MemoryReportSink {
    async fn open(&self, suite: &SuiteInfo) -> HarnessResult<()> {
        {
            let mut state = self.state.lock();
            if state.open {
                return Err(HarnessError::ReportSink("report sink already open".to_string()));
            }
            state.open = true;
        }
        self.push(ReportRecord::SuiteStarted(suite.clone()))
    }

    async fn append(&self, event: ReportEvent) -> HarnessResult<()> {
        self.push(ReportRecord::Event(event))
    }

    async fn attach(&self, bundle: ArtifactBundle) -> HarnessResult<()> {
        self.push(ReportRecord::Bundle(bundle))
    }

    async fn finish(&self, summary: &SuiteSummary) -> HarnessResult<()> {
        self.push(ReportRecord::Summary(summary.clone()))
    }

    async fn close(&self) -> HarnessResult<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}
