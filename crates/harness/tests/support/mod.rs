//! Scriptable driver session for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use warden_harness::{
    BrowserInfo, ConsoleEntry, DriverSession, HarnessConfig, HarnessError, HarnessResult,
    LifecycleController, MemoryReportSink,
};

pub struct FakeSession {
    id: String,
    live: AtomicBool,
    pub screenshot: Vec<u8>,
    pub console_supported: bool,
    pub screenshot_delay: Option<Duration>,
    pub screenshot_calls: AtomicUsize,
    pub markup_calls: AtomicUsize,
    pub console_calls: AtomicUsize,
}

impl FakeSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            live: AtomicBool::new(true),
            screenshot: b"\x89PNG\r\n".to_vec(),
            console_supported: true,
            screenshot_delay: None,
            screenshot_calls: AtomicUsize::new(0),
            markup_calls: AtomicUsize::new(0),
            console_calls: AtomicUsize::new(0),
        }
    }

    pub fn release(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    pub fn captures(&self) -> usize {
        self.screenshot_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DriverSession for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn screenshot(&self) -> HarnessResult<Vec<u8>> {
        self.screenshot_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.screenshot_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.screenshot.clone())
    }

    async fn page_source(&self) -> HarnessResult<String> {
        self.markup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("<html><body>{}</body></html>", self.id))
    }

    async fn console_log(&self) -> HarnessResult<Option<Vec<ConsoleEntry>>> {
        self.console_calls.fetch_add(1, Ordering::SeqCst);
        if !self.console_supported {
            return Ok(None);
        }
        Ok(Some(vec![ConsoleEntry::new(Utc::now(), "SEVERE", "Failed to load resource")]))
    }

    async fn browser_info(&self) -> HarnessResult<Option<BrowserInfo>> {
        if self.id.contains("noinfo") {
            return Err(HarnessError::Capture("capabilities unavailable".to_string()));
        }
        if self.id.contains("bare") {
            return Ok(None);
        }
        Ok(Some(BrowserInfo {
            name: "chrome".to_string(),
            version: Some("120.0".to_string()),
        }))
    }
}

pub fn config(root: &std::path::Path, ceiling: u32) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.suite_name = "integration".to_string();
    config.retry.ceiling = ceiling;
    config.artifacts.root = root.join("artifacts");
    config.artifacts.capture_timeout_ms = 500;
    config.report.output_dir = root.join("reports");
    config
}

pub fn controller(root: &std::path::Path, ceiling: u32) -> (Arc<LifecycleController>, MemoryReportSink) {
    let sink = MemoryReportSink::new();
    let controller = LifecycleController::new(config(root, ceiling), Arc::new(sink.clone()))
        .expect("valid config");
    (Arc::new(controller), sink)
}
