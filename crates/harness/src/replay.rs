//! Drive a [`LifecycleController`] from a JSON-lines runner event stream
//!
//! ```text
//! {"event":"suite_start"}
//! {"event":"test_start","name":"Login","params":["admin"],"cdp_endpoint":"http://127.0.0.1:9222"}
//! {"event":"test_failure","name":"Login","reason":"element not found","stack_frames":["at login()"]}
//! {"event":"test_start","name":"Login","cdp_endpoint":"http://127.0.0.1:9222"}
//! {"event":"test_success","name":"Login","duration_ms":812}
//! {"event":"suite_finish"}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use crate::cdp::CdpSession;
use crate::controller::{FailureDisposition, LifecycleController};
use crate::error::{HarnessError, HarnessResult};
use crate::model::{AttemptContext, TestUnit};
use crate::report::SuiteSummary;
use crate::session::DriverSession;

/// One runner callback, as recorded on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunnerEvent {
    SuiteStart,
    TestStart {
        name: String,
        #[serde(default)]
        params: Vec<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        cdp_endpoint: Option<String>,
    },
    TestSuccess {
        name: String,
        duration_ms: u64,
    },
    TestFailure {
        name: String,
        reason: String,
        #[serde(default)]
        stack_frames: Vec<String>,
    },
    TestSkip {
        name: String,
        reason: String,
    },
    SessionFailure {
        name: String,
        reason: String,
    },
    SuiteFinish,
    SuiteAbort {
        reason: String,
    },
}

struct Attempt {
    ctx: AttemptContext,
    session: Option<Arc<CdpSession>>,
}

impl Attempt {
    /// Release the session once the controller is done with the attempt
    fn release(self) {
        if let Some(session) = self.session {
            session.release();
        }
    }
}

/// Feeds runner events into a controller, one attempt context per test start
pub struct Replay {
    controller: Arc<LifecycleController>,
    attempts: HashMap<String, Attempt>,
    sessions_opened: u64,
    started: bool,
    summary: Option<SuiteSummary>,
}

impl Replay {
    pub fn new(controller: Arc<LifecycleController>) -> Self {
        Self {
            controller,
            attempts: HashMap::new(),
            sessions_opened: 0,
            started: false,
            summary: None,
        }
    }

    fn suite(&self) -> &str {
        &self.controller.config().suite_name
    }

    fn unit(&self, name: &str) -> TestUnit {
        TestUnit::new(name, self.suite())
    }

    /// Context of the attempt in progress for `name`, or a detached one
    fn take_attempt(&mut self, name: &str) -> Attempt {
        self.attempts.remove(name).unwrap_or_else(|| Attempt {
            ctx: AttemptContext::detached(self.unit(name)),
            session: None,
        })
    }

    /// Apply one event
    pub async fn apply(&mut self, event: RunnerEvent) -> HarnessResult<()> {
        if self.summary.is_some() {
            return Err(HarnessError::SuiteNotStarted);
        }

        match event {
            RunnerEvent::SuiteStart => {
                self.controller.on_suite_start().await?;
                self.started = true;
            }
            RunnerEvent::TestStart {
                name,
                params,
                description,
                cdp_endpoint,
            } => {
                if let Some(previous) = self.attempts.remove(&name) {
                    previous.release();
                }

                let mut unit = self.unit(&name).with_parameters(params);
                unit.description = description;

                let attempt = match cdp_endpoint {
                    Some(endpoint) => {
                        self.sessions_opened += 1;
                        let session = Arc::new(CdpSession::new(
                            format!("{}#{}", name, self.sessions_opened),
                            endpoint,
                        ));
                        let dyn_session: Arc<dyn DriverSession> = session.clone();
                        Attempt {
                            ctx: AttemptContext::new(unit, dyn_session),
                            session: Some(session),
                        }
                    }
                    None => Attempt {
                        ctx: AttemptContext::detached(unit),
                        session: None,
                    },
                };

                self.controller.on_test_start(&attempt.ctx).await?;
                self.attempts.insert(name, attempt);
            }
            RunnerEvent::TestSuccess { name, duration_ms } => {
                let attempt = self.take_attempt(&name);
                let result = self.controller.on_test_success(&attempt.ctx, duration_ms).await;
                attempt.release();
                result?;
            }
            RunnerEvent::TestFailure {
                name,
                reason,
                stack_frames,
            } => {
                let attempt = self.take_attempt(&name);
                let result = self
                    .controller
                    .on_test_failure(&attempt.ctx, &reason, &stack_frames)
                    .await;
                attempt.release();
                log_disposition(&name, &result?);
            }
            RunnerEvent::TestSkip { name, reason } => {
                let attempt = self.take_attempt(&name);
                let result = self.controller.on_test_skipped(&attempt.ctx, &reason).await;
                attempt.release();
                result?;
            }
            RunnerEvent::SessionFailure { name, reason } => {
                let attempt = self.take_attempt(&name);
                let result = self.controller.on_session_failure(&attempt.ctx, &reason).await;
                attempt.release();
                log_disposition(&name, &result?);
            }
            RunnerEvent::SuiteFinish => {
                self.release_all();
                self.summary = Some(self.controller.on_suite_finish().await?);
            }
            RunnerEvent::SuiteAbort { reason } => {
                self.release_all();
                self.summary = Some(self.controller.on_suite_abort(&reason).await?);
            }
        }
        Ok(())
    }

    fn release_all(&mut self) {
        for (_, attempt) in self.attempts.drain() {
            attempt.release();
        }
    }

    /// Replay a whole stream. Blank lines and `#` comments are ignored.
    ///
    /// If the stream ends, or a line is rejected, before the suite
    /// finished, the suite is aborted so its summary is still flushed.
    pub async fn run<R>(mut self, reader: R) -> HarnessResult<SuiteSummary>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut line_no = 0;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let outcome = match serde_json::from_str::<RunnerEvent>(trimmed) {
                Ok(event) => self.apply(event).await,
                Err(e) => Err(HarnessError::Json(e)),
            };

            if let Err(e) = outcome {
                let err = HarnessError::RunnerEvent {
                    line: line_no,
                    reason: e.to_string(),
                };
                if self.started && self.summary.is_none() {
                    self.release_all();
                    if let Err(abort_err) = self.controller.on_suite_abort(&err.to_string()).await {
                        warn!("Failed to abort suite: {}", abort_err);
                    }
                }
                return Err(err);
            }
        }

        match self.summary.take() {
            Some(summary) => Ok(summary),
            None if self.started => {
                self.release_all();
                self.controller
                    .on_suite_abort("runner event stream ended without suite_finish")
                    .await
            }
            None => Err(HarnessError::SuiteNotStarted),
        }
    }
}

fn log_disposition(name: &str, disposition: &FailureDisposition) {
    match disposition {
        FailureDisposition::Retry { attempt, ceiling } => {
            debug!("{} scheduled for retry {} of {}", name, attempt, ceiling);
        }
        FailureDisposition::Terminal { bundle } => {
            debug!("{} failed terminally with {} artifact(s)", name, bundle.artifacts().count());
        }
        FailureDisposition::SessionExhausted { ceiling } => {
            debug!("{} failed, no session after {} retries", name, ceiling);
        }
    }
}
