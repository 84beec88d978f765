//! Lifecycle controller
//!
//! Receives runner callbacks, keeps suite counters, consults the retry
//! policy on failure and captures diagnostics once a unit's retries are
//! exhausted.
//!
//! ```text
//!             ┌──────────► Passed
//!   Started ──┼──────────► Skipped
//!      ▲      └─► Failed ──┬─► Retrying ──┐
//!      │                   └─► Exhausted  │
//!      ├──────────────────────────────────┘
//!      └──────── SessionFailed ───► Exhausted
//! ```
//!
//! `SessionFailed` is entered when no driver session could be acquired.
//! It draws on its own retry credit; a unit still there when the suite
//! ends is counted as failed.
//!
//! The controller is shared between workers (`Arc<LifecycleController>`);
//! every callback takes `&self`. Per-unit state is only ever touched by
//! the worker running that unit. Collaborator failures (report sink,
//! diagnostic capture) are logged and reported as warnings, never
//! returned to the caller.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{ArtifactBundle, ArtifactCollector};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::model::{AttemptContext, OutcomeKind, TestUnit};
use crate::report::{ReportEvent, ReportSink, SuiteInfo, SuiteSummary};
use crate::retry::{RetryDecision, RetryPolicy};

/// Per-unit lifecycle state within one suite execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Started,
    Passed,
    Failed,
    Skipped,
    Retrying,
    SessionFailed,
    Exhausted,
}

impl UnitState {
    fn can_become(from: Option<UnitState>, to: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (from, to),
            (None | Some(Retrying), Started)
                | (Some(Started), Passed | Failed | Skipped)
                | (None | Some(Retrying), Skipped)
                | (Some(Failed), Retrying | Exhausted)
                | (None | Some(Started) | Some(Retrying) | Some(SessionFailed), SessionFailed)
                | (Some(SessionFailed), Started | Exhausted)
        )
    }

    /// True once no further transition is allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Passed | UnitState::Skipped | UnitState::Exhausted)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the runner should do after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Re-run the unit with a fresh session
    Retry { attempt: u32, ceiling: u32 },
    /// Retries exhausted; diagnostics were captured into `bundle`
    Terminal { bundle: ArtifactBundle },
    /// Session acquisition kept failing; counted as failed, nothing captured
    SessionExhausted { ceiling: u32 },
}

#[derive(Debug, Default)]
struct Tally {
    passed: u64,
    failed: u64,
    skipped: u64,
    retries: u64,
}

/// State of the suite execution in progress
struct SuiteRun {
    info: SuiteInfo,
    retry: RetryPolicy,
    tally: Mutex<Tally>,
    units: DashMap<String, UnitState>,
    session_errors: DashMap<String, String>,
}

impl SuiteRun {
    fn summary(&self, aborted: bool) -> SuiteSummary {
        let tally = self.tally.lock();
        SuiteSummary {
            suite: self.info.name.clone(),
            execution_id: self.info.execution_id,
            total: tally.passed + tally.failed + tally.skipped,
            passed: tally.passed,
            failed: tally.failed,
            skipped: tally.skipped,
            retries: tally.retries,
            started_at: self.info.started_at,
            ended_at: Utc::now(),
            aborted,
        }
    }
}

/// Orchestrates retries, diagnostics and reporting for one suite at a time
pub struct LifecycleController {
    config: HarnessConfig,
    collector: ArtifactCollector,
    sink: Arc<dyn ReportSink>,
    run: RwLock<Option<Arc<SuiteRun>>>,
}

impl LifecycleController {
    /// Create a controller reporting into `sink`
    pub fn new(config: HarnessConfig, sink: Arc<dyn ReportSink>) -> HarnessResult<Self> {
        config.validate()?;
        Ok(Self {
            collector: ArtifactCollector::new(&config.artifacts),
            config,
            sink,
            run: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    fn current(&self) -> HarnessResult<Arc<SuiteRun>> {
        self.run.read().clone().ok_or(HarnessError::SuiteNotStarted)
    }

    /// Execution id of the suite in progress
    pub fn execution_id(&self) -> Option<Uuid> {
        self.run.read().as_ref().map(|r| r.info.execution_id)
    }

    /// Lifecycle state of a unit in the suite in progress
    pub fn unit_state(&self, name: &str) -> Option<UnitState> {
        let run = self.run.read().clone()?;
        let state = run.units.get(name).map(|s| *s);
        state
    }

    /// Retry credits a unit has consumed in the suite in progress
    pub fn retry_attempts(&self, unit: &TestUnit) -> u32 {
        self.run
            .read()
            .as_ref()
            .map(|r| r.retry.attempts(unit))
            .unwrap_or(0)
    }

    /// Counters as they stand now
    pub fn snapshot(&self) -> Option<SuiteSummary> {
        self.run.read().as_ref().map(|r| r.summary(false))
    }

    /// Begin a suite execution and open the report sink
    pub async fn on_suite_start(&self) -> HarnessResult<SuiteInfo> {
        let info = SuiteInfo {
            name: self.config.suite_name.clone(),
            execution_id: Uuid::new_v4(),
            started_at: Utc::now(),
            system_info: self.config.system_info.clone(),
        };

        {
            let mut slot = self.run.write();
            if let Some(existing) = slot.as_ref() {
                return Err(HarnessError::SuiteAlreadyStarted(existing.info.name.clone()));
            }
            *slot = Some(Arc::new(SuiteRun {
                info: info.clone(),
                retry: RetryPolicy::new(info.execution_id, self.config.retry.ceiling),
                tally: Mutex::new(Tally::default()),
                units: DashMap::new(),
                session_errors: DashMap::new(),
            }));
        }

        if let Err(e) = self.sink.open(&info).await {
            self.run.write().take();
            return Err(e);
        }

        info!(
            "Starting test suite: {} (execution {}, retry ceiling {})",
            info.name, info.execution_id, self.config.retry.ceiling
        );
        for (key, value) in &info.system_info {
            debug!("{} is - {}", key, value);
        }
        Ok(info)
    }

    /// Record the start of an attempt
    pub async fn on_test_start(&self, ctx: &AttemptContext) -> HarnessResult<()> {
        let run = self.current()?;
        self.transition(&run, ctx.name(), UnitState::Started)?;

        let unit = &ctx.unit;
        let retries = run.retry.attempts(unit);
        let mut message = format!("Starting test: {}", unit.name);
        if retries > 0 {
            message.push_str(&format!(" (retry {} of {})", retries, run.retry.ceiling()));
        }
        if !unit.parameters.is_empty() {
            message.push_str(&format!(" with parameters [{}]", unit.parameters.join(", ")));
        }
        if let Some(description) = &unit.description {
            message.push_str(&format!(" - {}", description));
        }

        info!("{}", message);
        self.emit(ReportEvent::info(&unit.name, message)).await;
        Ok(())
    }

    /// Record a passing attempt
    pub async fn on_test_success(&self, ctx: &AttemptContext, duration_ms: u64) -> HarnessResult<()> {
        let run = self.current()?;
        self.transition(&run, ctx.name(), UnitState::Passed)?;
        run.tally.lock().passed += 1;

        info!("✓ {} ({} ms)", ctx.name(), duration_ms);
        self.emit(ReportEvent::pass(ctx.name(), duration_ms)).await;

        let retries = run.retry.attempts(&ctx.unit);
        if retries > 0 {
            self.emit(ReportEvent::info(
                ctx.name(),
                format!("Passed after {} retr{}", retries, if retries == 1 { "y" } else { "ies" }),
            ))
            .await;
        }
        Ok(())
    }

    /// Record a failed attempt and decide between retry and terminal failure.
    ///
    /// On terminal failure diagnostics are captured from `ctx.session`
    /// before this returns, so the runner must release the session only
    /// afterwards.
    pub async fn on_test_failure(
        &self,
        ctx: &AttemptContext,
        reason: &str,
        stack_frames: &[String],
    ) -> HarnessResult<FailureDisposition> {
        let run = self.current()?;
        self.transition(&run, ctx.name(), UnitState::Failed)?;

        match run.retry.decide(&ctx.unit) {
            RetryDecision::Retry { attempt, ceiling } => {
                self.transition(&run, ctx.name(), UnitState::Retrying)?;
                run.tally.lock().retries += 1;

                warn!("Retrying test {} ({} of {}): {}", ctx.name(), attempt, ceiling, reason);
                self.emit(ReportEvent::info(
                    ctx.name(),
                    format!("Retrying, attempt {} of {}: {}", attempt, ceiling, reason),
                ))
                .await;
                Ok(FailureDisposition::Retry { attempt, ceiling })
            }
            RetryDecision::Exhausted { .. } => {
                self.transition(&run, ctx.name(), UnitState::Exhausted)?;
                run.tally.lock().failed += 1;

                error!("✗ {} - {}", ctx.name(), reason);
                let bundle = self.collect_diagnostics(ctx).await;

                let mut event = ReportEvent::fail(ctx.name(), reason, stack_frames.to_vec());
                if let Some(path) = bundle.primary_path() {
                    event = event.with_artifact(path);
                }
                self.emit(event).await;

                Ok(FailureDisposition::Terminal { bundle })
            }
        }
    }

    /// Record a skipped unit. Never consults the retry policy.
    pub async fn on_test_skipped(&self, ctx: &AttemptContext, reason: &str) -> HarnessResult<()> {
        let run = self.current()?;
        self.transition(&run, ctx.name(), UnitState::Skipped)?;
        run.tally.lock().skipped += 1;

        info!("Test skipped: {} - {}", ctx.name(), reason);
        self.emit(ReportEvent::skip(ctx.name(), reason)).await;
        Ok(())
    }

    /// Record that no driver session could be acquired for an attempt.
    ///
    /// Does not consume the unit's application retry credit. Session
    /// failures have their own credit bounded by the same ceiling: while it
    /// lasts the runner may start the unit again, after that the unit is
    /// failed. Nothing is captured since there is no session.
    pub async fn on_session_failure(
        &self,
        ctx: &AttemptContext,
        reason: &str,
    ) -> HarnessResult<FailureDisposition> {
        let run = self.current()?;
        self.transition(&run, ctx.name(), UnitState::SessionFailed)?;
        let message = HarnessError::SessionUnavailable(reason.to_string()).to_string();
        run.session_errors.insert(ctx.name().to_string(), message.clone());

        match run.retry.decide_session(&ctx.unit) {
            RetryDecision::Retry { attempt, ceiling } => {
                run.tally.lock().retries += 1;
                warn!("{} for {}, retrying ({} of {})", message, ctx.name(), attempt, ceiling);
                self.emit(ReportEvent::info(
                    ctx.name(),
                    format!("{}, retrying, attempt {} of {}", message, attempt, ceiling),
                ))
                .await;
                Ok(FailureDisposition::Retry { attempt, ceiling })
            }
            RetryDecision::Exhausted { ceiling } => {
                self.fail_without_session(&run, ctx.name()).await?;
                Ok(FailureDisposition::SessionExhausted { ceiling })
            }
        }
    }

    async fn fail_without_session(&self, run: &SuiteRun, unit: &str) -> HarnessResult<()> {
        self.transition(run, unit, UnitState::Exhausted)?;
        run.tally.lock().failed += 1;

        let message = run
            .session_errors
            .remove(unit)
            .map(|(_, m)| m)
            .unwrap_or_else(|| HarnessError::SessionUnavailable("unknown".to_string()).to_string());
        error!("✗ {} - {}", unit, message);
        self.emit(ReportEvent::fail(unit, message, Vec::new())).await;
        Ok(())
    }

    /// Freeze counters, emit the summary and close the sink
    pub async fn on_suite_finish(&self) -> HarnessResult<SuiteSummary> {
        self.finish(false).await
    }

    /// Finish after an external abort; units still in flight are reported
    /// as warnings and left out of the counters
    pub async fn on_suite_abort(&self, reason: &str) -> HarnessResult<SuiteSummary> {
        let run = self.current()?;
        warn!("Suite {} aborted: {}", run.info.name, reason);
        self.emit(ReportEvent::warning(&run.info.name, format!("Suite aborted: {}", reason)))
            .await;
        self.finish(true).await
    }

    async fn finish(&self, aborted: bool) -> HarnessResult<SuiteSummary> {
        let run = self.run.write().take().ok_or(HarnessError::SuiteNotStarted)?;

        let mut in_flight: Vec<(String, UnitState)> = run
            .units
            .iter()
            .filter(|e| !e.value().is_terminal())
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        in_flight.sort_by(|a, b| a.0.cmp(&b.0));
        let (no_session, in_flight): (Vec<_>, Vec<_>) = in_flight
            .into_iter()
            .partition(|(_, state)| *state == UnitState::SessionFailed);

        for (name, _) in no_session {
            if let Err(e) = self.fail_without_session(&run, &name).await {
                warn!("Could not settle {}: {}", name, e);
            }
        }
        for (name, state) in in_flight {
            warn!("{} did not finish (last state {})", name, state);
            self.emit(ReportEvent::warning(
                &name,
                format!("No terminal outcome before suite end (last state {})", state),
            ))
            .await;
        }

        let summary = run.summary(aborted);
        run.retry.clear();

        if let Err(e) = self.sink.finish(&summary).await {
            warn!("Report sink rejected summary: {}", e);
        }
        if let Err(e) = self.sink.close().await {
            warn!("Failed to close report sink: {}", e);
        }

        info!(
            "Test Results: {} passed, {} failed, {} skipped, {} retries ({} ms)",
            summary.passed,
            summary.failed,
            summary.skipped,
            summary.retries,
            summary.duration_ms()
        );
        info!("Finished test suite: {}", summary.suite);
        Ok(summary)
    }

    /// Browser info plus artifact bundle for a terminal failure
    async fn collect_diagnostics(&self, ctx: &AttemptContext) -> ArtifactBundle {
        let session = ctx.session.as_deref();

        if let Some(session) = session.filter(|s| s.is_live()) {
            let timeout = self.config.artifacts.capture_timeout();
            match tokio::time::timeout(timeout, session.browser_info()).await {
                Ok(Ok(Some(browser))) => {
                    let version = browser.version.as_deref().unwrap_or("unknown version");
                    self.emit(ReportEvent::info(
                        ctx.name(),
                        format!("Browser: {} {}", browser.name, version),
                    ))
                    .await;
                }
                Ok(Ok(None)) => debug!("Session {} does not report browser info", session.id()),
                Ok(Err(e)) => self.warn(ctx.name(), format!("Browser info unavailable: {}", e)).await,
                Err(_) => {
                    self.warn(ctx.name(), "Browser info timed out".to_string()).await
                }
            }
        }

        let bundle = self
            .collector
            .capture(&ctx.unit, session, OutcomeKind::Failed)
            .await;

        for failure in &bundle.failures {
            self.warn(ctx.name(), format!("Diagnostic capture: {}", failure)).await;
        }

        if !bundle.is_empty() {
            if let Err(e) = self.sink.attach(bundle.clone()).await {
                warn!("Report sink rejected artifact bundle for {}: {}", ctx.name(), e);
            }
        }
        bundle
    }

    fn transition(&self, run: &SuiteRun, unit: &str, to: UnitState) -> HarnessResult<()> {
        let invalid = |from: Option<UnitState>| HarnessError::InvalidTransition {
            unit: unit.to_string(),
            from: from.map(|s| s.to_string()).unwrap_or_else(|| "None".to_string()),
            to: to.to_string(),
        };

        match run.units.entry(unit.to_string()) {
            Entry::Occupied(mut entry) => {
                let from = *entry.get();
                if !UnitState::can_become(Some(from), to) {
                    return Err(invalid(Some(from)));
                }
                entry.insert(to);
            }
            Entry::Vacant(entry) => {
                if !UnitState::can_become(None, to) {
                    return Err(invalid(None));
                }
                entry.insert(to);
            }
        }
        Ok(())
    }

    async fn warn(&self, test_name: &str, message: String) {
        warn!("{}: {}", test_name, message);
        self.emit(ReportEvent::warning(test_name, message)).await;
    }

    async fn emit(&self, event: ReportEvent) {
        if let Err(e) = self.sink.append(event).await {
            warn!("Report sink rejected event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{EventStatus, MemoryReportSink};
    use tempfile::TempDir;

    fn controller(tmp: &TempDir, ceiling: u32) -> (LifecycleController, MemoryReportSink) {
        let mut config = HarnessConfig::default();
        config.suite_name = "unit".to_string();
        config.retry.ceiling = ceiling;
        config.artifacts.root = tmp.path().join("artifacts");
        let sink = MemoryReportSink::new();
        let controller = LifecycleController::new(config, Arc::new(sink.clone())).unwrap();
        (controller, sink)
    }

    fn ctx(name: &str) -> AttemptContext {
        AttemptContext::detached(TestUnit::new(name, "unit"))
    }

    #[test]
    fn test_state_machine_edges() {
        use UnitState::*;
        assert!(UnitState::can_become(None, Started));
        assert!(UnitState::can_become(Some(Retrying), Started));
        assert!(UnitState::can_become(Some(Failed), Exhausted));
        assert!(UnitState::can_become(Some(Started), SessionFailed));
        assert!(UnitState::can_become(Some(SessionFailed), Started));
        assert!(!UnitState::can_become(Some(SessionFailed), Passed));
        assert!(!UnitState::can_become(Some(Exhausted), SessionFailed));
        assert!(!UnitState::can_become(Some(Passed), Started));
        assert!(!UnitState::can_become(Some(Exhausted), Started));
        assert!(!UnitState::can_become(None, Passed));
        assert!(!UnitState::can_become(Some(Started), Started));
    }

    #[tokio::test]
    async fn test_callbacks_require_started_suite() {
        let tmp = TempDir::new().unwrap();
        let (controller, _) = controller(&tmp, 3);
        let err = controller.on_test_start(&ctx("Login")).await.unwrap_err();
        assert!(matches!(err, HarnessError::SuiteNotStarted));
        assert!(matches!(
            controller.on_suite_finish().await.unwrap_err(),
            HarnessError::SuiteNotStarted
        ));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let tmp = TempDir::new().unwrap();
        let (controller, _) = controller(&tmp, 3);
        controller.on_suite_start().await.unwrap();
        assert!(matches!(
            controller.on_suite_start().await.unwrap_err(),
            HarnessError::SuiteAlreadyStarted(_)
        ));
    }

    #[tokio::test]
    async fn test_success_without_start_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let (controller, _) = controller(&tmp, 3);
        controller.on_suite_start().await.unwrap();

        let err = controller.on_test_success(&ctx("Login"), 5).await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidTransition { .. }));
        assert_eq!(controller.snapshot().unwrap().passed, 0);
    }

    #[tokio::test]
    async fn test_start_event_includes_parameters() {
        let tmp = TempDir::new().unwrap();
        let (controller, sink) = controller(&tmp, 3);
        controller.on_suite_start().await.unwrap();

        let unit = TestUnit::new("Search", "unit").with_parameters(["fund", "VNQ"]);
        controller.on_test_start(&AttemptContext::detached(unit)).await.unwrap();

        let events = sink.events_for("Search");
        assert_eq!(events[0].status, EventStatus::Info);
        assert!(events[0].message.contains("with parameters [fund, VNQ]"));
    }

    #[tokio::test]
    async fn test_retry_then_pass_is_reported_as_passed() {
        let tmp = TempDir::new().unwrap();
        let (controller, sink) = controller(&tmp, 3);
        controller.on_suite_start().await.unwrap();

        let login = ctx("Login");
        for _ in 0..2 {
            controller.on_test_start(&login).await.unwrap();
            let disposition = controller.on_test_failure(&login, "not found", &[]).await.unwrap();
            assert!(matches!(disposition, FailureDisposition::Retry { .. }));
        }
        controller.on_test_start(&login).await.unwrap();
        controller.on_test_success(&login, 120).await.unwrap();

        let summary = controller.on_suite_finish().await.unwrap();
        assert_eq!((summary.total, summary.passed, summary.failed), (1, 1, 0));
        assert_eq!(summary.retries, 2);
        assert!(sink.bundles().is_empty());
        assert!(sink
            .events_for("Login")
            .iter()
            .all(|e| e.status != EventStatus::Fail));
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_terminal_failure_without_session_still_reports_once() {
        let tmp = TempDir::new().unwrap();
        let (controller, sink) = controller(&tmp, 0);
        controller.on_suite_start().await.unwrap();

        let checkout = ctx("Checkout");
        controller.on_test_start(&checkout).await.unwrap();
        let disposition = controller
            .on_test_failure(&checkout, "boom", &["at checkout()".to_string()])
            .await
            .unwrap();

        match disposition {
            FailureDisposition::Terminal { bundle } => assert!(bundle.is_empty()),
            other => panic!("expected terminal failure, got {:?}", other),
        }

        let events = sink.events_for("Checkout");
        let fails: Vec<_> = events.iter().filter(|e| e.status == EventStatus::Fail).collect();
        assert_eq!(fails.len(), 1);
        assert_eq!(fails[0].stack_frames, vec!["at checkout()"]);
        assert!(events.iter().any(|e| e.status == EventStatus::Warning));

        assert!(matches!(
            controller.on_test_start(&checkout).await.unwrap_err(),
            HarnessError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn test_skip_does_not_touch_retry_policy() {
        let tmp = TempDir::new().unwrap();
        let (controller, sink) = controller(&tmp, 3);
        controller.on_suite_start().await.unwrap();

        let unit = ctx("Disabled");
        controller.on_test_skipped(&unit, "dependency failed").await.unwrap();

        assert_eq!(controller.retry_attempts(&unit.unit), 0);
        assert_eq!(controller.unit_state("Disabled"), Some(UnitState::Skipped));
        let summary = controller.on_suite_finish().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(sink.events_for("Disabled")[0].status, EventStatus::Skip);
    }

    #[tokio::test]
    async fn test_session_failure_leaves_unit_startable() {
        let tmp = TempDir::new().unwrap();
        let (controller, sink) = controller(&tmp, 3);
        controller.on_suite_start().await.unwrap();

        let unit = ctx("Grid");
        let disposition = controller.on_session_failure(&unit, "grid unreachable").await.unwrap();
        assert_eq!(disposition, FailureDisposition::Retry { attempt: 1, ceiling: 3 });
        assert_eq!(controller.unit_state("Grid"), Some(UnitState::SessionFailed));

        controller.on_test_start(&unit).await.unwrap();
        controller.on_test_success(&unit, 40).await.unwrap();

        assert_eq!(controller.retry_attempts(&unit.unit), 0);
        let summary = controller.on_suite_finish().await.unwrap();
        assert_eq!((summary.total, summary.passed, summary.failed), (1, 1, 0));
        let events = sink.events_for("Grid");
        assert!(events[0].message.contains("grid unreachable"));
        assert!(events.iter().all(|e| e.status != EventStatus::Fail));
    }

    #[tokio::test]
    async fn test_session_failures_bounded_by_ceiling() {
        let tmp = TempDir::new().unwrap();
        let (controller, sink) = controller(&tmp, 2);
        controller.on_suite_start().await.unwrap();

        let unit = ctx("Grid");
        controller.on_test_start(&unit).await.unwrap();
        for attempt in 1..=2 {
            let disposition = controller.on_session_failure(&unit, "grid unreachable").await.unwrap();
            assert_eq!(disposition, FailureDisposition::Retry { attempt, ceiling: 2 });
            controller.on_test_start(&unit).await.unwrap();
        }
        let disposition = controller.on_session_failure(&unit, "grid down").await.unwrap();
        assert_eq!(disposition, FailureDisposition::SessionExhausted { ceiling: 2 });

        assert!(matches!(
            controller.on_test_start(&unit).await.unwrap_err(),
            HarnessError::InvalidTransition { .. }
        ));
        let summary = controller.on_suite_finish().await.unwrap();
        assert_eq!((summary.total, summary.failed), (1, 1));
        assert!(sink.bundles().is_empty());
        let fails: Vec<_> = sink
            .events_for("Grid")
            .into_iter()
            .filter(|e| e.status == EventStatus::Fail)
            .collect();
        assert_eq!(fails.len(), 1);
        assert!(fails[0].message.contains("grid down"));
    }

    #[tokio::test]
    async fn test_session_failure_not_restarted_counts_as_failed() {
        let tmp = TempDir::new().unwrap();
        let (controller, sink) = controller(&tmp, 3);
        controller.on_suite_start().await.unwrap();

        controller.on_session_failure(&ctx("Grid"), "grid unreachable").await.unwrap();

        let summary = controller.on_suite_finish().await.unwrap();
        assert_eq!((summary.total, summary.failed), (1, 1));
        let events = sink.events_for("Grid");
        assert_eq!(events.iter().filter(|e| e.status == EventStatus::Fail).count(), 1);
        assert!(events.iter().all(|e| e.status != EventStatus::Warning));
    }

    #[tokio::test]
    async fn test_abort_flushes_summary_and_warns_in_flight() {
        let tmp = TempDir::new().unwrap();
        let (controller, sink) = controller(&tmp, 3);
        controller.on_suite_start().await.unwrap();

        controller.on_test_start(&ctx("Done")).await.unwrap();
        controller.on_test_success(&ctx("Done"), 1).await.unwrap();
        controller.on_test_start(&ctx("Hanging")).await.unwrap();

        let summary = controller.on_suite_abort("global timeout").await.unwrap();
        assert!(summary.aborted);
        assert!(!summary.success());
        assert_eq!((summary.total, summary.passed), (1, 1));
        assert_eq!(sink.summary(), Some(summary));
        assert!(sink
            .events_for("Hanging")
            .iter()
            .any(|e| e.status == EventStatus::Warning));
        assert!(controller.execution_id().is_none());
    }
}
