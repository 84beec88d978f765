//! Retry bookkeeping for failing test units

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::model::TestUnit;

/// Retry credit consumed so far by one unit in one suite execution.
///
/// Application failures and session-acquisition failures draw on separate
/// credits, each bounded by the same ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptState {
    pub attempts: u32,
    #[serde(default)]
    pub session_retries: u32,
    pub ceiling: u32,
}

impl AttemptState {
    fn new(ceiling: u32) -> Self {
        Self {
            attempts: 0,
            session_retries: 0,
            ceiling,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.ceiling
    }

    pub fn session_exhausted(&self) -> bool {
        self.session_retries >= self.ceiling
    }
}

/// Answer to "should this failure run again?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again; `attempt` is the retry number just granted (1-based)
    Retry { attempt: u32, ceiling: u32 },
    /// No credit left
    Exhausted { ceiling: u32 },
}

impl RetryDecision {
    pub fn should_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

/// Per-unit retry policy scoped to one suite execution.
///
/// Every call that grants a retry consumes one credit, so the policy must
/// only be consulted after a failed attempt. State is keyed by
/// `(execution id, unit name)` and never shared between units.
#[derive(Debug)]
pub struct RetryPolicy {
    execution_id: Uuid,
    ceiling: u32,
    states: DashMap<(Uuid, String), AttemptState>,
}

impl RetryPolicy {
    pub fn new(execution_id: Uuid, ceiling: u32) -> Self {
        Self {
            execution_id,
            ceiling,
            states: DashMap::new(),
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    fn key(&self, unit: &TestUnit) -> (Uuid, String) {
        (self.execution_id, unit.name.clone())
    }

    /// Decide whether a failed unit runs again, consuming a credit if so
    pub fn decide(&self, unit: &TestUnit) -> RetryDecision {
        // The entry guard holds the shard lock, so check-and-increment is atomic per unit.
        let mut state = self
            .states
            .entry(self.key(unit))
            .or_insert_with(|| AttemptState::new(self.ceiling));

        if state.exhausted() {
            debug!("Retries exhausted for {} ({} of {})", unit.name, state.attempts, state.ceiling);
            RetryDecision::Exhausted {
                ceiling: state.ceiling,
            }
        } else {
            state.attempts += 1;
            debug!("Retrying {} ({} of {})", unit.name, state.attempts, state.ceiling);
            RetryDecision::Retry {
                attempt: state.attempts,
                ceiling: state.ceiling,
            }
        }
    }

    /// Decide whether a unit whose session could not be acquired runs
    /// again. Leaves the application-failure credit untouched.
    pub fn decide_session(&self, unit: &TestUnit) -> RetryDecision {
        let mut state = self
            .states
            .entry(self.key(unit))
            .or_insert_with(|| AttemptState::new(self.ceiling));

        if state.session_exhausted() {
            debug!(
                "Session retries exhausted for {} ({} of {})",
                unit.name, state.session_retries, state.ceiling
            );
            RetryDecision::Exhausted {
                ceiling: state.ceiling,
            }
        } else {
            state.session_retries += 1;
            RetryDecision::Retry {
                attempt: state.session_retries,
                ceiling: state.ceiling,
            }
        }
    }

    /// Boolean form of [`RetryPolicy::decide`]
    pub fn should_retry(&self, unit: &TestUnit) -> bool {
        self.decide(unit).should_retry()
    }

    /// Current state for a unit, if it has failed at least once
    pub fn state(&self, unit: &TestUnit) -> Option<AttemptState> {
        self.states.get(&self.key(unit)).map(|s| *s)
    }

    /// Retry credits consumed so far by a unit
    pub fn attempts(&self, unit: &TestUnit) -> u32 {
        self.state(unit).map(|s| s.attempts).unwrap_or(0)
    }

    /// Drop all per-unit state at the end of the suite execution
    pub fn clear(&self) {
        self.states.clear();
    }
}
