//! Test units, outcomes and per-attempt context

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::session::DriverSession;

/// One executable test case. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestUnit {
    /// Unique name within the suite
    pub name: String,

    /// Owning suite
    pub suite: String,

    /// Declared parameters, in declaration order
    #[serde(default)]
    pub parameters: Vec<String>,

    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
}

impl TestUnit {
    pub fn new(name: impl Into<String>, suite: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            suite: suite.into(),
            parameters: Vec::new(),
            description: None,
        }
    }

    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = parameters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Result of a single attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed {
        reason: String,
        #[serde(default)]
        stack_frames: Vec<String>,
    },
    Skipped {
        reason: String,
    },
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Passed => OutcomeKind::Passed,
            Outcome::Failed { .. } => OutcomeKind::Failed,
            Outcome::Skipped { .. } => OutcomeKind::Skipped,
        }
    }
}

/// Outcome discriminant, used to tag artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Passed,
    Failed,
    Skipped,
}

impl OutcomeKind {
    /// Tag embedded in artifact file names
    pub fn tag(&self) -> &'static str {
        match self {
            OutcomeKind::Passed => "SUCCESS",
            OutcomeKind::Failed => "FAILURE",
            OutcomeKind::Skipped => "SKIP",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One browser console entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

impl ConsoleEntry {
    pub fn new(timestamp: DateTime<Utc>, level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level: level.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConsoleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.timestamp.to_rfc3339(),
            self.level,
            self.message
        )
    }
}

/// Context handed to every per-test lifecycle callback.
///
/// Carries the unit under test together with the driver session bound to
/// this attempt, so callbacks never need to recover either from thread
/// identity. A retry gets a fresh context with a freshly acquired session.
#[derive(Clone)]
pub struct AttemptContext {
    pub unit: Arc<TestUnit>,
    pub session: Option<Arc<dyn DriverSession>>,
}

impl AttemptContext {
    pub fn new(unit: TestUnit, session: Arc<dyn DriverSession>) -> Self {
        Self {
            unit: Arc::new(unit),
            session: Some(session),
        }
    }

    /// Context for an attempt that has no driver session
    pub fn detached(unit: TestUnit) -> Self {
        Self {
            unit: Arc::new(unit),
            session: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.unit.name
    }
}

impl fmt::Debug for AttemptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptContext")
            .field("unit", &self.unit.name)
            .field("session", &self.session.as_ref().map(|s| s.id().to_string()))
            .finish()
    }
}
