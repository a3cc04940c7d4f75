//! Core types for the events crate.

use std::fmt;

use mlens_proto::{ExperimentId, LifecycleAction};
use serde::{Serialize, Serializer};

/// Position of an entry within one log partition. Starts at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct Offset(u64);

impl Offset {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Log partition an envelope is appended to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionKey {
    /// `experiment/<id>`: lifecycle messages and events of one experiment.
    Experiment(ExperimentId),
    /// `opaque`: envelopes of payload kinds this consumer does not know.
    Opaque,
}

impl PartitionKey {
    #[must_use]
    pub const fn experiment_id(&self) -> Option<&ExperimentId> {
        match self {
            Self::Experiment(id) => Some(id),
            Self::Opaque => None,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Experiment(id) => write!(f, "experiment/{id}"),
            Self::Opaque => f.write_str("opaque"),
        }
    }
}

impl Serialize for PartitionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One record read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub partition: PartitionKey,
    pub offset: Offset,
    /// The envelope exactly as it was ingested.
    pub bytes: Vec<u8>,
}

/// Lifecycle states of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    Created,
    Running,
    Paused,
    /// Terminal: finished successfully.
    Completed,
    /// Terminal: aborted.
    Failed,
}

impl ExperimentState {
    /// Check if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// State reached by applying `action`, if the transition is allowed.
    ///
    /// `create` is never valid from an existing state.
    #[must_use]
    pub const fn apply(&self, action: LifecycleAction) -> Option<Self> {
        use ExperimentState::{Completed, Created, Failed, Paused, Running};
        use LifecycleAction::{Complete, Fail, Pause, Resume, Start};

        match (self, action) {
            (Created, Start) | (Paused, Resume) => Some(Running),
            (Running, Pause) => Some(Paused),
            (Running | Paused, Complete) => Some(Completed),
            (Created | Running | Paused, Fail) => Some(Failed),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
