//! Error types for the events crate.
//!
//! Every ingestion failure is an [`IngestError`] with a [`ErrorClass`] so
//! callers can decide whether to drop, retry, or stop.

use mlens_proto::{CodecError, DecodeError, ExperimentId, SchemaError};
use serde::Serialize;
use thiserror::Error;

use crate::types::ExperimentState;

/// Result of ingesting a single envelope.
pub type IngestResult = std::result::Result<crate::pipeline::Accepted, IngestError>;

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The message itself is unacceptable. Retrying will not help.
    Rejected,
    /// Transient storage failure. The same message may be retried.
    Retryable,
    /// The pipeline or its storage cannot continue.
    Fatal,
}

/// Append-only log failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("log unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("log is closed")]
    Closed,
}

impl LogError {
    /// Create an unavailable error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Why an envelope was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("decode failed: {0}")]
    Decode(DecodeError),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(SchemaError),

    #[error("experiment '{experiment_id}' cannot {attempted} while {state}")]
    InvalidTransition {
        experiment_id: ExperimentId,
        state: ExperimentState,
        attempted: String,
    },

    #[error("experiment '{experiment_id}' does not exist")]
    UnknownExperiment { experiment_id: ExperimentId },

    #[error("storage failure: {0}")]
    Storage(#[from] LogError),

    #[error("pipeline is shut down")]
    ShutDown,
}

impl IngestError {
    /// Create an invalid transition error.
    pub fn invalid_transition(
        experiment_id: &ExperimentId,
        state: ExperimentState,
        attempted: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            experiment_id: experiment_id.clone(),
            state,
            attempted: attempted.into(),
        }
    }

    /// Create an unknown experiment error.
    pub fn unknown_experiment(experiment_id: &ExperimentId) -> Self {
        Self::UnknownExperiment {
            experiment_id: experiment_id.clone(),
        }
    }

    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Decode(_)
            | Self::SchemaMismatch(_)
            | Self::InvalidTransition { .. }
            | Self::UnknownExperiment { .. } => ErrorClass::Rejected,
            Self::Storage(e) if e.is_retryable() => ErrorClass::Retryable,
            Self::Storage(_) | Self::ShutDown => ErrorClass::Fatal,
        }
    }

    /// Short machine-readable name of the variant.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode_error",
            Self::SchemaMismatch(_) => "schema_mismatch",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::UnknownExperiment { .. } => "unknown_experiment",
            Self::Storage(_) => "storage",
            Self::ShutDown => "shut_down",
        }
    }
}

impl From<DecodeError> for IngestError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<SchemaError> for IngestError {
    fn from(e: SchemaError) -> Self {
        Self::SchemaMismatch(e)
    }
}

impl From<CodecError> for IngestError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Decode(e) => Self::Decode(e),
            CodecError::Schema(e) => Self::SchemaMismatch(e),
        }
    }
}
