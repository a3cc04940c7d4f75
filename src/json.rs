//! JSON output structures for the CLI.
//!
//! Every command prints one JSON document on stdout; logs go to stderr.

use mlens_events::{ErrorClass, IngestError};
use serde::Serialize;

/// Standard JSON success response wrapper
#[derive(Debug, Clone, Serialize)]
pub struct JsonSuccess<T> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

impl<T> JsonSuccess<T> {
    /// Create a new success response
    pub const fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Standard JSON error response
#[derive(Debug, Clone, Serialize)]
pub struct JsonError {
    pub success: bool,
    pub error: ErrorDetail,
}

/// Top-level failure of a command.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    /// Machine-readable error code (`SCREAMING_SNAKE_CASE`)
    pub code: &'static str,
    pub message: String,
}

impl JsonError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: ErrorDetail {
                code: code.as_str(),
                message: message.into(),
            },
        }
    }
}

/// Error codes for machine-readable errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ConfigInvalid,
    SchemaInvalid,
    InputUnreadable,
    Unknown,
}

impl ErrorCode {
    /// Get the string representation of the error code
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::SchemaInvalid => "SCHEMA_INVALID",
            Self::InputUnreadable => "INPUT_UNREADABLE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Pick a code from an error chain by looking at its root cause.
    #[must_use]
    pub fn classify(err: &anyhow::Error) -> Self {
        if err.chain().any(|e| e.is::<mlens_core::Error>()) {
            Self::ConfigInvalid
        } else if err.chain().any(|e| e.is::<mlens_proto::RegistryError>()) {
            Self::SchemaInvalid
        } else if err.chain().any(|e| e.is::<std::io::Error>()) {
            Self::InputUnreadable
        } else {
            Self::Unknown
        }
    }
}

/// Why one envelope or buffered event was not accepted.
#[derive(Debug, Clone, Serialize)]
pub struct IngestErrorReport {
    pub kind: &'static str,
    pub class: ErrorClass,
    pub message: String,
}

impl From<&IngestError> for IngestErrorReport {
    fn from(err: &IngestError) -> Self {
        Self {
            kind: err.kind(),
            class: err.class(),
            message: err.to_string(),
        }
    }
}
