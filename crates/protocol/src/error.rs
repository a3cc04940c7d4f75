//! Protocol errors
//!
//! Decode and schema failures are kept apart so callers can tell a malformed
//! envelope from a well-formed one that this consumer cannot accept.

use std::path::PathBuf;

use thiserror::Error;

use crate::fields::WireType;
use crate::version::SchemaVersion;
use crate::wire::PayloadKind;

/// Malformed bytes.
///
/// Caused by:
/// - Truncated input or a length prefix beyond the available bytes
/// - Bytes left over after a complete envelope
/// - Field tags out of order, wrong fixed widths, invalid UTF-8
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated input: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("payload length {length} exceeds maximum of {max} bytes")]
    PayloadTooLarge { length: usize, max: usize },

    #[error("{extra} trailing bytes after envelope")]
    TrailingBytes { extra: usize },

    #[error("payload kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        expected: PayloadKind,
        found: PayloadKind,
    },

    #[error("field tag {tag} is out of order after tag {previous}")]
    FieldOrder { tag: u16, previous: u16 },

    #[error("field tag {tag} has unknown wire type {code}")]
    UnknownWireType { tag: u16, code: u8 },

    #[error("field tag {tag}: expected {expected} bytes, found {found}")]
    FieldLength {
        tag: u16,
        expected: usize,
        found: usize,
    },

    #[error("field '{field}' (tag {tag}): expected {expected}, found {found}")]
    TypeMismatch {
        tag: u16,
        field: String,
        expected: WireType,
        found: WireType,
    },

    #[error("missing required field '{field}' (tag {tag})")]
    MissingField { tag: u16, field: String },

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl DecodeError {
    /// Create an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Well-formed message this consumer cannot accept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("no {kind} schema compatible with version {version}")]
    UnknownVersion {
        version: SchemaVersion,
        kind: PayloadKind,
    },

    #[error(
        "field tag {tag} is required by producer version {producer} but unknown to consumer version {consumer}"
    )]
    UnknownRequiredField {
        tag: u16,
        producer: SchemaVersion,
        consumer: SchemaVersion,
    },

    #[error("event type '{event_type}' does not match schema {version}: {reason}")]
    AttributeShape {
        event_type: String,
        version: SchemaVersion,
        reason: String,
    },
}

/// Message cannot be encoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("payload length {length} exceeds maximum of {max} bytes")]
    PayloadTooLarge { length: usize, max: usize },

    #[error("field '{field}' is {length} bytes, exceeding the limit of {max}")]
    FieldTooLarge {
        field: String,
        length: usize,
        max: usize,
    },

    #[error("field '{field}' is not declared by schema {version}")]
    UndeclaredField {
        field: String,
        version: SchemaVersion,
    },

    #[error("schema {version} requires field '{field}'")]
    MissingField {
        field: String,
        version: SchemaVersion,
    },

    #[error("field tag {tag} is set twice")]
    DuplicateTag { tag: u16 },

    #[error("header declares {header} but body is {body}")]
    KindMismatch {
        header: PayloadKind,
        body: PayloadKind,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Failure decoding a typed message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Invalid schema registry definition. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid schema version '{value}'")]
    InvalidVersion { value: String },

    #[error("unknown payload kind '{value}'")]
    UnknownKind { value: String },

    #[error("{kind} schema {version} is registered twice")]
    DuplicateVersion {
        kind: PayloadKind,
        version: SchemaVersion,
    },

    #[error("{kind} schema {version} declares field tag {tag} twice")]
    DuplicateTag {
        kind: PayloadKind,
        version: SchemaVersion,
        tag: u16,
    },

    #[error("{kind} schema {version} is missing required field tag {tag}")]
    MissingCoreField {
        kind: PayloadKind,
        version: SchemaVersion,
        tag: u16,
    },

    #[error("{kind} schema {version}: field tag {tag} must be {expected}")]
    CoreFieldMismatch {
        kind: PayloadKind,
        version: SchemaVersion,
        tag: u16,
        expected: String,
    },

    #[error("{kind} schema {version}: {reason}")]
    InvalidSchema {
        kind: PayloadKind,
        version: SchemaVersion,
        reason: String,
    },

    #[error("failed to read schema file '{path}': {reason}")]
    ReadFailed { path: PathBuf, reason: String },

    #[error("schema file parse error: {reason}")]
    ParseFailed { reason: String },
}
