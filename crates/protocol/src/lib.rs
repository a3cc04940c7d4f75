//! mlens protocol - versioned envelopes for experiment lifecycle messages and
//! telemetry events.
//!
//! # Envelope
//!
//! Every message is a self-describing envelope. All integers are big-endian.
//!
//! ```text
//! +----------------+----------------+----------------+------+
//! | major (u16)    | minor (u16)    | patch (u16)    | kind |
//! +----------------+----------------+----------------+------+
//! | message id (16 bytes, ULID)                             |
//! +---------------------------------------------------------+
//! | produced_at (i64, microseconds since the Unix epoch)    |
//! +---------------------------------------------------------+
//! | payload length N (u32) | payload (N bytes)              |
//! +---------------------------------------------------------+
//! ```
//!
//! Kind `1` is an experiment lifecycle message, kind `2` a telemetry event.
//! Any other kind is carried opaquely so producers can introduce new kinds
//! before consumers understand them.
//!
//! # Payload
//!
//! A payload is a sequence of fields in strictly ascending tag order:
//!
//! ```text
//! +-----------+-----------+-------------+-------------------+
//! | tag (u16) | flags(u8) | length (u32)| value (length)    |
//! +-----------+-----------+-------------+-------------------+
//! ```
//!
//! The low nibble of `flags` is the wire type; bit 7 marks a field the
//! producer considers required. Fields a consumer does not know are kept
//! verbatim and re-emitted on encode, which is what makes minor version bumps
//! forward compatible.
//!
//! # Constraints
//!
//! - Maximum payload size: 1MB (1,048,576 bytes)
//! - Trailing bytes after a complete envelope are rejected
//! - Versions are compatible when their major versions match
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use mlens_proto::{
//!     Codec, ExperimentId, ExperimentMessage, LifecycleAction, Message, MessageBody, MessageId,
//!     PayloadKind, SchemaRegistry, SchemaVersion,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let codec = Codec::new(Arc::new(SchemaRegistry::builtin()));
//! let body = MessageBody::Experiment(ExperimentMessage::new(
//!     ExperimentId::parse("exp-1")?,
//!     LifecycleAction::Create,
//! ));
//! let message = Message::new(SchemaVersion::V1_0, MessageId::new(), 0, body);
//!
//! let bytes = codec.encode(&message)?;
//! let decoded = codec.decode(&bytes, PayloadKind::Experiment)?;
//! assert_eq!(decoded, message);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod codec;
mod digest;
mod error;
mod fields;
mod ids;
mod message;
mod registry;
mod version;
mod wire;

pub use codec::Codec;
pub use digest::ContentDigest;
pub use error::{CodecError, DecodeError, EncodeError, RegistryError, SchemaError};
pub use fields::{Attributes, FieldSet, RawField, Scalar, WireType};
pub use ids::{ExperimentId, MAX_EXPERIMENT_ID_LEN, MessageId};
pub use message::{
    Event, EventKind, ExperimentMessage, LifecycleAction, Message, MessageBody, tags,
};
pub use registry::{
    AttributeType, EventShape, FieldSpec, MessageSchema, SchemaRegistry,
    is_compatible,
};
pub use version::SchemaVersion;
pub use wire::{EnvelopeHeader, PayloadKind, RawEnvelope};

/// Maximum allowed payload size in bytes (1MB)
pub const MAX_PAYLOAD_SIZE: usize = 1_048_576;

/// Envelope header size in bytes (version, kind, id, timestamp, length)
pub const ENVELOPE_HEADER_SIZE: usize = 35;

/// Maximum envelope size (header + max payload)
pub const MAX_ENVELOPE_SIZE: usize = ENVELOPE_HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Size of a field header inside a payload (tag, flags, length)
pub const FIELD_HEADER_SIZE: usize = 7;
