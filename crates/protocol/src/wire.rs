//! Envelope framing.
//!
//! [`RawEnvelope`] splits bytes into header and payload without consulting a
//! schema, so deduplication and routing can happen before the payload is
//! interpreted.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::error::{DecodeError, EncodeError};
use crate::ids::MessageId;
use crate::version::SchemaVersion;
use crate::{ENVELOPE_HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Payload kind discriminator (one byte on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PayloadKind {
    Experiment,
    Event,
    /// A kind this consumer does not understand; passed through untouched.
    Unknown(u8),
}

impl PayloadKind {
    pub const EXPERIMENT_CODE: u8 = 1;
    pub const EVENT_CODE: u8 = 2;

    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            Self::EXPERIMENT_CODE => Self::Experiment,
            Self::EVENT_CODE => Self::Event,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::Experiment => Self::EXPERIMENT_CODE,
            Self::Event => Self::EVENT_CODE,
            Self::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Experiment => f.write_str("experiment"),
            Self::Event => f.write_str("event"),
            Self::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

impl Serialize for PayloadKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Fixed-size envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EnvelopeHeader {
    pub schema_version: SchemaVersion,
    pub payload_kind: PayloadKind,
    pub message_id: MessageId,
    /// Producer timestamp, microseconds since the Unix epoch.
    pub produced_at_micros: i64,
}

impl EnvelopeHeader {
    #[must_use]
    pub const fn new(
        schema_version: SchemaVersion,
        payload_kind: PayloadKind,
        message_id: MessageId,
        produced_at_micros: i64,
    ) -> Self {
        Self {
            schema_version,
            payload_kind,
            message_id,
            produced_at_micros,
        }
    }

    /// Producer timestamp as a UTC datetime, if representable.
    #[must_use]
    pub fn produced_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.produced_at_micros)
    }

    fn write_to(&self, payload_len: u32, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.schema_version.major.to_be_bytes());
        out.extend_from_slice(&self.schema_version.minor.to_be_bytes());
        out.extend_from_slice(&self.schema_version.patch.to_be_bytes());
        out.push(self.payload_kind.code());
        out.extend_from_slice(&self.message_id.to_bytes());
        out.extend_from_slice(&self.produced_at_micros.to_be_bytes());
        out.extend_from_slice(&payload_len.to_be_bytes());
    }
}

/// An envelope whose payload has not been interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEnvelope {
    pub header: EnvelopeHeader,
    pub payload: Vec<u8>,
}

impl RawEnvelope {
    #[must_use]
    pub const fn new(header: EnvelopeHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// Decode exactly one envelope.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the input is truncated, the payload is too
    /// large, or bytes remain after the envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (envelope, consumed) = Self::decode_prefix(bytes)?;
        let extra = bytes.len().saturating_sub(consumed);
        if extra > 0 {
            return Err(DecodeError::TrailingBytes { extra });
        }
        Ok(envelope)
    }

    /// Decode one envelope from the front of `bytes`, returning the number of
    /// bytes consumed. Used to walk concatenated envelopes.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the input is truncated or the payload is too
    /// large.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, usize), DecodeError> {
        let mut reader = Reader::new(bytes);
        let schema_version =
            SchemaVersion::new(reader.read_u16()?, reader.read_u16()?, reader.read_u16()?);
        let payload_kind = PayloadKind::from_code(reader.read_u8()?);
        let message_id = MessageId::from_bytes(reader.read_array::<16>()?);
        let produced_at_micros = reader.read_i64()?;
        let length = usize::try_from(reader.read_u32()?).unwrap_or(usize::MAX);
        if length > MAX_PAYLOAD_SIZE {
            return Err(DecodeError::PayloadTooLarge {
                length,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let payload = reader.take(length)?.to_vec();

        let header = EnvelopeHeader::new(
            schema_version,
            payload_kind,
            message_id,
            produced_at_micros,
        );
        Ok((Self::new(header, payload), reader.position()))
    }

    /// Encode header and payload.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::PayloadTooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let too_large = || EncodeError::PayloadTooLarge {
            length: self.payload.len(),
            max: MAX_PAYLOAD_SIZE,
        };
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(too_large());
        }
        let payload_len = u32::try_from(self.payload.len()).map_err(|_| too_large())?;

        let mut out = Vec::with_capacity(self.encoded_len());
        self.header.write_to(payload_len, &mut out);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ENVELOPE_HEADER_SIZE.saturating_add(self.payload.len())
    }
}

/// Bounds-checked big-endian reader.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub(crate) const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub(crate) const fn position(&self) -> usize {
        self.position
    }

    pub(crate) const fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.position)
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn take(&mut self, needed: usize) -> Result<&'a [u8], DecodeError> {
        let truncated = DecodeError::Truncated {
            offset: self.position,
            needed,
            available: self.remaining(),
        };
        let end = self.position.checked_add(needed).ok_or(truncated.clone())?;
        let slice = self.bytes.get(self.position..end).ok_or(truncated)?;
        self.position = end;
        Ok(slice)
    }

    pub(crate) fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let offset = self.position;
        let slice = self.take(N)?;
        <[u8; N]>::try_from(slice).map_err(|_| DecodeError::Truncated {
            offset,
            needed: N,
            available: slice.len(),
        })
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.read_array::<1>().map(u8::from_be_bytes)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, DecodeError> {
        self.read_array::<2>().map(u16::from_be_bytes)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.read_array::<4>().map(u32::from_be_bytes)
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64, DecodeError> {
        self.read_array::<8>().map(i64::from_be_bytes)
    }

    pub(crate) fn read_f64(&mut self) -> Result<f64, DecodeError> {
        self.read_array::<8>().map(f64::from_be_bytes)
    }
}
