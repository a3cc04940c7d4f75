//! Schema-aware encoding and decoding of whole messages.

use std::sync::Arc;

use crate::error::{CodecError, DecodeError, EncodeError};
use crate::fields::FieldSet;
use crate::message::{Event, ExperimentMessage, Message, MessageBody};
use crate::registry::{MessageSchema, SchemaRegistry};
use crate::version::SchemaVersion;
use crate::wire::{PayloadKind, RawEnvelope};

/// Encodes typed messages to envelopes and back, resolving schemas through a
/// shared [`SchemaRegistry`].
#[derive(Debug, Clone)]
pub struct Codec {
    registry: Arc<SchemaRegistry>,
}

impl Codec {
    #[must_use]
    pub const fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Encode a message in canonical form: fields in ascending tag order and
    /// optional fields omitted when they equal their default.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the header kind disagrees with the body, no
    /// schema matches the header version, a field is not declared at that
    /// version, or the payload is too large.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, EncodeError> {
        let header = message.header;
        let body_kind = message.body.payload_kind();
        if header.payload_kind != body_kind {
            return Err(EncodeError::KindMismatch {
                header: header.payload_kind,
                body: body_kind,
            });
        }

        let payload = match &message.body {
            MessageBody::Opaque { payload, .. } => payload.clone(),
            MessageBody::Experiment(body) => {
                let schema = self.registry.resolve(header.schema_version, body_kind)?;
                body.to_fields(schema)?.encode()?
            }
            MessageBody::Event(body) => {
                let schema = self.registry.resolve(header.schema_version, body_kind)?;
                body.to_fields(schema)?.encode()?
            }
        };

        RawEnvelope::new(header, payload).encode()
    }

    /// Decode one envelope and check its kind.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] for malformed bytes or a kind other
    /// than `expected`, and [`CodecError::Schema`] for version or field
    /// incompatibilities.
    pub fn decode(&self, bytes: &[u8], expected: PayloadKind) -> Result<Message, CodecError> {
        let envelope = RawEnvelope::decode(bytes)?;
        let found = envelope.header.payload_kind;
        if found != expected {
            return Err(DecodeError::KindMismatch { expected, found }.into());
        }
        self.decode_envelope(envelope)
    }

    /// Decode one envelope of any kind.
    ///
    /// # Errors
    ///
    /// See [`Codec::decode`].
    pub fn decode_message(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        self.decode_envelope(RawEnvelope::decode(bytes)?)
    }

    /// Interpret an already framed envelope.
    ///
    /// # Errors
    ///
    /// See [`Codec::decode_body`].
    pub fn decode_envelope(&self, envelope: RawEnvelope) -> Result<Message, CodecError> {
        let body = self.decode_body(&envelope)?;
        Ok(Message {
            header: envelope.header,
            body,
        })
    }

    /// Interpret an envelope payload. Unknown kinds come back as
    /// [`MessageBody::Opaque`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Schema`] if no compatible schema exists or the
    /// producer requires a field this consumer does not know, and
    /// [`CodecError::Decode`] if the payload is malformed.
    pub fn decode_body(&self, envelope: &RawEnvelope) -> Result<MessageBody, CodecError> {
        let header = &envelope.header;
        let kind = header.payload_kind;
        if let PayloadKind::Unknown(code) = kind {
            return Ok(MessageBody::Opaque {
                code,
                payload: envelope.payload.clone(),
            });
        }

        let schema = self.registry.resolve(header.schema_version, kind)?;
        let fields = FieldSet::decode(&envelope.payload)?;
        self.check_fields(header.schema_version, schema, &fields)?;

        match kind {
            PayloadKind::Experiment => {
                ExperimentMessage::from_fields(fields, schema).map(MessageBody::Experiment)
            }
            PayloadKind::Event => Event::from_fields(fields, schema).map(MessageBody::Event),
            PayloadKind::Unknown(code) => Ok(MessageBody::Opaque {
                code,
                payload: envelope.payload.clone(),
            }),
        }
    }

    fn check_fields(
        &self,
        producer: SchemaVersion,
        schema: &MessageSchema,
        fields: &FieldSet,
    ) -> Result<(), CodecError> {
        self.registry.check_unknown_fields(producer, schema, fields)?;
        schema.validate_fields(fields)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::DateTime;

    use super::*;
    use crate::ids::{ExperimentId, MessageId};
    use crate::error::SchemaError;
    use crate::message::{EventKind, LifecycleAction};

    fn codec() -> Codec {
        Codec::new(Arc::new(SchemaRegistry::builtin()))
    }

    fn create(id: &str) -> Message {
        Message::new(
            SchemaVersion::V1_0,
            MessageId::new(),
            1_000,
            MessageBody::Experiment(
                ExperimentMessage::new(ExperimentId::parse(id).unwrap(), LifecycleAction::Create)
                    .with_owner("ada"),
            ),
        )
    }

    #[test]
    fn test_experiment_roundtrip() {
        let codec = codec();
        let message = create("exp-1");
        let bytes = codec.encode(&message).unwrap();
        assert_eq!(codec.decode(&bytes, PayloadKind::Experiment).unwrap(), message);
    }

    #[test]
    fn test_kind_mismatch_on_decode() {
        let codec = codec();
        let bytes = codec.encode(&create("exp-1")).unwrap();
        assert_eq!(
            codec.decode(&bytes, PayloadKind::Event),
            Err(CodecError::Decode(DecodeError::KindMismatch {
                expected: PayloadKind::Event,
                found: PayloadKind::Experiment,
            }))
        );
    }

    #[test]
    fn test_kind_mismatch_on_encode() {
        let mut message = create("exp-1");
        message.header.payload_kind = PayloadKind::Event;
        assert!(matches!(
            codec().encode(&message),
            Err(EncodeError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let codec = codec();
        let at = DateTime::from_timestamp_micros(5).unwrap();
        let event = Event::new(ExperimentId::parse("exp-1").unwrap(), EventKind::Log, at)
            .with_attribute("z", 1_i64)
            .with_attribute("a", "first");
        let message = Message::new(
            SchemaVersion::V1_1,
            MessageId::new(),
            0,
            MessageBody::Event(event),
        );
        assert_eq!(codec.encode(&message).unwrap(), codec.encode(&message).unwrap());
    }

    #[test]
    fn test_opaque_roundtrip() {
        let codec = codec();
        let message = Message::new(
            SchemaVersion::new(1, 4, 0),
            MessageId::new(),
            9,
            MessageBody::Opaque {
                code: 42,
                payload: vec![0xDE, 0xAD],
            },
        );
        let bytes = codec.encode(&message).unwrap();
        assert_eq!(codec.decode_message(&bytes).unwrap(), message);
    }

    #[test]
    fn test_unknown_major_rejected_before_payload() {
        let codec = codec();
        let bytes = codec.encode(&create("exp-1")).unwrap();
        let mut envelope = RawEnvelope::decode(&bytes).unwrap();
        envelope.header.schema_version = SchemaVersion::new(3, 0, 0);
        envelope.payload = vec![0xFF];

        assert!(matches!(
            codec.decode_body(&envelope),
            Err(CodecError::Schema(SchemaError::UnknownVersion { .. }))
        ));
    }
}
