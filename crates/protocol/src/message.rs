//! Typed messages.
//!
//! Typed views are built from a [`FieldSet`] through a [`MessageSchema`]:
//! only fields the schema declares are interpreted, everything else rides
//! along in `unknown_fields` and is written back on encode.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, DecodeError, EncodeError, SchemaError};
use crate::fields::{self, Attributes, FieldSet, RawField, Scalar};
use crate::ids::{ExperimentId, MessageId};
use crate::registry::MessageSchema;
use crate::version::SchemaVersion;
use crate::wire::{EnvelopeHeader, PayloadKind};

/// Well-known field tags. Their meaning never changes across versions.
pub mod tags {
    /// Lifecycle message fields.
    pub mod experiment {
        pub const EXPERIMENT_ID: u16 = 1;
        pub const ACTION: u16 = 2;
        pub const OWNER: u16 = 3;
        pub const REASON: u16 = 4;
    }

    /// Telemetry event fields.
    pub mod event {
        pub const EXPERIMENT_ID: u16 = 1;
        pub const EVENT_TYPE: u16 = 2;
        pub const OBSERVED_AT: u16 = 3;
        pub const SEQUENCE_HINT: u16 = 4;
        pub const ATTRIBUTES: u16 = 5;
    }
}

/// Lifecycle command carried by an experiment message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Create,
    Start,
    Pause,
    Resume,
    Complete,
    Fail,
}

impl LifecycleAction {
    #[must_use]
    pub const fn code(&self) -> i64 {
        match self {
            Self::Create => 0,
            Self::Start => 1,
            Self::Pause => 2,
            Self::Resume => 3,
            Self::Complete => 4,
            Self::Fail => 5,
        }
    }

    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Create),
            1 => Some(Self::Start),
            2 => Some(Self::Pause),
            3 => Some(Self::Resume),
            4 => Some(Self::Complete),
            5 => Some(Self::Fail),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Complete => "complete",
            Self::Fail => "fail",
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a telemetry event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Metric,
    Log,
    Checkpoint,
    Artifact,
    Heartbeat,
    Other(String),
}

impl EventKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Metric => "metric",
            Self::Log => "log",
            Self::Checkpoint => "checkpoint",
            Self::Artifact => "artifact",
            Self::Heartbeat => "heartbeat",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "metric" => Self::Metric,
            "log" => Self::Log,
            "checkpoint" => Self::Checkpoint,
            "artifact" => Self::Artifact,
            "heartbeat" => Self::Heartbeat,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Experiment lifecycle message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentMessage {
    pub experiment_id: ExperimentId,
    pub action: LifecycleAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Fields this consumer does not interpret, preserved verbatim.
    #[serde(skip)]
    pub unknown_fields: FieldSet,
}

impl ExperimentMessage {
    #[must_use]
    pub fn new(experiment_id: ExperimentId, action: LifecycleAction) -> Self {
        Self {
            experiment_id,
            action,
            owner: None,
            reason: None,
            unknown_fields: FieldSet::new(),
        }
    }

    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub(crate) fn from_fields(fields: FieldSet, schema: &MessageSchema) -> Result<Self, CodecError> {
        use tags::experiment as t;

        let mut reader = FieldReader::new(fields, schema);
        let experiment_id = ExperimentId::parse(reader.required_string(t::EXPERIMENT_ID)?)?;
        let code = reader.required_int(t::ACTION)?;
        let action = LifecycleAction::from_code(code).ok_or_else(|| {
            DecodeError::invalid_value("action", format!("unknown lifecycle action {code}"))
        })?;
        let owner = reader.string(t::OWNER)?;
        let reason = reader.string(t::REASON)?;

        Ok(Self {
            experiment_id,
            action,
            owner,
            reason,
            unknown_fields: reader.into_rest(),
        })
    }

    pub(crate) fn to_fields(&self, schema: &MessageSchema) -> Result<FieldSet, EncodeError> {
        use tags::experiment as t;

        let mut writer = FieldWriter::new(schema);
        writer.put(
            t::EXPERIMENT_ID,
            "experiment_id",
            Some(RawField::string(self.experiment_id.as_str(), true)),
        )?;
        writer.put(
            t::ACTION,
            "action",
            Some(RawField::int(self.action.code(), true)),
        )?;
        writer.put(
            t::OWNER,
            "owner",
            self.owner.as_deref().map(|v| RawField::string(v, false)),
        )?;
        writer.put(
            t::REASON,
            "reason",
            self.reason.as_deref().map(|v| RawField::string(v, false)),
        )?;
        writer.finish(&self.unknown_fields)
    }
}

/// Telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub experiment_id: ExperimentId,
    #[serde(rename = "event_type")]
    pub kind: EventKind,
    pub observed_at: DateTime<Utc>,
    pub sequence_hint: i64,
    #[serde(skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
    /// Fields this consumer does not interpret, preserved verbatim.
    #[serde(skip)]
    pub unknown_fields: FieldSet,
}

impl Event {
    /// Create an event. `observed_at` is truncated to microseconds, the wire
    /// resolution.
    #[must_use]
    pub fn new(experiment_id: ExperimentId, kind: EventKind, observed_at: DateTime<Utc>) -> Self {
        let observed_at =
            DateTime::from_timestamp_micros(observed_at.timestamp_micros()).unwrap_or(observed_at);
        Self {
            experiment_id,
            kind,
            observed_at,
            sequence_hint: 0,
            attributes: Attributes::new(),
            unknown_fields: FieldSet::new(),
        }
    }

    #[must_use]
    pub const fn with_sequence_hint(mut self, sequence_hint: i64) -> Self {
        self.sequence_hint = sequence_hint;
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Observation time in microseconds since the Unix epoch.
    #[must_use]
    pub fn observed_at_micros(&self) -> i64 {
        self.observed_at.timestamp_micros()
    }

    fn check_shape(&self, schema: &MessageSchema) -> Result<(), SchemaError> {
        match schema.shape(self.kind.as_str()) {
            Some(shape) => shape
                .validate(&self.attributes)
                .map_err(|reason| SchemaError::AttributeShape {
                    event_type: self.kind.to_string(),
                    version: schema.version(),
                    reason,
                }),
            None => Ok(()),
        }
    }

    pub(crate) fn from_fields(fields: FieldSet, schema: &MessageSchema) -> Result<Self, CodecError> {
        use tags::event as t;

        let mut reader = FieldReader::new(fields, schema);
        let experiment_id = ExperimentId::parse(reader.required_string(t::EXPERIMENT_ID)?)?;
        let kind = EventKind::from(reader.required_string(t::EVENT_TYPE)?);
        let micros = reader.required_int(t::OBSERVED_AT)?;
        let observed_at = DateTime::from_timestamp_micros(micros).ok_or_else(|| {
            DecodeError::invalid_value("observed_at", format!("{micros} is out of range"))
        })?;
        let sequence_hint = reader
            .int(t::SEQUENCE_HINT)?
            .unwrap_or_else(|| schema.default_int(t::SEQUENCE_HINT));
        let attributes = reader.attributes(t::ATTRIBUTES)?.unwrap_or_default();

        let event = Self {
            experiment_id,
            kind,
            observed_at,
            sequence_hint,
            attributes,
            unknown_fields: reader.into_rest(),
        };
        event.check_shape(schema)?;
        Ok(event)
    }

    pub(crate) fn to_fields(&self, schema: &MessageSchema) -> Result<FieldSet, EncodeError> {
        use tags::event as t;

        self.check_shape(schema)?;
        let hint_is_default = self.sequence_hint == schema.default_int(t::SEQUENCE_HINT);
        let attributes = if self.attributes.is_empty() {
            None
        } else {
            Some(RawField::attributes(&self.attributes, false)?)
        };

        let mut writer = FieldWriter::new(schema);
        writer.put(
            t::EXPERIMENT_ID,
            "experiment_id",
            Some(RawField::string(self.experiment_id.as_str(), true)),
        )?;
        writer.put(
            t::EVENT_TYPE,
            "event_type",
            Some(RawField::string(self.kind.as_str(), true)),
        )?;
        writer.put(
            t::OBSERVED_AT,
            "observed_at",
            Some(RawField::int(self.observed_at_micros(), true)),
        )?;
        writer.put(
            t::SEQUENCE_HINT,
            "sequence_hint",
            (!hint_is_default).then(|| RawField::int(self.sequence_hint, false)),
        )?;
        writer.put(t::ATTRIBUTES, "attributes", attributes)?;
        writer.finish(&self.unknown_fields)
    }
}

/// Decoded payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Experiment(ExperimentMessage),
    Event(Event),
    /// Payload of a kind this consumer does not understand.
    Opaque {
        code: u8,
        #[serde(skip)]
        payload: Vec<u8>,
    },
}

impl MessageBody {
    #[must_use]
    pub const fn payload_kind(&self) -> PayloadKind {
        match self {
            Self::Experiment(_) => PayloadKind::Experiment,
            Self::Event(_) => PayloadKind::Event,
            Self::Opaque { code, .. } => PayloadKind::from_code(*code),
        }
    }

    #[must_use]
    pub const fn experiment_id(&self) -> Option<&ExperimentId> {
        match self {
            Self::Experiment(message) => Some(&message.experiment_id),
            Self::Event(event) => Some(&event.experiment_id),
            Self::Opaque { .. } => None,
        }
    }
}

/// A complete message: envelope header plus decoded body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub header: EnvelopeHeader,
    pub body: MessageBody,
}

impl Message {
    /// Build a message whose header kind matches its body.
    #[must_use]
    pub const fn new(
        schema_version: SchemaVersion,
        message_id: MessageId,
        produced_at_micros: i64,
        body: MessageBody,
    ) -> Self {
        Self {
            header: EnvelopeHeader::new(
                schema_version,
                body.payload_kind(),
                message_id,
                produced_at_micros,
            ),
            body,
        }
    }

    #[must_use]
    pub const fn message_id(&self) -> MessageId {
        self.header.message_id
    }
}

/// Pulls declared fields out of a set; whatever is left is preserved.
struct FieldReader<'a> {
    fields: FieldSet,
    schema: &'a MessageSchema,
}

impl<'a> FieldReader<'a> {
    const fn new(fields: FieldSet, schema: &'a MessageSchema) -> Self {
        Self { fields, schema }
    }

    fn take(&mut self, tag: u16) -> Option<RawField> {
        if self.schema.declares(tag) {
            self.fields.remove(tag)
        } else {
            None
        }
    }

    fn missing(&self, tag: u16) -> DecodeError {
        DecodeError::MissingField {
            tag,
            field: self.schema.field_name(tag),
        }
    }

    fn string(&mut self, tag: u16) -> Result<Option<String>, DecodeError> {
        let name = self.schema.field_name(tag);
        self.take(tag)
            .map(|field| fields::decode_string(&name, field.value()))
            .transpose()
    }

    fn int(&mut self, tag: u16) -> Result<Option<i64>, DecodeError> {
        self.take(tag)
            .map(|field| fields::decode_int(tag, field.value()))
            .transpose()
    }

    fn attributes(&mut self, tag: u16) -> Result<Option<Attributes>, DecodeError> {
        let name = self.schema.field_name(tag);
        self.take(tag)
            .map(|field| fields::decode_attributes(&name, field.value()))
            .transpose()
    }

    fn required_string(&mut self, tag: u16) -> Result<String, DecodeError> {
        self.string(tag)?.ok_or_else(|| self.missing(tag))
    }

    fn required_int(&mut self, tag: u16) -> Result<i64, DecodeError> {
        self.int(tag)?.ok_or_else(|| self.missing(tag))
    }

    fn into_rest(self) -> FieldSet {
        self.fields
    }
}

/// Emits typed fields with the flags their schema declares.
struct FieldWriter<'a> {
    fields: FieldSet,
    schema: &'a MessageSchema,
}

impl<'a> FieldWriter<'a> {
    fn new(schema: &'a MessageSchema) -> Self {
        Self {
            fields: FieldSet::new(),
            schema,
        }
    }

    fn put(&mut self, tag: u16, name: &str, value: Option<RawField>) -> Result<(), EncodeError> {
        match (self.schema.field(tag), value) {
            (None, None) => Ok(()),
            (None, Some(_)) => Err(EncodeError::UndeclaredField {
                field: name.to_string(),
                version: self.schema.version(),
            }),
            (Some(spec), None) if spec.required => Err(EncodeError::MissingField {
                field: spec.name.clone(),
                version: self.schema.version(),
            }),
            (Some(_), None) => Ok(()),
            (Some(spec), Some(field)) => {
                let field = RawField::new(spec.wire_type, spec.required, field.value().to_vec());
                self.fields.insert(tag, field);
                Ok(())
            }
        }
    }

    fn finish(mut self, unknown: &FieldSet) -> Result<FieldSet, EncodeError> {
        self.fields.merge(unknown.clone())?;
        Ok(self.fields)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::registry::SchemaRegistry;

    fn schema(version: SchemaVersion, kind: PayloadKind) -> MessageSchema {
        SchemaRegistry::builtin().resolve(version, kind).unwrap().clone()
    }

    fn exp(id: &str) -> ExperimentId {
        ExperimentId::parse(id).unwrap()
    }

    #[test]
    fn test_action_codes_roundtrip() {
        for code in 0..6 {
            let action = LifecycleAction::from_code(code).unwrap();
            assert_eq!(action.code(), code);
        }
        assert_eq!(LifecycleAction::from_code(6), None);
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::from("metric"), EventKind::Metric);
        assert_eq!(
            EventKind::from("gradient_norm"),
            EventKind::Other("gradient_norm".to_string())
        );
        assert_eq!(String::from(EventKind::Heartbeat), "heartbeat");
    }

    #[test]
    fn test_default_sequence_hint_is_omitted() {
        let schema = schema(SchemaVersion::V1_0, PayloadKind::Event);
        let at = DateTime::from_timestamp_micros(10).unwrap();
        let plain = Event::new(exp("exp-1"), EventKind::Log, at);

        let fields = plain.to_fields(&schema).unwrap();
        assert!(!fields.contains(tags::event::SEQUENCE_HINT));
        assert!(!fields.contains(tags::event::ATTRIBUTES));

        let hinted = plain.with_sequence_hint(3).to_fields(&schema).unwrap();
        assert!(hinted.contains(tags::event::SEQUENCE_HINT));
    }

    #[test]
    fn test_reason_not_encodable_at_v1_0() {
        let message = ExperimentMessage::new(exp("exp-1"), LifecycleAction::Fail).with_reason("oom");
        let v1_0 = schema(SchemaVersion::V1_0, PayloadKind::Experiment);
        let v1_1 = schema(SchemaVersion::V1_1, PayloadKind::Experiment);

        assert!(matches!(
            message.to_fields(&v1_0),
            Err(EncodeError::UndeclaredField { .. })
        ));
        assert!(message.to_fields(&v1_1).is_ok());
    }

    #[test]
    fn test_undeclared_fields_survive_typed_decode() {
        let v1_0 = schema(SchemaVersion::V1_0, PayloadKind::Experiment);
        let v1_1 = schema(SchemaVersion::V1_1, PayloadKind::Experiment);
        let message = ExperimentMessage::new(exp("exp-1"), LifecycleAction::Fail).with_reason("oom");

        let fields = message.to_fields(&v1_1).unwrap();
        let read_old = ExperimentMessage::from_fields(fields.clone(), &v1_0).unwrap();

        assert_eq!(read_old.reason, None);
        assert!(read_old.unknown_fields.contains(tags::experiment::REASON));
        assert_eq!(read_old.to_fields(&v1_0).unwrap(), fields);
    }

    #[test]
    fn test_metric_shape_enforced_on_both_paths() {
        let v1_1 = schema(SchemaVersion::V1_1, PayloadKind::Event);
        let v1_0 = schema(SchemaVersion::V1_0, PayloadKind::Event);
        let at = DateTime::from_timestamp_micros(0).unwrap();
        let metric = Event::new(exp("exp-1"), EventKind::Metric, at).with_attribute("name", "loss");

        assert!(matches!(
            metric.to_fields(&v1_1),
            Err(EncodeError::Schema(SchemaError::AttributeShape { .. }))
        ));

        let fields = metric.to_fields(&v1_0).unwrap();
        assert!(matches!(
            Event::from_fields(fields, &v1_1),
            Err(CodecError::Schema(SchemaError::AttributeShape { .. }))
        ));
    }

    #[test]
    fn test_unknown_action_code() {
        let v1_0 = schema(SchemaVersion::V1_0, PayloadKind::Experiment);
        let mut fields = FieldSet::new();
        fields.insert(tags::experiment::EXPERIMENT_ID, RawField::string("exp-1", true));
        fields.insert(tags::experiment::ACTION, RawField::int(42, true));
        assert!(matches!(
            ExperimentMessage::from_fields(fields, &v1_0),
            Err(CodecError::Decode(DecodeError::InvalidValue { .. }))
        ));
    }

    #[test]
    fn test_event_new_truncates_to_micros() {
        let at = DateTime::from_timestamp(1, 123_456_789).unwrap();
        let event = Event::new(exp("exp-1"), EventKind::Log, at);
        assert_eq!(event.observed_at.timestamp_subsec_nanos(), 123_456_000);
    }
}
