//! Schema registry.
//!
//! Maps `(payload kind, version)` to the field layout a consumer expects.
//! Built-in versions are always present; deployments may add versions from a
//! TOML file at startup. The registry is immutable once built and shared
//! behind an `Arc`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tap::TapFallible;

use crate::error::{DecodeError, RegistryError, SchemaError};
use crate::fields::{Attributes, FieldSet, Scalar, WireType};
use crate::message::tags;
use crate::version::SchemaVersion;
use crate::wire::PayloadKind;

/// Whether a producer version can be read by a consumer version.
#[must_use]
pub const fn is_compatible(producer: SchemaVersion, consumer: SchemaVersion) -> bool {
    producer.is_compatible_with(&consumer)
}

/// Declaration of one payload field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSpec {
    pub tag: u16,
    pub name: String,
    #[serde(rename = "type")]
    pub wire_type: WireType,
    #[serde(default)]
    pub required: bool,
    /// Value assumed when an optional field is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Scalar>,
}

impl FieldSpec {
    #[must_use]
    pub fn required(tag: u16, name: &str, wire_type: WireType) -> Self {
        Self {
            tag,
            name: name.to_string(),
            wire_type,
            required: true,
            default: None,
        }
    }

    #[must_use]
    pub fn optional(tag: u16, name: &str, wire_type: WireType) -> Self {
        Self {
            required: false,
            ..Self::required(tag, name, wire_type)
        }
    }

    #[must_use]
    pub fn with_default(mut self, default: Scalar) -> Self {
        self.default = Some(default);
        self
    }

    fn default_matches_type(&self) -> bool {
        match (&self.default, self.wire_type) {
            (None, _)
            | (Some(Scalar::Bool(_)), WireType::Bool)
            | (Some(Scalar::Int(_)), WireType::Int)
            | (Some(Scalar::Float(_)), WireType::Float)
            | (Some(Scalar::Text(_)), WireType::String) => true,
            (Some(_), _) => false,
        }
    }
}

/// Type constraint on an event attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Bool,
    Int,
    Float,
    /// Int or float.
    Number,
    Text,
}

impl AttributeType {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Number => "number",
            Self::Text => "text",
        }
    }

    #[must_use]
    pub const fn accepts(&self, value: &Scalar) -> bool {
        matches!(
            (self, value),
            (Self::Bool, Scalar::Bool(_))
                | (Self::Int, Scalar::Int(_))
                | (Self::Float, Scalar::Float(_))
                | (Self::Number, Scalar::Int(_) | Scalar::Float(_))
                | (Self::Text, Scalar::Text(_))
        )
    }
}

/// Attributes an event type must carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventShape {
    pub event_type: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeType>,
}

impl EventShape {
    #[must_use]
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn require(mut self, key: &str, attribute_type: AttributeType) -> Self {
        self.attributes.insert(key.to_string(), attribute_type);
        self
    }

    /// Check that every required attribute is present with the right type.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violation.
    pub fn validate(&self, attributes: &Attributes) -> Result<(), String> {
        self.attributes
            .iter()
            .try_for_each(|(key, expected)| match attributes.get(key) {
                None => Err(format!("missing attribute '{key}'")),
                Some(value) if !expected.accepts(value) => Err(format!(
                    "attribute '{key}' must be {}",
                    expected.name()
                )),
                Some(_) => Ok(()),
            })
    }
}

/// Field layout for one payload kind at one version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageSchema {
    version: SchemaVersion,
    kind: PayloadKind,
    fields: BTreeMap<u16, FieldSpec>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    shapes: BTreeMap<String, EventShape>,
}

struct CoreField {
    tag: u16,
    wire_type: WireType,
    required: bool,
}

const EXPERIMENT_CORE: &[CoreField] = &[
    CoreField {
        tag: tags::experiment::EXPERIMENT_ID,
        wire_type: WireType::String,
        required: true,
    },
    CoreField {
        tag: tags::experiment::ACTION,
        wire_type: WireType::Int,
        required: true,
    },
    CoreField {
        tag: tags::experiment::OWNER,
        wire_type: WireType::String,
        required: false,
    },
    CoreField {
        tag: tags::experiment::REASON,
        wire_type: WireType::String,
        required: false,
    },
];

const EVENT_CORE: &[CoreField] = &[
    CoreField {
        tag: tags::event::EXPERIMENT_ID,
        wire_type: WireType::String,
        required: true,
    },
    CoreField {
        tag: tags::event::EVENT_TYPE,
        wire_type: WireType::String,
        required: true,
    },
    CoreField {
        tag: tags::event::OBSERVED_AT,
        wire_type: WireType::Int,
        required: true,
    },
    CoreField {
        tag: tags::event::SEQUENCE_HINT,
        wire_type: WireType::Int,
        required: false,
    },
    CoreField {
        tag: tags::event::ATTRIBUTES,
        wire_type: WireType::Attributes,
        required: false,
    },
];

impl MessageSchema {
    /// Build and validate a schema.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the kind is unknown, a tag repeats, a
    /// default does not match its field type, or the fields every version of
    /// this kind must carry are missing or mistyped.
    pub fn new(
        version: SchemaVersion,
        kind: PayloadKind,
        fields: impl IntoIterator<Item = FieldSpec>,
        shapes: impl IntoIterator<Item = EventShape>,
    ) -> Result<Self, RegistryError> {
        let core = match kind {
            PayloadKind::Experiment => EXPERIMENT_CORE,
            PayloadKind::Event => EVENT_CORE,
            PayloadKind::Unknown(code) => {
                return Err(RegistryError::UnknownKind {
                    value: code.to_string(),
                });
            }
        };

        let mut by_tag = BTreeMap::new();
        for field in fields {
            if !field.default_matches_type() {
                return Err(RegistryError::InvalidSchema {
                    kind,
                    version,
                    reason: format!("default for '{}' does not match its type", field.name),
                });
            }
            let tag = field.tag;
            if by_tag.insert(tag, field).is_some() {
                return Err(RegistryError::DuplicateTag { kind, version, tag });
            }
        }

        for expected in core {
            match by_tag.get(&expected.tag) {
                None if expected.required => {
                    return Err(RegistryError::MissingCoreField {
                        kind,
                        version,
                        tag: expected.tag,
                    });
                }
                None => {}
                Some(spec) if spec.wire_type != expected.wire_type => {
                    return Err(RegistryError::CoreFieldMismatch {
                        kind,
                        version,
                        tag: expected.tag,
                        expected: expected.wire_type.to_string(),
                    });
                }
                Some(spec) if expected.required && !spec.required => {
                    return Err(RegistryError::CoreFieldMismatch {
                        kind,
                        version,
                        tag: expected.tag,
                        expected: "required".to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        let shapes: BTreeMap<String, EventShape> = shapes
            .into_iter()
            .map(|shape| (shape.event_type.clone(), shape))
            .collect();
        if !shapes.is_empty() && kind != PayloadKind::Event {
            return Err(RegistryError::InvalidSchema {
                kind,
                version,
                reason: "attribute shapes apply to events only".to_string(),
            });
        }

        Ok(Self {
            version,
            kind,
            fields: by_tag,
            shapes,
        })
    }

    #[must_use]
    pub const fn version(&self) -> SchemaVersion {
        self.version
    }

    #[must_use]
    pub const fn kind(&self) -> PayloadKind {
        self.kind
    }

    #[must_use]
    pub fn field(&self, tag: u16) -> Option<&FieldSpec> {
        self.fields.get(&tag)
    }

    #[must_use]
    pub fn declares(&self, tag: u16) -> bool {
        self.fields.contains_key(&tag)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.values()
    }

    #[must_use]
    pub fn shape(&self, event_type: &str) -> Option<&EventShape> {
        self.shapes.get(event_type)
    }

    /// Check presence and wire types of declared fields.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::MissingField`] for an absent required field and
    /// [`DecodeError::TypeMismatch`] or [`DecodeError::UnknownWireType`] for a
    /// field whose wire type differs from its declaration.
    pub fn validate_fields(&self, fields: &FieldSet) -> Result<(), DecodeError> {
        self.fields.values().try_for_each(|spec| {
            match fields.get(spec.tag) {
                None if spec.required => Err(DecodeError::MissingField {
                    tag: spec.tag,
                    field: spec.name.clone(),
                }),
                None => Ok(()),
                Some(field) => match field.wire_type() {
                    Some(found) if found == spec.wire_type => Ok(()),
                    Some(found) => Err(DecodeError::TypeMismatch {
                        tag: spec.tag,
                        field: spec.name.clone(),
                        expected: spec.wire_type,
                        found,
                    }),
                    None => Err(DecodeError::UnknownWireType {
                        tag: spec.tag,
                        code: field.wire_type_code(),
                    }),
                },
            }
        })
    }

    /// Default for an optional int field; zero when none is declared.
    #[must_use]
    pub fn default_int(&self, tag: u16) -> i64 {
        match self.field(tag).and_then(|spec| spec.default.as_ref()) {
            Some(Scalar::Int(value)) => *value,
            _ => 0,
        }
    }

    /// Name of a declared field, or a tag placeholder.
    pub(crate) fn field_name(&self, tag: u16) -> String {
        self.field(tag)
            .map_or_else(|| format!("tag {tag}"), |spec| spec.name.clone())
    }
}

/// Registered schemas, keyed by payload kind then version.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<u8, BTreeMap<SchemaVersion, MessageSchema>>,
}

impl SchemaRegistry {
    /// A registry with no schemas.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in `1.0.0` and `1.1.0` schemas.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for schema in builtin_schemas() {
            registry
                .schemas
                .entry(schema.kind.code())
                .or_default()
                .insert(schema.version, schema);
        }
        registry
    }

    /// Built-in schemas plus those declared in a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the document is malformed or declares an
    /// invalid or duplicate schema.
    pub fn from_toml_str(content: &str) -> Result<Self, RegistryError> {
        let mut registry = Self::builtin();
        registry.extend_from_toml_str(content)?;
        Ok(registry)
    }

    /// Built-in schemas plus those declared in a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ReadFailed`] if the file cannot be read, or
    /// any error from [`SchemaRegistry::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path).map_err(|e| RegistryError::ReadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Register every schema declared in a TOML document.
    ///
    /// # Errors
    ///
    /// See [`SchemaRegistry::from_toml_str`].
    pub fn extend_from_toml_str(&mut self, content: &str) -> Result<(), RegistryError> {
        let file: SchemaFile = toml::from_str(content).map_err(|e| RegistryError::ParseFailed {
            reason: e.to_string(),
        })?;
        for decl in file.schema {
            let kind = match decl.kind.as_str() {
                "experiment" => PayloadKind::Experiment,
                "event" => PayloadKind::Event,
                other => {
                    return Err(RegistryError::UnknownKind {
                        value: other.to_string(),
                    });
                }
            };
            self.register(MessageSchema::new(
                decl.version,
                kind,
                decl.fields,
                decl.shapes,
            )?)?;
        }
        Ok(())
    }

    /// Add a schema.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateVersion`] if the kind already has a
    /// schema at this version.
    pub fn register(&mut self, schema: MessageSchema) -> Result<(), RegistryError> {
        let versions = self.schemas.entry(schema.kind.code()).or_default();
        if versions.contains_key(&schema.version) {
            return Err(RegistryError::DuplicateVersion {
                kind: schema.kind,
                version: schema.version,
            });
        }
        versions.insert(schema.version, schema);
        Ok(())
    }

    /// Pick the schema used to read a message produced at `version`.
    ///
    /// Prefers the highest registered version with the same major and a
    /// minor no greater than the producer's. When the producer is older than
    /// every registered minor, the oldest schema of that major is used.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownVersion`] if no schema shares the
    /// producer's major version.
    pub fn resolve(
        &self,
        version: SchemaVersion,
        kind: PayloadKind,
    ) -> Result<&MessageSchema, SchemaError> {
        let unknown = || SchemaError::UnknownVersion { version, kind };
        let versions = self.schemas.get(&kind.code()).ok_or_else(unknown)?;
        let same_major = SchemaVersion::new(version.major, 0, 0)
            ..=SchemaVersion::new(version.major, u16::MAX, u16::MAX);
        let ceiling = SchemaVersion::new(version.major, version.minor, u16::MAX);

        versions
            .range(*same_major.start()..=ceiling)
            .next_back()
            .or_else(|| versions.range(same_major).next())
            .map(|(_, schema)| schema)
            .ok_or_else(unknown)
    }

    /// Newest registered schema for a kind.
    #[must_use]
    pub fn latest(&self, kind: PayloadKind) -> Option<&MessageSchema> {
        self.schemas
            .get(&kind.code())
            .and_then(|versions| versions.values().next_back())
    }

    /// Reject fields outside `schema` that the producer flagged as required.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownRequiredField`] for the first such field.
    pub fn check_unknown_fields(
        &self,
        producer: SchemaVersion,
        schema: &MessageSchema,
        unknown: &FieldSet,
    ) -> Result<(), SchemaError> {
        unknown
            .iter()
            .find(|(tag, field)| field.is_required() && !schema.declares(*tag))
            .map_or(Ok(()), |(tag, _)| {
                Err(SchemaError::UnknownRequiredField {
                    tag,
                    producer,
                    consumer: schema.version,
                })
            })
    }

    /// Every registered schema, by kind then version.
    pub fn schemas(&self) -> impl Iterator<Item = &MessageSchema> {
        self.schemas.values().flat_map(BTreeMap::values)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemaFile {
    #[serde(default)]
    schema: Vec<SchemaDecl>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemaDecl {
    version: SchemaVersion,
    kind: String,
    fields: Vec<FieldSpec>,
    #[serde(default)]
    shapes: Vec<EventShape>,
}

fn experiment_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::required(tags::experiment::EXPERIMENT_ID, "experiment_id", WireType::String),
        FieldSpec::required(tags::experiment::ACTION, "action", WireType::Int),
        FieldSpec::optional(tags::experiment::OWNER, "owner", WireType::String),
    ]
}

fn event_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::required(tags::event::EXPERIMENT_ID, "experiment_id", WireType::String),
        FieldSpec::required(tags::event::EVENT_TYPE, "event_type", WireType::String),
        FieldSpec::required(tags::event::OBSERVED_AT, "observed_at", WireType::Int),
        FieldSpec::optional(tags::event::SEQUENCE_HINT, "sequence_hint", WireType::Int)
            .with_default(Scalar::Int(0)),
        FieldSpec::optional(tags::event::ATTRIBUTES, "attributes", WireType::Attributes),
    ]
}

fn builtin_schemas() -> Vec<MessageSchema> {
    let mut experiment_v1_1 = experiment_fields();
    experiment_v1_1.push(FieldSpec::optional(
        tags::experiment::REASON,
        "reason",
        WireType::String,
    ));
    let shapes_v1_1 = vec![
        EventShape::new("metric")
            .require("name", AttributeType::Text)
            .require("value", AttributeType::Number),
        EventShape::new("checkpoint").require("step", AttributeType::Int),
    ];

    [
        (SchemaVersion::V1_0, PayloadKind::Experiment, experiment_fields(), Vec::new()),
        (SchemaVersion::V1_1, PayloadKind::Experiment, experiment_v1_1, Vec::new()),
        (SchemaVersion::V1_0, PayloadKind::Event, event_fields(), Vec::new()),
        (SchemaVersion::V1_1, PayloadKind::Event, event_fields(), shapes_v1_1),
    ]
    .into_iter()
    .filter_map(|(version, kind, fields, shapes)| {
        MessageSchema::new(version, kind, fields, shapes)
            .tap_err(|e| {
                tracing::error!(%version, %kind, error = %e, "Built-in schema rejected");
            })
            .ok()
    })
    .collect()
}
