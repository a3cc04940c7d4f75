//! Tag-length-value payload fields.
//!
//! [`FieldSet`] is the untyped view of a payload. Typed messages are built
//! from it, and any field a schema does not declare stays here verbatim so it
//! can be re-emitted unchanged.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};
use crate::wire::Reader;

/// Flag bit marking a field the producer requires consumers to understand.
pub const REQUIRED_FLAG: u8 = 0x80;

const WIRE_TYPE_MASK: u8 = 0x0F;

/// Value encoding of a field, stored in the low nibble of its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireType {
    /// One byte, `0` or `1`.
    Bool,
    /// Eight bytes, big-endian two's complement.
    Int,
    /// Eight bytes, big-endian IEEE 754.
    Float,
    /// UTF-8 bytes.
    String,
    /// Arbitrary bytes.
    Bytes,
    /// Key-sorted map of scalars.
    Attributes,
}

impl WireType {
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Bool),
            1 => Some(Self::Int),
            2 => Some(Self::Float),
            3 => Some(Self::String),
            4 => Some(Self::Bytes),
            5 => Some(Self::Attributes),
            _ => None,
        }
    }

    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::Bool => 0,
            Self::Int => 1,
            Self::Float => 2,
            Self::String => 3,
            Self::Bytes => 4,
            Self::Attributes => 5,
        }
    }

    /// Exact value width for fixed-size types.
    #[must_use]
    pub const fn fixed_width(&self) -> Option<usize> {
        match self {
            Self::Bool => Some(1),
            Self::Int | Self::Float => Some(8),
            Self::String | Self::Bytes | Self::Attributes => None,
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Attributes => "attributes",
        };
        f.write_str(name)
    }
}

/// A single undecoded field value with its flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawField {
    flags: u8,
    value: Vec<u8>,
}

impl RawField {
    #[must_use]
    pub fn new(wire_type: WireType, required: bool, value: Vec<u8>) -> Self {
        let flags = if required {
            wire_type.code() | REQUIRED_FLAG
        } else {
            wire_type.code()
        };
        Self { flags, value }
    }

    /// Rebuild a field from its exact wire flags, including bits this
    /// consumer does not interpret.
    #[must_use]
    pub const fn from_parts(flags: u8, value: Vec<u8>) -> Self {
        Self { flags, value }
    }

    #[must_use]
    pub const fn flags(&self) -> u8 {
        self.flags
    }

    #[must_use]
    pub const fn wire_type_code(&self) -> u8 {
        self.flags & WIRE_TYPE_MASK
    }

    /// `None` when the wire type is newer than this consumer.
    #[must_use]
    pub const fn wire_type(&self) -> Option<WireType> {
        WireType::from_code(self.wire_type_code())
    }

    #[must_use]
    pub const fn is_required(&self) -> bool {
        self.flags & REQUIRED_FLAG != 0
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    #[must_use]
    pub fn bool(value: bool, required: bool) -> Self {
        Self::new(WireType::Bool, required, vec![u8::from(value)])
    }

    #[must_use]
    pub fn int(value: i64, required: bool) -> Self {
        Self::new(WireType::Int, required, value.to_be_bytes().to_vec())
    }

    #[must_use]
    pub fn float(value: f64, required: bool) -> Self {
        Self::new(WireType::Float, required, value.to_be_bytes().to_vec())
    }

    #[must_use]
    pub fn string(value: &str, required: bool) -> Self {
        Self::new(WireType::String, required, value.as_bytes().to_vec())
    }

    /// # Errors
    ///
    /// Returns [`EncodeError::FieldTooLarge`] if a key or the entry count does
    /// not fit its length prefix.
    pub fn attributes(value: &Attributes, required: bool) -> Result<Self, EncodeError> {
        Ok(Self::new(
            WireType::Attributes,
            required,
            encode_attributes(value)?,
        ))
    }
}

/// Ordered collection of payload fields keyed by tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    fields: BTreeMap<u16, RawField>,
}

impl FieldSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a payload into fields.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if a field is truncated, tags are not strictly
    /// ascending, or a fixed-width value has the wrong length.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(payload);
        let mut fields = BTreeMap::new();
        let mut previous: Option<u16> = None;

        while !reader.is_empty() {
            let tag = reader.read_u16()?;
            match previous {
                Some(previous) if tag <= previous => {
                    return Err(DecodeError::FieldOrder { tag, previous });
                }
                _ => {}
            }
            let flags = reader.read_u8()?;
            let length = usize::try_from(reader.read_u32()?).unwrap_or(usize::MAX);
            let field = RawField::from_parts(flags, reader.take(length)?.to_vec());

            if let Some(expected) = field.wire_type().and_then(|wt| wt.fixed_width()) {
                if field.value.len() != expected {
                    return Err(DecodeError::FieldLength {
                        tag,
                        expected,
                        found: field.value.len(),
                    });
                }
            }

            fields.insert(tag, field);
            previous = Some(tag);
        }

        Ok(Self { fields })
    }

    /// Append the encoded fields, in tag order, to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::FieldTooLarge`] if a value does not fit a `u32`
    /// length prefix.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        for (tag, field) in &self.fields {
            let length = u32::try_from(field.value.len()).map_err(|_| EncodeError::FieldTooLarge {
                field: format!("tag {tag}"),
                length: field.value.len(),
                max: u32::MAX as usize,
            })?;
            out.extend_from_slice(&tag.to_be_bytes());
            out.push(field.flags);
            out.extend_from_slice(&length.to_be_bytes());
            out.extend_from_slice(&field.value);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// See [`FieldSet::encode_into`].
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Insert a field, returning the previous field at `tag`.
    pub fn insert(&mut self, tag: u16, field: RawField) -> Option<RawField> {
        self.fields.insert(tag, field)
    }

    #[must_use]
    pub fn get(&self, tag: u16) -> Option<&RawField> {
        self.fields.get(&tag)
    }

    pub fn remove(&mut self, tag: u16) -> Option<RawField> {
        self.fields.remove(&tag)
    }

    #[must_use]
    pub fn contains(&self, tag: u16) -> bool {
        self.fields.contains_key(&tag)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &RawField)> {
        self.fields.iter().map(|(tag, field)| (*tag, field))
    }

    /// Split into fields matching `predicate` and the rest.
    #[must_use]
    pub fn partition(self, predicate: impl Fn(u16) -> bool) -> (Self, Self) {
        let (matching, rest): (BTreeMap<_, _>, BTreeMap<_, _>) = self
            .fields
            .into_iter()
            .partition(|(tag, _)| predicate(*tag));
        (Self { fields: matching }, Self { fields: rest })
    }

    /// Move every field of `other` into `self`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::DuplicateTag`] if both sets carry the same tag.
    pub fn merge(&mut self, other: Self) -> Result<(), EncodeError> {
        for (tag, field) in other.fields {
            if self.fields.contains_key(&tag) {
                return Err(EncodeError::DuplicateTag { tag });
            }
            self.fields.insert(tag, field);
        }
        Ok(())
    }
}

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    const fn code(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Int(_) => 1,
            Self::Float(_) => 2,
            Self::Text(_) => 3,
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Event attributes, always held (and encoded) in key order.
pub type Attributes = BTreeMap<String, Scalar>;

/// Decode a bool value. Anything other than `0` or `1` is invalid.
pub(crate) fn decode_bool(tag: u16, name: &str, value: &[u8]) -> Result<bool, DecodeError> {
    match value {
        [0] => Ok(false),
        [1] => Ok(true),
        [other] => Err(DecodeError::invalid_value(
            name,
            format!("bool byte must be 0 or 1, found {other}"),
        )),
        _ => Err(DecodeError::FieldLength {
            tag,
            expected: 1,
            found: value.len(),
        }),
    }
}

pub(crate) fn decode_int(tag: u16, value: &[u8]) -> Result<i64, DecodeError> {
    <[u8; 8]>::try_from(value)
        .map(i64::from_be_bytes)
        .map_err(|_| DecodeError::FieldLength {
            tag,
            expected: 8,
            found: value.len(),
        })
}

pub(crate) fn decode_float(tag: u16, value: &[u8]) -> Result<f64, DecodeError> {
    <[u8; 8]>::try_from(value)
        .map(f64::from_be_bytes)
        .map_err(|_| DecodeError::FieldLength {
            tag,
            expected: 8,
            found: value.len(),
        })
}

pub(crate) fn decode_string(name: &str, value: &[u8]) -> Result<String, DecodeError> {
    String::from_utf8(value.to_vec())
        .map_err(|e| DecodeError::invalid_value(name, format!("invalid UTF-8: {e}")))
}

/// Decode an attributes value. Keys must be strictly ascending.
pub(crate) fn decode_attributes(name: &str, value: &[u8]) -> Result<Attributes, DecodeError> {
    let mut reader = Reader::new(value);
    let count = reader.read_u32()?;
    let mut attributes = Attributes::new();
    let mut previous: Option<String> = None;

    for _ in 0..count {
        let key_len = usize::from(reader.read_u16()?);
        let key = decode_string(name, reader.take(key_len)?)?;
        if previous.as_ref().is_some_and(|previous| key <= *previous) {
            return Err(DecodeError::invalid_value(
                name,
                format!("attribute key '{key}' is out of order"),
            ));
        }
        let scalar = match reader.read_u8()? {
            0 => Scalar::Bool(match reader.read_u8()? {
                0 => false,
                1 => true,
                other => {
                    return Err(DecodeError::invalid_value(
                        name,
                        format!("attribute '{key}': bool byte must be 0 or 1, found {other}"),
                    ));
                }
            }),
            1 => Scalar::Int(reader.read_i64()?),
            2 => Scalar::Float(reader.read_f64()?),
            3 => {
                let len = usize::try_from(reader.read_u32()?).unwrap_or(usize::MAX);
                Scalar::Text(decode_string(name, reader.take(len)?)?)
            }
            other => {
                return Err(DecodeError::invalid_value(
                    name,
                    format!("attribute '{key}' has unknown scalar type {other}"),
                ));
            }
        };
        attributes.insert(key.clone(), scalar);
        previous = Some(key);
    }

    if !reader.is_empty() {
        return Err(DecodeError::invalid_value(
            name,
            format!("{} bytes after the last attribute", reader.remaining()),
        ));
    }
    Ok(attributes)
}

pub(crate) fn encode_attributes(attributes: &Attributes) -> Result<Vec<u8>, EncodeError> {
    let count = u32::try_from(attributes.len()).map_err(|_| EncodeError::FieldTooLarge {
        field: "attributes".to_string(),
        length: attributes.len(),
        max: u32::MAX as usize,
    })?;
    let mut out = Vec::new();
    out.extend_from_slice(&count.to_be_bytes());

    for (key, scalar) in attributes {
        let key_len = u16::try_from(key.len()).map_err(|_| EncodeError::FieldTooLarge {
            field: format!("attribute key '{key}'"),
            length: key.len(),
            max: usize::from(u16::MAX),
        })?;
        out.extend_from_slice(&key_len.to_be_bytes());
        out.extend_from_slice(key.as_bytes());
        out.push(scalar.code());
        match scalar {
            Scalar::Bool(value) => out.push(u8::from(*value)),
            Scalar::Int(value) => out.extend_from_slice(&value.to_be_bytes()),
            Scalar::Float(value) => out.extend_from_slice(&value.to_be_bytes()),
            Scalar::Text(value) => {
                let len = u32::try_from(value.len()).map_err(|_| EncodeError::FieldTooLarge {
                    field: format!("attribute '{key}'"),
                    length: value.len(),
                    max: u32::MAX as usize,
                })?;
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(value.as_bytes());
            }
        }
    }
    Ok(out)
}
