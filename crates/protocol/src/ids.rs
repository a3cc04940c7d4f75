//! Message and experiment identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::DecodeError;

/// Maximum experiment id length in bytes.
pub const MAX_EXPERIMENT_ID_LEN: usize = 128;

/// Globally unique message identifier, the idempotency key for ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Ulid);

impl MessageId {
    /// Generate a new, time-ordered message id.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Build an id from its 16-byte wire form.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Ulid::from_bytes(bytes))
    }

    /// The 16-byte wire form.
    #[must_use]
    pub const fn to_bytes(&self) -> [u8; 16] {
        self.0.to_bytes()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| DecodeError::invalid_value("message_id", e.to_string()))
    }
}

/// Identifier of an experiment: non-empty UTF-8, at most
/// [`MAX_EXPERIMENT_ID_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExperimentId(String);

impl ExperimentId {
    /// Validate and wrap an experiment id.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::InvalidValue`] if the id is empty or too long.
    pub fn parse(id: impl Into<String>) -> Result<Self, DecodeError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DecodeError::invalid_value("experiment_id", "must not be empty"));
        }
        if id.len() > MAX_EXPERIMENT_ID_LEN {
            return Err(DecodeError::invalid_value(
                "experiment_id",
                format!(
                    "{} bytes exceeds the limit of {MAX_EXPERIMENT_ID_LEN}",
                    id.len()
                ),
            ));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ExperimentId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ExperimentId {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ExperimentId> for String {
    fn from(id: ExperimentId) -> Self {
        id.0
    }
}

impl AsRef<str> for ExperimentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_message_id_bytes_roundtrip() {
        let id = MessageId::new();
        assert_eq!(MessageId::from_bytes(id.to_bytes()), id);
    }

    #[test]
    fn test_message_id_parse_display() {
        let id = MessageId::new();
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_experiment_id_rejects_empty() {
        assert!(ExperimentId::parse("").is_err());
    }

    #[test]
    fn test_experiment_id_length_limit() {
        assert!(ExperimentId::parse("a".repeat(MAX_EXPERIMENT_ID_LEN)).is_ok());
        assert!(ExperimentId::parse("a".repeat(MAX_EXPERIMENT_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_experiment_id_serde_validates() {
        let id: ExperimentId = serde_json::from_str("\"exp-1\"").unwrap();
        assert_eq!(id.as_str(), "exp-1");
        assert!(serde_json::from_str::<ExperimentId>("\"\"").is_err());
    }
}
