//! Reading envelope files.
//!
//! An envelope file is any number of envelopes written back to back. Each
//! envelope carries its own payload length, so no extra framing is needed.

use std::path::Path;

use anyhow::{Context, Result};
use mlens_proto::{DecodeError, RawEnvelope};

/// Envelopes found in one buffer.
#[derive(Debug)]
pub struct Split<'a> {
    pub envelopes: Vec<&'a [u8]>,
    /// Where framing broke down, if the buffer did not end cleanly.
    pub trailing: Option<Trailing>,
}

/// Bytes after the last complete envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailing {
    pub offset: usize,
    pub error: DecodeError,
}

/// Split concatenated envelopes. Stops at the first frame that cannot be
/// read, since the next envelope boundary is unknown after that point.
#[must_use]
pub fn split_envelopes(bytes: &[u8]) -> Split<'_> {
    let mut envelopes = Vec::new();
    let mut offset = 0;

    while let Some(rest) = bytes.get(offset..).filter(|rest| !rest.is_empty()) {
        match RawEnvelope::decode_prefix(rest) {
            Ok((_, consumed)) => {
                let Some(frame) = rest.get(..consumed) else {
                    break;
                };
                envelopes.push(frame);
                offset = offset.saturating_add(consumed);
            }
            Err(error) => {
                return Split {
                    envelopes,
                    trailing: Some(Trailing { offset, error }),
                };
            }
        }
    }

    Split {
        envelopes,
        trailing: None,
    }
}

/// Read a whole envelope file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read envelope file '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use mlens_proto::{EnvelopeHeader, MessageId, PayloadKind, SchemaVersion};

    use super::*;

    fn envelope(payload: &[u8]) -> Vec<u8> {
        let header = EnvelopeHeader::new(
            SchemaVersion::V1_1,
            PayloadKind::from_code(7),
            MessageId::new(),
            0,
        );
        RawEnvelope::new(header, payload.to_vec()).encode().unwrap()
    }

    #[test]
    fn test_split_back_to_back_envelopes() {
        let a = envelope(b"first");
        let b = envelope(b"");
        let bytes = [a.clone(), b.clone()].concat();

        let split = split_envelopes(&bytes);
        assert_eq!(split.envelopes, vec![a.as_slice(), b.as_slice()]);
        assert!(split.trailing.is_none());
    }

    #[test]
    fn test_truncated_tail_is_reported() {
        let a = envelope(b"first");
        let mut bytes = a.clone();
        bytes.extend_from_slice(&[0, 1, 0]);

        let split = split_envelopes(&bytes);
        assert_eq!(split.envelopes.len(), 1);
        let trailing = split.trailing.unwrap();
        assert_eq!(trailing.offset, a.len());
        assert!(matches!(trailing.error, DecodeError::Truncated { .. }));
    }

    #[test]
    fn test_empty_input() {
        let split = split_envelopes(&[]);
        assert!(split.envelopes.is_empty());
        assert!(split.trailing.is_none());
    }
}
