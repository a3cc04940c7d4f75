//! Idempotency index keyed by message id.
//!
//! An id is reserved when its envelope is first accepted and committed once
//! its entry is appended. A reservation that does not end in a commit
//! (rejection, failed append, expired orphan) is released so the id can be
//! delivered again.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use mlens_proto::{ContentDigest, MessageId};
use serde::Serialize;

use crate::types::{Offset, PartitionKey};

/// Where a committed message landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DedupEntry {
    pub partition: PartitionKey,
    pub offset: Offset,
    pub digest: ContentDigest,
}

#[derive(Debug, Clone)]
enum Slot {
    /// Accepted, not yet appended.
    Pending(ContentDigest),
    Committed(DedupEntry),
}

impl Slot {
    fn digest(&self) -> &ContentDigest {
        match self {
            Self::Pending(digest) | Self::Committed(DedupEntry { digest, .. }) => digest,
        }
    }
}

/// Message ids that are in flight or durably appended, across every
/// partition.
///
/// Sharded, so lookups for different experiments do not contend.
#[derive(Debug, Default)]
pub struct DedupIndex {
    slots: DashMap<MessageId, Slot>,
}

impl DedupIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for a new envelope. Returns `false` if the id is already
    /// pending or committed, whichever experiment it named.
    ///
    /// A re-delivery with different bytes under the same id is still a
    /// duplicate; it is logged because the producer reused an id.
    pub fn reserve(&self, id: MessageId, digest: &ContentDigest) -> bool {
        match self.slots.entry(id) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Pending(*digest));
                true
            }
            Entry::Occupied(occupied) => {
                let known = occupied.get().digest();
                if known != digest {
                    tracing::warn!(
                        message_id = %id,
                        known = %known,
                        received = %digest,
                        "Message id reused with different content"
                    );
                }
                false
            }
        }
    }

    /// Record that `id` was appended at `entry`.
    pub fn commit(&self, id: MessageId, entry: DedupEntry) {
        self.slots.insert(id, Slot::Committed(entry));
    }

    /// Drop a reservation that will not be committed. Committed ids are
    /// kept.
    pub fn release(&self, id: MessageId) {
        self.slots
            .remove_if(&id, |_, slot| matches!(slot, Slot::Pending(_)));
    }

    /// Where `id` was committed, if it was.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<DedupEntry> {
        self.slots.get(&id).and_then(|slot| match slot.value() {
            Slot::Committed(entry) => Some(entry.clone()),
            Slot::Pending(_) => None,
        })
    }

    /// Number of committed ids.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Committed(_)))
            .count()
    }

    /// Number of reserved ids not yet committed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.slots.len().saturating_sub(self.committed())
    }
}
