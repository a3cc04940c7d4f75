//! Per-experiment state guarded by one lock.

use std::time::Duration;

use mlens_proto::{ContentDigest, Event, ExperimentId, MessageId};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::machine::ExperimentMachine;
use crate::ordering::OrderingBuffer;
use crate::types::PartitionKey;

/// An event accepted but not yet appended.
#[derive(Debug, Clone)]
pub(crate) struct BufferedEvent {
    pub message_id: MessageId,
    pub bytes: Vec<u8>,
    pub digest: ContentDigest,
    pub event: Event,
}

/// An event waiting for its experiment's `create`.
#[derive(Debug)]
pub(crate) struct Orphan {
    pub event: BufferedEvent,
    pub deadline: Instant,
}

#[derive(Debug)]
pub(crate) struct PartitionState {
    pub machine: ExperimentMachine,
    pub buffer: OrderingBuffer<BufferedEvent>,
    /// Arrival order.
    pub orphans: Vec<Orphan>,
    pub timer: Option<JoinHandle<()>>,
    /// Removed from the partition map. A caller holding a stale handle
    /// looks the partition up again.
    pub retired: bool,
}

impl PartitionState {
    /// Earliest instant at which buffered or orphaned events need attention.
    pub fn next_deadline(&self) -> Option<Instant> {
        let orphan = self.orphans.iter().map(|o| o.deadline).min();
        match (self.buffer.deadline(), orphan) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Remove and return orphans whose grace period has elapsed.
    pub fn take_expired_orphans(&mut self, now: Instant) -> Vec<Orphan> {
        let (expired, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.orphans)
            .into_iter()
            .partition(|o| o.deadline <= now);
        self.orphans = waiting;
        expired
    }

    /// No experiment and nothing held for one.
    pub fn is_idle(&self) -> bool {
        !self.machine.exists() && self.orphans.is_empty() && self.buffer.is_empty()
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// One experiment's partition.
#[derive(Debug)]
pub(crate) struct Partition {
    pub key: PartitionKey,
    pub id: ExperimentId,
    pub state: Mutex<PartitionState>,
    /// Wakes the flush timer when a deadline may have moved.
    pub wake: Notify,
}

impl Partition {
    pub fn new(id: ExperimentId, watermark: Duration, max_buffer_size: usize) -> Self {
        Self {
            key: PartitionKey::Experiment(id.clone()),
            state: Mutex::new(PartitionState {
                machine: ExperimentMachine::new(id.clone()),
                buffer: OrderingBuffer::new(watermark, max_buffer_size),
                orphans: Vec::new(),
                timer: None,
                retired: false,
            }),
            id,
            wake: Notify::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::Utc;
    use mlens_proto::EventKind;

    use super::*;

    fn buffered(id: &ExperimentId) -> BufferedEvent {
        BufferedEvent {
            message_id: MessageId::new(),
            bytes: Vec::new(),
            digest: ContentDigest::of(&[]),
            event: Event::new(id.clone(), EventKind::Log, Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_next_deadline_is_earliest_of_buffer_and_orphans() {
        let id = ExperimentId::parse("exp-1").unwrap();
        let partition = Partition::new(id.clone(), Duration::from_millis(100), 8);
        let mut state = partition.state.lock().await;
        assert_eq!(state.next_deadline(), None);

        let now = Instant::now();
        state.buffer.push(0, 0, buffered(&id), now);
        state.orphans.push(Orphan {
            event: buffered(&id),
            deadline: now + Duration::from_millis(40),
        });
        assert_eq!(
            state.next_deadline(),
            Some(now + Duration::from_millis(40))
        );

        let expired = state.take_expired_orphans(now + Duration::from_millis(40));
        assert_eq!(expired.len(), 1);
        assert!(!state.is_idle());
        assert_eq!(
            state.next_deadline(),
            Some(now + Duration::from_millis(100))
        );

        state.buffer.drain();
        assert!(state.is_idle());
    }
}
