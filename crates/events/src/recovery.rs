//! Rebuild pipeline state from the log.

use futures::StreamExt;
use mlens_proto::{ContentDigest, MessageBody, RawEnvelope};
use serde::Serialize;
use tap::TapFallible;

use crate::dedup::DedupEntry;
use crate::error::{IngestError, LogError};
use crate::pipeline::{Pipeline, Shared};
use crate::types::{LogEntry, Offset, PartitionKey};

/// What [`Pipeline::recover`] read back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub partitions: usize,
    pub entries: u64,
    /// Entries that no longer decode or no longer apply.
    pub skipped: u64,
}

impl Pipeline {
    /// Replay the log into a fresh pipeline: every committed id becomes a
    /// duplicate and every experiment returns to its last state.
    ///
    /// Call before the first `ingest`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the log cannot list or read a partition.
    pub async fn recover(&self) -> Result<RecoveryReport, LogError> {
        let shared = &self.shared;
        let mut report = RecoveryReport::default();

        for key in shared.log.partitions().await? {
            report.partitions = report.partitions.saturating_add(1);
            let mut entries = shared.log.read(&key, Offset::ZERO);
            while let Some(entry) = entries.next().await {
                let entry = entry?;
                report.entries = report.entries.saturating_add(1);
                let restored = shared.restore(&entry).await.tap_err(|e| {
                    tracing::warn!(
                        partition = %entry.partition,
                        offset = %entry.offset,
                        error = %e,
                        "Skipping log entry during recovery"
                    );
                });
                if restored.is_err() {
                    report.skipped = report.skipped.saturating_add(1);
                }
            }
        }

        tracing::info!(
            partitions = report.partitions,
            entries = report.entries,
            skipped = report.skipped,
            "Recovered from log"
        );
        Ok(report)
    }
}

impl Shared {
    async fn restore(&self, entry: &LogEntry) -> Result<(), IngestError> {
        let envelope = RawEnvelope::decode(&entry.bytes)?;
        let message_id = envelope.header.message_id;
        self.dedup.commit(
            message_id,
            DedupEntry {
                partition: entry.partition.clone(),
                offset: entry.offset,
                digest: ContentDigest::of(&entry.bytes),
            },
        );

        let PartitionKey::Experiment(experiment_id) = &entry.partition else {
            return Ok(());
        };
        let body = self.codec.decode_body(&envelope)?;
        loop {
            let partition = self.partition(experiment_id);
            let mut state = partition.state.lock().await;
            if state.retired {
                continue;
            }

            let result = match &body {
                MessageBody::Experiment(message) => match state.machine.plan(message.action) {
                    Ok(plan) => {
                        let at = envelope.header.produced_at().unwrap_or_default();
                        state
                            .machine
                            .commit(plan, message, at, message_id, entry.offset);
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                MessageBody::Event(event) => {
                    state.machine.record_event(event);
                    Ok(())
                }
                MessageBody::Opaque { .. } => Ok(()),
            };
            // An entry that restored nothing leaves no partition behind.
            self.retire_if_idle(&partition, &mut state);
            return result;
        }
    }
}
