//! Ingestion pipeline.
//!
//! `ingest` decodes an envelope, drops re-deliveries, and routes the body:
//! lifecycle messages go straight to the experiment's state machine,
//! events go through the experiment's ordering buffer, and unknown kinds
//! are passed through to the opaque partition.
//!
//! A message id is reserved in one index shared by every partition before
//! the envelope is routed, so an id is accepted at most once whichever
//! experiment it names. The reservation is committed when the entry is
//! appended and released when the envelope is rejected, its orphan expires
//! or the append fails.
//!
//! Each experiment is a partition with its own lock. A partition exists
//! only while it has an experiment or holds events waiting for one.
//!
//! Buffered events are committed later (watermark, overflow, terminal
//! transition, `flush`, `shutdown`); their results are published as
//! [`FlushOutcome`]s on a broadcast channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mlens_core::PipelineConfig;
use mlens_proto::{
    Codec, ContentDigest, ExperimentId, ExperimentMessage, LifecycleAction, MessageBody,
    MessageId, RawEnvelope, SchemaRegistry,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::dedup::{DedupEntry, DedupIndex};
use crate::error::{ErrorClass, IngestError, IngestResult};
use crate::log::AppendLog;
use crate::machine::Experiment;
use crate::ordering::Released;
use crate::partition::{BufferedEvent, Orphan, Partition, PartitionState};
use crate::stats::{IngestStats, StatsSnapshot};
use crate::types::{ExperimentState, Offset, PartitionKey};

/// Successful result of [`Pipeline::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Accepted {
    /// Appended and applied.
    Applied { offset: Offset },
    /// Already committed or already buffered. Nothing changed.
    Duplicate,
    /// Held for ordering. The result arrives later as a [`FlushOutcome`].
    Buffered,
    /// Unknown payload kind appended to the opaque partition.
    PassedThrough { offset: Offset },
}

/// Result of committing one buffered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    pub message_id: MessageId,
    pub experiment_id: ExperimentId,
    /// Released after an event that sorts after it.
    pub out_of_order: bool,
    pub result: Result<Offset, IngestError>,
}

/// Receiver of [`FlushOutcome`]s.
pub struct OutcomeSubscription {
    receiver: broadcast::Receiver<FlushOutcome>,
}

impl OutcomeSubscription {
    /// Next outcome, or `None` once the pipeline is dropped.
    pub async fn recv(&mut self) -> Option<FlushOutcome> {
        loop {
            match self.receiver.recv().await {
                Ok(outcome) => return Some(outcome),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Outcome subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next outcome if one is ready.
    pub fn try_recv(&mut self) -> Option<FlushOutcome> {
        loop {
            match self.receiver.try_recv() {
                Ok(outcome) => return Some(outcome),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Outcome subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }
}

/// The ingestion pipeline. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Pipeline {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) codec: Codec,
    pub(crate) log: Arc<dyn AppendLog>,
    config: PipelineConfig,
    pub(crate) dedup: DedupIndex,
    partitions: DashMap<ExperimentId, Arc<Partition>>,
    outcomes: broadcast::Sender<FlushOutcome>,
    stats: IngestStats,
    shut_down: AtomicBool,
}

impl Pipeline {
    /// Create a pipeline over `log`. Schemas are resolved through `registry`.
    #[must_use]
    pub fn new(
        registry: Arc<SchemaRegistry>,
        log: Arc<dyn AppendLog>,
        config: PipelineConfig,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(config.outcome_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                codec: Codec::new(registry),
                log,
                config,
                dedup: DedupIndex::new(),
                partitions: DashMap::new(),
                outcomes,
                stats: IngestStats::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Ingest one encoded envelope.
    ///
    /// Rejections are logged and counted; they never stop the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an [`IngestError`]; see [`IngestError::class`] for whether
    /// the same bytes may be retried.
    pub async fn ingest(&self, bytes: &[u8]) -> IngestResult {
        let shared = &self.shared;
        if let Err(e) = shared.ensure_running() {
            shared.note_error(None, None, &e);
            return Err(e);
        }

        let envelope = match RawEnvelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                let err = IngestError::from(e);
                shared.note_error(None, None, &err);
                return Err(err);
            }
        };
        let message_id = envelope.header.message_id;

        let result = shared.ingest_envelope(&envelope, bytes).await;
        match &result {
            Ok(accepted) => {
                shared.note_accepted(accepted);
                tracing::debug!(message_id = %message_id, status = ?accepted, "Envelope accepted");
            }
            Err(e) => shared.note_error(Some(message_id), None, e),
        }
        result
    }

    /// Subscribe to outcomes of buffered events.
    #[must_use]
    pub fn subscribe(&self) -> OutcomeSubscription {
        OutcomeSubscription {
            receiver: self.shared.outcomes.subscribe(),
        }
    }

    /// Commit every buffered event now, in each experiment's key order.
    /// Events waiting for their experiment's `create` keep waiting.
    ///
    /// Returns how many events were released.
    pub async fn flush(&self) -> usize {
        let mut released_total: usize = 0;
        for partition in self.shared.partition_list() {
            let mut state = partition.state.lock().await;
            let released = state.buffer.drain();
            released_total = released_total.saturating_add(released.len());
            self.shared
                .commit_released(&partition, &mut state, released)
                .await;
        }
        released_total
    }

    /// Stop accepting envelopes, commit every buffered event, and reject
    /// events still waiting for their experiment.
    ///
    /// Returns how many buffered events were released.
    pub async fn shutdown(&self) -> usize {
        self.shared.shut_down.store(true, Ordering::Release);

        let mut released_total: usize = 0;
        for partition in self.shared.partition_list() {
            let mut state = partition.state.lock().await;
            let released = state.buffer.drain();
            released_total = released_total.saturating_add(released.len());
            self.shared
                .commit_released(&partition, &mut state, released)
                .await;
            for orphan in std::mem::take(&mut state.orphans) {
                self.shared.expire_orphan(&partition, orphan);
            }
            state.cancel_timer();
            self.shared.retire_if_idle(&partition, &mut state);
        }

        tracing::info!(released = released_total, "Pipeline shut down");
        released_total
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    /// Current view of one experiment.
    pub async fn experiment(&self, id: &ExperimentId) -> Option<Experiment> {
        let partition = self
            .shared
            .partitions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))?;
        let state = partition.state.lock().await;
        state.machine.experiment().cloned()
    }

    /// Every created experiment, ordered by id.
    pub async fn experiments(&self) -> Vec<Experiment> {
        let mut experiments = Vec::new();
        for partition in self.shared.partition_list() {
            let state = partition.state.lock().await;
            if let Some(experiment) = state.machine.experiment() {
                experiments.push(experiment.clone());
            }
        }
        experiments
    }

    /// Experiments created or awaited right now.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.shared.partitions.len()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    #[must_use]
    pub fn codec(&self) -> &Codec {
        &self.shared.codec
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.shared.config)
            .field("partitions", &self.partition_count())
            .field("committed", &self.shared.dedup.committed())
            .field("pending", &self.shared.dedup.pending())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn ensure_running(&self) -> Result<(), IngestError> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(IngestError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn existing_partition(&self, id: &ExperimentId) -> Option<Arc<Partition>> {
        self.partitions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn partition(&self, id: &ExperimentId) -> Arc<Partition> {
        if let Some(entry) = self.partitions.get(id) {
            return Arc::clone(entry.value());
        }
        let entry = self.partitions.entry(id.clone()).or_insert_with(|| {
            Arc::new(Partition::new(
                id.clone(),
                self.config.watermark(),
                self.config.max_buffer_size,
            ))
        });
        Arc::clone(entry.value())
    }

    /// Drop `partition` from the map once it has nothing left to hold.
    /// Callers that locked it before this see `retired` and look again.
    pub(crate) fn retire_if_idle(&self, partition: &Partition, state: &mut PartitionState) {
        if state.retired || !state.is_idle() {
            return;
        }
        state.retired = true;
        self.partitions.remove_if(&partition.id, |_, live| {
            std::ptr::eq(Arc::as_ptr(live), partition)
        });
        tracing::debug!(experiment_id = %partition.id, "Partition retired");
    }

    fn partition_list(&self) -> Vec<Arc<Partition>> {
        let mut partitions: Vec<Arc<Partition>> = self
            .partitions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        partitions.sort_by(|a, b| a.id.cmp(&b.id));
        partitions
    }

    async fn ingest_envelope(
        self: &Arc<Self>,
        envelope: &RawEnvelope,
        bytes: &[u8],
    ) -> IngestResult {
        let message_id = envelope.header.message_id;
        let digest = ContentDigest::of(bytes);
        if !self.dedup.reserve(message_id, &digest) {
            return Ok(Accepted::Duplicate);
        }

        let result = self.route(envelope, bytes, digest).await;
        if result.is_err() {
            self.dedup.release(message_id);
        }
        result
    }

    async fn route(
        self: &Arc<Self>,
        envelope: &RawEnvelope,
        bytes: &[u8],
        digest: ContentDigest,
    ) -> IngestResult {
        let message_id = envelope.header.message_id;
        let body = self.codec.decode_body(envelope)?;
        let at = envelope.header.produced_at().unwrap_or_default();

        match body {
            MessageBody::Opaque { .. } => self.pass_through(message_id, bytes, digest).await,
            MessageBody::Experiment(message) => {
                self.apply_lifecycle(message_id, bytes, digest, &message, at)
                    .await
            }
            MessageBody::Event(event) => {
                self.buffer_event(BufferedEvent {
                    message_id,
                    bytes: bytes.to_vec(),
                    digest,
                    event,
                })
                .await
            }
        }
    }

    async fn pass_through(
        &self,
        message_id: MessageId,
        bytes: &[u8],
        digest: ContentDigest,
    ) -> IngestResult {
        self.ensure_running()?;
        let offset = self
            .log
            .append(&PartitionKey::Opaque, bytes.to_vec())
            .await?;
        self.dedup.commit(
            message_id,
            DedupEntry {
                partition: PartitionKey::Opaque,
                offset,
                digest,
            },
        );
        Ok(Accepted::PassedThrough { offset })
    }

    /// Only `create` brings a partition into existence.
    async fn apply_lifecycle(
        self: &Arc<Self>,
        message_id: MessageId,
        bytes: &[u8],
        digest: ContentDigest,
        message: &ExperimentMessage,
        at: DateTime<Utc>,
    ) -> IngestResult {
        let id = &message.experiment_id;
        loop {
            let partition = if message.action == LifecycleAction::Create {
                self.partition(id)
            } else {
                self.existing_partition(id)
                    .ok_or_else(|| IngestError::unknown_experiment(id))?
            };
            let mut state = partition.state.lock().await;
            if state.retired {
                continue;
            }

            let result = self
                .apply_locked(&partition, &mut state, message_id, bytes, digest, message, at)
                .await;
            if result.is_err() {
                self.retire_if_idle(&partition, &mut state);
            }
            return result;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_locked(
        self: &Arc<Self>,
        partition: &Arc<Partition>,
        state: &mut PartitionState,
        message_id: MessageId,
        bytes: &[u8],
        digest: ContentDigest,
        message: &ExperimentMessage,
        at: DateTime<Utc>,
    ) -> IngestResult {
        self.ensure_running()?;
        let plan = state.machine.plan(message.action)?;
        if plan.is_terminal() {
            let released = state.buffer.drain();
            self.commit_released(partition, state, released).await;
        }

        let offset = self.log.append(&partition.key, bytes.to_vec()).await?;
        self.dedup.commit(
            message_id,
            DedupEntry {
                partition: partition.key.clone(),
                offset,
                digest,
            },
        );
        state.machine.commit(plan, message, at, message_id, offset);
        tracing::info!(
            experiment_id = %partition.id,
            action = %plan.action,
            state = %plan.to,
            offset = %offset,
            "Experiment transitioned"
        );

        if plan.to == ExperimentState::Created {
            self.adopt_orphans(partition, state).await;
        }
        if plan.is_terminal() {
            state.cancel_timer();
        }
        Ok(Accepted::Applied { offset })
    }

    /// An event for an unknown experiment creates its partition and waits
    /// there as an orphan.
    async fn buffer_event(self: &Arc<Self>, buffered: BufferedEvent) -> IngestResult {
        loop {
            let partition = self.partition(&buffered.event.experiment_id);
            let mut state = partition.state.lock().await;
            if state.retired {
                continue;
            }

            let result = self.buffer_locked(&partition, &mut state, buffered).await;
            if result.is_err() {
                self.retire_if_idle(&partition, &mut state);
            }
            return result;
        }
    }

    async fn buffer_locked(
        self: &Arc<Self>,
        partition: &Arc<Partition>,
        state: &mut PartitionState,
        buffered: BufferedEvent,
    ) -> IngestResult {
        self.ensure_running()?;

        let message_id = buffered.message_id;
        let now = Instant::now();
        if state.machine.exists() {
            state.machine.accepts_event(&buffered.event)?;
            let observed_at = buffered.event.observed_at_micros();
            let hint = buffered.event.sequence_hint;
            state.buffer.push(observed_at, hint, buffered, now);
            let released = state.buffer.pop_overflow();
            self.commit_released(partition, state, released).await;
        } else {
            let deadline = now
                .checked_add(self.config.grace_period())
                .unwrap_or(now);
            tracing::debug!(
                message_id = %message_id,
                experiment_id = %partition.id,
                "Holding event until experiment is created"
            );
            state.orphans.push(Orphan {
                event: buffered,
                deadline,
            });
        }

        self.arm_timer(partition, state);
        Ok(Accepted::Buffered)
    }

    /// Move events that were waiting for `create` into the ordering buffer.
    async fn adopt_orphans(self: &Arc<Self>, partition: &Arc<Partition>, state: &mut PartitionState) {
        if state.orphans.is_empty() {
            return;
        }
        let now = Instant::now();
        for orphan in std::mem::take(&mut state.orphans) {
            let observed_at = orphan.event.event.observed_at_micros();
            let hint = orphan.event.event.sequence_hint;
            state.buffer.push(observed_at, hint, orphan.event, now);
            let released = state.buffer.pop_overflow();
            self.commit_released(partition, state, released).await;
        }
        self.arm_timer(partition, state);
    }

    /// Make sure a flush timer is watching this partition's next deadline.
    fn arm_timer(self: &Arc<Self>, partition: &Arc<Partition>, state: &mut PartitionState) {
        if state.next_deadline().is_none() {
            return;
        }
        if state.timer.as_ref().is_some_and(|timer| !timer.is_finished()) {
            partition.wake.notify_one();
        } else {
            state.timer = Some(tokio::spawn(run_flush_timer(
                Arc::downgrade(self),
                Arc::clone(partition),
            )));
        }
    }

    /// Commit what the buffer released and expire overdue orphans.
    async fn flush_due(&self, partition: &Partition, state: &mut PartitionState, now: Instant) {
        let released = state.buffer.pop_due(now);
        self.commit_released(partition, state, released).await;
        for orphan in state.take_expired_orphans(now) {
            self.expire_orphan(partition, orphan);
        }
        self.retire_if_idle(partition, state);
    }

    async fn commit_released(
        &self,
        partition: &Partition,
        state: &mut PartitionState,
        released: Vec<Released<BufferedEvent>>,
    ) {
        for item in released {
            self.commit_event(partition, state, item.item, item.out_of_order)
                .await;
        }
    }

    async fn commit_event(
        &self,
        partition: &Partition,
        state: &mut PartitionState,
        buffered: BufferedEvent,
        out_of_order: bool,
    ) {
        let BufferedEvent {
            message_id,
            bytes,
            digest,
            event,
        } = buffered;

        let result = match state.machine.accepts_event(&event) {
            Err(e) => Err(e),
            Ok(()) => match self.log.append(&partition.key, bytes).await {
                Ok(offset) => {
                    self.dedup.commit(
                        message_id,
                        DedupEntry {
                            partition: partition.key.clone(),
                            offset,
                            digest,
                        },
                    );
                    state.machine.record_event(&event);
                    Ok(offset)
                }
                Err(e) => Err(IngestError::from(e)),
            },
        };

        match &result {
            Ok(offset) => {
                self.stats.record_applied(out_of_order);
                tracing::debug!(
                    message_id = %message_id,
                    experiment_id = %partition.id,
                    offset = %offset,
                    out_of_order,
                    "Event committed"
                );
            }
            Err(e) => {
                self.dedup.release(message_id);
                self.note_error(Some(message_id), Some(&partition.id), e);
            }
        }

        self.publish(FlushOutcome {
            message_id,
            experiment_id: partition.id.clone(),
            out_of_order,
            result,
        });
    }

    fn expire_orphan(&self, partition: &Partition, orphan: Orphan) {
        let message_id = orphan.event.message_id;
        self.dedup.release(message_id);
        let err = IngestError::unknown_experiment(&partition.id);
        self.note_error(Some(message_id), Some(&partition.id), &err);
        self.publish(FlushOutcome {
            message_id,
            experiment_id: partition.id.clone(),
            out_of_order: false,
            result: Err(err),
        });
    }

    fn publish(&self, outcome: FlushOutcome) {
        // No subscribers is fine.
        let _ = self.outcomes.send(outcome);
    }

    fn note_accepted(&self, accepted: &Accepted) {
        match accepted {
            Accepted::Applied { .. } => self.stats.record_applied(false),
            Accepted::Duplicate => self.stats.record_duplicate(),
            Accepted::Buffered => self.stats.record_buffered(),
            Accepted::PassedThrough { .. } => self.stats.record_passed_through(),
        }
    }

    fn note_error(
        &self,
        message_id: Option<MessageId>,
        experiment_id: Option<&ExperimentId>,
        err: &IngestError,
    ) {
        let class = err.class();
        self.stats.record_error(class);
        let message_id = message_id.map(|id| id.to_string());
        let experiment_id = experiment_id.map(ExperimentId::as_str);
        match class {
            ErrorClass::Rejected | ErrorClass::Retryable => tracing::warn!(
                message_id,
                experiment_id,
                kind = err.kind(),
                class = ?class,
                error = %err,
                "Envelope not accepted"
            ),
            ErrorClass::Fatal => tracing::error!(
                message_id,
                experiment_id,
                kind = err.kind(),
                error = %err,
                "Fatal ingestion failure"
            ),
        }
    }
}

/// Flush one partition whenever its next deadline passes.
///
/// Exits when the partition has nothing left to wait for or the pipeline
/// is dropped.
async fn run_flush_timer(shared: Weak<Shared>, partition: Arc<Partition>) {
    loop {
        let Some(pipeline) = shared.upgrade() else {
            return;
        };
        let next = {
            let mut state = partition.state.lock().await;
            pipeline
                .flush_due(&partition, &mut state, Instant::now())
                .await;
            let next = state.next_deadline();
            if next.is_none() {
                state.timer = None;
            }
            next
        };
        drop(pipeline);

        let Some(deadline) = next else {
            return;
        };
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {}
            () = partition.wake.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_accepted_json_is_status_tagged() {
        let applied = serde_json::to_value(Accepted::Applied { offset: Offset::ZERO }).unwrap();
        assert_eq!(applied, serde_json::json!({ "status": "applied", "offset": 0 }));

        let duplicate = serde_json::to_value(Accepted::Duplicate).unwrap();
        assert_eq!(duplicate, serde_json::json!({ "status": "duplicate" }));
    }
}
