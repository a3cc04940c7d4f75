// Common test infrastructure for pipeline tests

#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use futures::stream::BoxStream;
use mlens_core::PipelineConfig;
use mlens_events::{
    AppendLog, FlushOutcome, InMemoryLog, LogEntry, LogError, Offset, OutcomeSubscription,
    PartitionKey, Pipeline,
};
use mlens_proto::{
    Codec, EnvelopeHeader, Event, EventKind, ExperimentId, ExperimentMessage, LifecycleAction,
    Message, MessageBody, MessageId, PayloadKind, RawEnvelope, SchemaRegistry, SchemaVersion,
};

/// Base observation time; event times in tests are offsets from it in ms.
pub const EPOCH_MICROS: i64 = 1_700_000_000_000_000;

pub fn registry() -> Arc<SchemaRegistry> {
    Arc::new(SchemaRegistry::builtin())
}

pub fn exp(id: &str) -> ExperimentId {
    ExperimentId::parse(id).unwrap()
}

pub fn config(watermark_ms: u64, max_buffer_size: usize, grace_ms: u64) -> PipelineConfig {
    PipelineConfig::new()
        .with_watermark(Duration::from_millis(watermark_ms))
        .with_max_buffer_size(max_buffer_size)
        .with_grace_period(Duration::from_millis(grace_ms))
}

/// Pipeline over a fresh in-memory log; the returned log shares storage.
pub fn pipeline(config: PipelineConfig) -> (Pipeline, InMemoryLog) {
    let log = InMemoryLog::new();
    let pipeline = Pipeline::new(registry(), Arc::new(log.clone()), config);
    (pipeline, log)
}

/// Encodes messages the way a producer would.
pub struct Producer {
    codec: Codec,
    clock: i64,
}

impl Producer {
    pub fn new() -> Self {
        Self {
            codec: Codec::new(registry()),
            clock: EPOCH_MICROS,
        }
    }

    fn message(&mut self, body: MessageBody) -> (MessageId, Vec<u8>) {
        self.message_with_id(MessageId::new(), body)
    }

    fn message_with_id(&mut self, id: MessageId, body: MessageBody) -> (MessageId, Vec<u8>) {
        self.clock += 1;
        let message = Message::new(SchemaVersion::V1_1, id, self.clock, body);
        (id, self.codec.encode(&message).unwrap())
    }

    pub fn lifecycle(&mut self, experiment: &str, action: LifecycleAction) -> Vec<u8> {
        let body = ExperimentMessage::new(exp(experiment), action).with_owner("alice");
        self.message(MessageBody::Experiment(body)).1
    }

    /// Event observed `at_ms` after [`EPOCH_MICROS`].
    pub fn event(&mut self, experiment: &str, at_ms: i64) -> (MessageId, Vec<u8>) {
        self.event_with_id(MessageId::new(), experiment, at_ms)
    }

    /// Like [`Producer::event`] but reusing a given message id.
    pub fn event_with_id(&mut self, id: MessageId, experiment: &str, at_ms: i64) -> (MessageId, Vec<u8>) {
        let observed_at = DateTime::from_timestamp_micros(EPOCH_MICROS + at_ms * 1000).unwrap();
        let event = Event::new(exp(experiment), EventKind::Log, observed_at)
            .with_attribute("line", format!("t={at_ms}"));
        self.message_with_id(id, MessageBody::Event(event))
    }

    /// Envelope of a payload kind no schema knows.
    pub fn opaque(&mut self, code: u8, payload: &[u8]) -> Vec<u8> {
        self.clock += 1;
        let header = EnvelopeHeader::new(
            SchemaVersion::V1_1,
            PayloadKind::from_code(code),
            MessageId::new(),
            self.clock,
        );
        RawEnvelope::new(header, payload.to_vec()).encode().unwrap()
    }
}

/// Wait for the next flush outcome. Fails instead of hanging.
pub async fn next_outcome(subscription: &mut OutcomeSubscription) -> FlushOutcome {
    tokio::time::timeout(Duration::from_secs(60), subscription.recv())
        .await
        .expect("no flush outcome within 60s")
        .expect("outcome channel closed")
}

/// Observation time (ms after the epoch) of each entry in a partition,
/// skipping lifecycle messages.
pub async fn event_times(log: &InMemoryLog, experiment: &str) -> Vec<i64> {
    use futures::TryStreamExt;

    let codec = Codec::new(registry());
    let entries: Vec<LogEntry> = log
        .read(&PartitionKey::Experiment(exp(experiment)), Offset::ZERO)
        .try_collect()
        .await
        .unwrap();
    entries
        .iter()
        .filter_map(|entry| match codec.decode_message(&entry.bytes).unwrap().body {
            MessageBody::Event(event) => Some((event.observed_at_micros() - EPOCH_MICROS) / 1000),
            _ => None,
        })
        .collect()
}

/// Log whose first `failures` appends fail with a retryable error.
pub struct FlakyLog {
    inner: InMemoryLog,
    failures: AtomicU32,
}

impl FlakyLog {
    pub fn new(inner: InMemoryLog, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl AppendLog for FlakyLog {
    async fn append(&self, partition: &PartitionKey, bytes: Vec<u8>) -> Result<Offset, LogError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(LogError::unavailable("disk busy"));
        }
        self.inner.append(partition, bytes).await
    }

    fn read(
        &self,
        partition: &PartitionKey,
        from: Offset,
    ) -> BoxStream<'static, Result<LogEntry, LogError>> {
        self.inner.read(partition, from)
    }

    async fn partitions(&self) -> Result<Vec<PartitionKey>, LogError> {
        self.inner.partitions().await
    }
}
