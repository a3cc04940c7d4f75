//! End-to-end tests for the `mlens` commands, driven through the library
//! entry points with envelope files on disk.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use mlens::cli::Commands;
use mlens::commands::{InspectRecord, OutcomeReport, execute_command, ingest_files, inspect_file};
use mlens_core::Config;
use mlens_events::{Accepted, ExperimentState};
use mlens_proto::{
    Codec, EnvelopeHeader, Event, EventKind, ExperimentId, ExperimentMessage, LifecycleAction,
    Message, MessageBody, MessageId, PayloadKind, RawEnvelope, SchemaRegistry, SchemaVersion,
};
use tempfile::TempDir;

const EPOCH_MICROS: i64 = 1_700_000_000_000_000;

struct Producer {
    codec: Codec,
    clock: i64,
}

impl Producer {
    fn new() -> Self {
        Self {
            codec: Codec::new(Arc::new(SchemaRegistry::builtin())),
            clock: EPOCH_MICROS,
        }
    }

    fn encode(&mut self, body: MessageBody) -> Vec<u8> {
        self.clock += 1;
        let message = Message::new(SchemaVersion::V1_1, MessageId::new(), self.clock, body);
        self.codec.encode(&message).unwrap()
    }

    fn lifecycle(&mut self, action: LifecycleAction) -> Vec<u8> {
        let id = ExperimentId::parse("exp-1").unwrap();
        self.encode(MessageBody::Experiment(ExperimentMessage::new(id, action)))
    }

    fn event(&mut self, at_ms: i64) -> Vec<u8> {
        let id = ExperimentId::parse("exp-1").unwrap();
        let observed_at = DateTime::from_timestamp_micros(EPOCH_MICROS + at_ms * 1000).unwrap();
        self.encode(MessageBody::Event(Event::new(id, EventKind::Heartbeat, observed_at)))
    }

    fn opaque(&mut self) -> Vec<u8> {
        self.clock += 1;
        let header = EnvelopeHeader::new(
            SchemaVersion::V1_1,
            PayloadKind::from_code(42),
            MessageId::new(),
            self.clock,
        );
        RawEnvelope::new(header, b"opaque".to_vec()).encode().unwrap()
    }
}

fn write_file(dir: &TempDir, name: &str, envelopes: &[Vec<u8>]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, envelopes.concat()).unwrap();
    path
}

// ==========================================================================
// INGEST
// ==========================================================================

#[tokio::test]
async fn test_ingest_orders_events_and_completes_experiment() {
    // GIVEN: a file with a lifecycle, out-of-order events, a duplicate
    // and an envelope of an unknown kind
    let dir = TempDir::new().unwrap();
    let mut producer = Producer::new();
    let late = producer.event(30);
    let envelopes = vec![
        producer.lifecycle(LifecycleAction::Create),
        producer.lifecycle(LifecycleAction::Start),
        late.clone(),
        producer.event(10),
        late,
        producer.event(20),
        producer.opaque(),
        producer.lifecycle(LifecycleAction::Complete),
    ];
    let path = write_file(&dir, "run.bin", &envelopes);

    // WHEN: ingesting it
    let registry = Arc::new(SchemaRegistry::builtin());
    let report = ingest_files(&[path], &Config::default(), registry)
        .await
        .unwrap();

    // THEN: every envelope has a result and events were committed in order
    assert_eq!(report.results.len(), 8);
    assert!(matches!(
        report.results[4].outcome,
        OutcomeReport::Accepted(Accepted::Duplicate)
    ));
    assert!(matches!(
        report.results[6].outcome,
        OutcomeReport::Accepted(Accepted::PassedThrough { .. })
    ));

    assert_eq!(report.flushed.len(), 3);
    assert!(report.flushed.iter().all(|f| f.error.is_none()));
    let offsets: Vec<_> = report.flushed.iter().map(|f| f.offset).collect();
    let mut sorted = offsets.clone();
    sorted.sort();
    assert_eq!(offsets, sorted);

    assert_eq!(report.experiments.len(), 1);
    assert_eq!(report.experiments[0].state, ExperimentState::Completed);
    assert_eq!(report.experiments[0].events_applied, 3);

    assert_eq!(report.stats.duplicates, 1);
    assert_eq!(report.stats.passed_through, 1);
    assert_eq!(report.stats.buffered, 3);
}

#[tokio::test]
async fn test_ingest_reports_truncated_tail_and_rejections() {
    // GIVEN: an event for an experiment that is never created, followed by
    // a cut-off envelope
    let dir = TempDir::new().unwrap();
    let mut producer = Producer::new();
    let mut cut = producer.event(5);
    cut.truncate(10);
    let path = write_file(&dir, "broken.bin", &[producer.event(1), cut]);

    let config = mlens_core::Config::default()
        .with_overrides(|key| (key == "MLENS_GRACE_PERIOD_MS").then(|| "0".to_string()))
        .unwrap();

    // WHEN
    let report = ingest_files(&[path], &config, Arc::new(SchemaRegistry::builtin()))
        .await
        .unwrap();

    // THEN: the tail is reported and the orphan is rejected at shutdown
    assert_eq!(report.files[0].envelopes, 1);
    assert!(report.files[0].trailing_error.is_some());
    assert_eq!(report.flushed.len(), 1);
    let error = report.flushed[0].error.as_ref().unwrap();
    assert_eq!(error.kind, "unknown_experiment");
    assert!(report.experiments.is_empty());
}

#[tokio::test]
async fn test_ingest_missing_file_fails() {
    let result = ingest_files(
        &[PathBuf::from("/nonexistent/run.bin")],
        &Config::default(),
        Arc::new(SchemaRegistry::builtin()),
    )
    .await;
    assert!(result.is_err());
}

// ==========================================================================
// INSPECT AND SCHEMAS
// ==========================================================================

#[tokio::test]
async fn test_inspect_decodes_opaque_kinds_and_reports_truncation() {
    let dir = TempDir::new().unwrap();
    let mut producer = Producer::new();
    let mut cut = producer.lifecycle(LifecycleAction::Start);
    cut.truncate(cut.len() - 1);
    let path = write_file(
        &dir,
        "mixed.bin",
        &[producer.lifecycle(LifecycleAction::Create), producer.opaque(), cut],
    );

    let records = inspect_file(&path, Arc::new(SchemaRegistry::builtin()))
        .await
        .unwrap();

    assert_eq!(records.len(), 3);
    assert!(matches!(records[0], InspectRecord::Message { index: 0, .. }));
    assert!(matches!(
        &records[1],
        InspectRecord::Message { index: 1, message } if matches!(message.body, MessageBody::Opaque { code: 42, .. })
    ));
    assert!(matches!(records[2], InspectRecord::Invalid { index: 2, .. }));
}

#[tokio::test]
async fn test_schemas_command_json() {
    let value = execute_command(Commands::Schemas, &Config::default())
        .await
        .unwrap();
    assert_eq!(value["schemas"].as_array().map(Vec::len), Some(4));
}
