//! Recovery tests.
//!
//! A second pipeline over the same log must treat everything already
//! committed as a duplicate and see the same experiment states.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use common::{Producer, exp, pipeline, registry};
use mlens_core::PipelineConfig;
use mlens_events::{
    Accepted, AppendLog, ExperimentState, IngestError, PartitionKey, Pipeline, RecoveryReport,
    TracingLog,
};
use mlens_proto::LifecycleAction::{Complete, Create, Pause, Resume, Start};

#[tokio::test]
async fn recovered_pipeline_sees_committed_ids_and_states() {
    // GIVEN: A log written by one pipeline
    let (first, log) = pipeline(PipelineConfig::default());
    let mut producer = Producer::new();
    let mut delivered = Vec::new();
    for (name, action) in [
        ("exp-1", Create),
        ("exp-1", Start),
        ("exp-1", Pause),
        ("exp-2", Create),
        ("exp-2", Start),
        ("exp-2", Complete),
    ] {
        let bytes = producer.lifecycle(name, action);
        first.ingest(&bytes).await.unwrap();
        delivered.push(bytes);
    }
    let (_, event) = producer.event("exp-1", 10);
    first.ingest(&event).await.unwrap();
    first.shutdown().await;
    delivered.push(event);
    let opaque = producer.opaque(9, b"later");

    // WHEN: A new pipeline recovers from it
    let second = Pipeline::new(
        registry(),
        Arc::new(TracingLog::new(log.clone())),
        PipelineConfig::default(),
    );
    log.append(&PartitionKey::Opaque, opaque.clone()).await.unwrap();
    let report = second.recover().await.unwrap();

    // THEN: Nothing was skipped and every id is a duplicate
    assert_eq!(
        report,
        RecoveryReport {
            partitions: 3,
            entries: 8,
            skipped: 0,
        }
    );
    for bytes in delivered.iter().chain([&opaque]) {
        assert_eq!(second.ingest(bytes).await.unwrap(), Accepted::Duplicate);
    }

    let exp1 = second.experiment(&exp("exp-1")).await.unwrap();
    assert_eq!(exp1.state, ExperimentState::Paused);
    assert_eq!(exp1.events_applied, 1);
    assert_eq!(exp1.history.len(), 3);
    let exp2 = second.experiment(&exp("exp-2")).await.unwrap();
    assert_eq!(exp2.state, ExperimentState::Completed);

    // AND: Lifecycle rules continue from the recovered state
    let err = second
        .ingest(&producer.lifecycle("exp-2", Start))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::InvalidTransition { .. }));
    let resumed = second
        .ingest(&producer.lifecycle("exp-1", Resume))
        .await
        .unwrap();
    assert!(matches!(resumed, Accepted::Applied { .. }));
}

#[tokio::test]
async fn unreadable_entries_are_skipped() {
    let (first, log) = pipeline(PipelineConfig::default());
    let mut producer = Producer::new();
    first
        .ingest(&producer.lifecycle("exp-1", Create))
        .await
        .unwrap();
    log.append(&PartitionKey::Experiment(exp("exp-1")), vec![0xde, 0xad])
        .await
        .unwrap();

    let second = Pipeline::new(registry(), Arc::new(log.clone()), PipelineConfig::default());
    let report = second.recover().await.unwrap();

    assert_eq!(report.entries, 2);
    assert_eq!(report.skipped, 1);
    let experiment = second.experiment(&exp("exp-1")).await.unwrap();
    assert_eq!(experiment.state, ExperimentState::Created);
}

#[tokio::test]
async fn entries_that_restore_nothing_leave_no_partition() {
    // GIVEN: A log whose only experiment entry is a `start` with no `create`
    let (_, log) = pipeline(PipelineConfig::default());
    let mut producer = Producer::new();
    log.append(
        &PartitionKey::Experiment(exp("exp-1")),
        producer.lifecycle("exp-1", Start),
    )
    .await
    .unwrap();

    // WHEN: A pipeline recovers from it
    let recovered = Pipeline::new(registry(), Arc::new(log.clone()), PipelineConfig::default());
    let report = recovered.recover().await.unwrap();

    // THEN: The entry is skipped and no partition is kept for it
    assert_eq!(report.skipped, 1);
    assert_eq!(recovered.partition_count(), 0);
    assert!(recovered.experiment(&exp("exp-1")).await.is_none());
}
