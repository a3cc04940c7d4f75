//! Experiment lifecycle tracking and ordered, idempotent event ingestion.
//!
//! This crate turns a stream of encoded envelopes into an append-only log
//! and a per-experiment lifecycle view. Key features:
//!
//! - **Pipeline**: decode, deduplicate, route, and commit envelopes
//! - **Ordering buffer**: bounded reordering of events by `observed_at`
//! - **State machine**: validated experiment lifecycle transitions
//! - **Append-only log**: the storage collaborator, with an in-memory backend
//! - **Recovery**: rebuild ids and experiment states by replaying the log
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use chrono::Utc;
//! use mlens_core::PipelineConfig;
//! use mlens_events::{Accepted, ExperimentState, InMemoryLog, Pipeline};
//! use mlens_proto::{
//!     Codec, ExperimentId, ExperimentMessage, LifecycleAction, Message, MessageBody, MessageId,
//!     SchemaRegistry, SchemaVersion,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(SchemaRegistry::builtin());
//! let codec = Codec::new(Arc::clone(&registry));
//! let pipeline = Pipeline::new(registry, InMemoryLog::new_arc(), PipelineConfig::default());
//!
//! let id = ExperimentId::parse("exp-1")?;
//! let create = Message::new(
//!     SchemaVersion::V1_1,
//!     MessageId::new(),
//!     Utc::now().timestamp_micros(),
//!     MessageBody::Experiment(ExperimentMessage::new(id.clone(), LifecycleAction::Create)),
//! );
//! let bytes = codec.encode(&create)?;
//!
//! assert!(matches!(pipeline.ingest(&bytes).await?, Accepted::Applied { .. }));
//! assert_eq!(pipeline.ingest(&bytes).await?, Accepted::Duplicate);
//!
//! let experiment = pipeline.experiment(&id).await.ok_or("missing")?;
//! assert_eq!(experiment.state, ExperimentState::Created);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod dedup;
pub mod error;
pub mod log;
pub mod machine;
pub mod ordering;
mod partition;
pub mod pipeline;
pub mod recovery;
pub mod stats;
pub mod types;

pub use dedup::{DedupEntry, DedupIndex};
pub use error::{ErrorClass, IngestError, IngestResult, LogError};
pub use log::{AppendLog, InMemoryLog, TracingLog};
pub use machine::{Experiment, ExperimentMachine, PlannedTransition, Transition};
pub use ordering::{OrderKey, OrderingBuffer, Released};
pub use pipeline::{Accepted, FlushOutcome, OutcomeSubscription, Pipeline};
pub use recovery::RecoveryReport;
pub use stats::{IngestStats, StatsSnapshot};
pub use types::{ExperimentState, LogEntry, Offset, PartitionKey};
