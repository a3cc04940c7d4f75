//! Command implementations.
//!
//! Each command returns a serializable report; `main` prints it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use itertools::Itertools;
use mlens_core::Config;
use mlens_events::{
    Accepted, Experiment, FlushOutcome, InMemoryLog, IngestResult, Offset, Pipeline,
    StatsSnapshot, TracingLog,
};
use mlens_proto::{Codec, Message, MessageSchema, SchemaRegistry};
use serde::Serialize;

use crate::cli::Commands;
use crate::input::{self, Trailing};
use crate::json::IngestErrorReport;

/// Run one subcommand and return its JSON report.
///
/// # Errors
///
/// Returns an error if the schemas or input files cannot be loaded.
pub async fn execute_command(command: Commands, config: &Config) -> Result<serde_json::Value> {
    let registry = load_registry(config)?;
    let report = match command {
        Commands::Ingest { files } => {
            serde_json::to_value(ingest_files(&files, config, registry).await?)
        }
        Commands::Inspect { file } => {
            let records = inspect_file(&file, registry).await?;
            Ok(serde_json::json!({ "file": file, "records": records }))
        }
        Commands::Schemas => serde_json::to_value(list_schemas(&registry)),
    };
    report.context("Failed to serialize report")
}

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "mlens.toml";

/// Build the effective configuration: file < environment < command line.
///
/// `flags` answers the same keys as the environment (`MLENS_*`).
///
/// # Errors
///
/// Returns an error if the file cannot be read or a value is invalid.
pub fn resolve_config(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
    flags: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let base = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config '{}'", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
            Config::load(Path::new(DEFAULT_CONFIG_FILE))
                .with_context(|| format!("Failed to load config '{DEFAULT_CONFIG_FILE}'"))?
        }
        None => Config::default(),
    };

    base.with_overrides(env)
        .context("Invalid environment override")?
        .with_overrides(flags)
        .context("Invalid command-line override")
}

/// Built-in schemas plus any declared in `schema_file`.
///
/// # Errors
///
/// Returns an error if the schema file cannot be read or is invalid.
pub fn load_registry(config: &Config) -> Result<Arc<SchemaRegistry>> {
    let registry = match &config.schema_file {
        Some(path) => SchemaRegistry::load(path)
            .with_context(|| format!("Failed to load schemas from '{}'", path.display()))?,
        None => SchemaRegistry::builtin(),
    };
    Ok(Arc::new(registry))
}

// ==========================================================================
// INGEST
// ==========================================================================

/// Summary printed by `mlens ingest`.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub files: Vec<FileReport>,
    pub results: Vec<MessageReport>,
    pub flushed: Vec<FlushReport>,
    pub experiments: Vec<Experiment>,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub envelopes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_error: Option<String>,
}

/// Immediate result of one `ingest` call.
#[derive(Debug, Clone, Serialize)]
pub struct MessageReport {
    pub file: PathBuf,
    pub index: usize,
    #[serde(flatten)]
    pub outcome: OutcomeReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutcomeReport {
    Accepted(Accepted),
    Rejected {
        status: &'static str,
        error: IngestErrorReport,
    },
}

impl From<&IngestResult> for OutcomeReport {
    fn from(result: &IngestResult) -> Self {
        match result {
            Ok(accepted) => Self::Accepted(*accepted),
            Err(e) => Self::Rejected {
                status: "rejected",
                error: e.into(),
            },
        }
    }
}

/// Final result of one buffered event.
#[derive(Debug, Clone, Serialize)]
pub struct FlushReport {
    pub message_id: String,
    pub experiment_id: String,
    pub out_of_order: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<Offset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<IngestErrorReport>,
}

impl From<FlushOutcome> for FlushReport {
    fn from(outcome: FlushOutcome) -> Self {
        let (offset, error) = match &outcome.result {
            Ok(offset) => (Some(*offset), None),
            Err(e) => (None, Some(e.into())),
        };
        Self {
            message_id: outcome.message_id.to_string(),
            experiment_id: outcome.experiment_id.to_string(),
            out_of_order: outcome.out_of_order,
            offset,
            error,
        }
    }
}

/// Ingest every envelope of `paths` into a fresh in-memory log, then shut
/// the pipeline down so every buffered event is committed.
///
/// # Errors
///
/// Returns an error if a file cannot be read. Per-envelope failures are
/// part of the report.
pub async fn ingest_files(
    paths: &[PathBuf],
    config: &Config,
    registry: Arc<SchemaRegistry>,
) -> Result<IngestReport> {
    let mut contents = Vec::with_capacity(paths.len());
    for path in paths {
        contents.push((path, input::read_file(path).await?));
    }

    let splits = contents
        .iter()
        .map(|(path, bytes)| (*path, input::split_envelopes(bytes)))
        .collect_vec();
    let total: usize = splits.iter().map(|(_, split)| split.envelopes.len()).sum();

    // Every buffered event may produce an outcome before anyone reads them.
    let mut pipeline_config = config.pipeline.clone();
    pipeline_config.outcome_capacity = pipeline_config.outcome_capacity.max(total);

    let log = Arc::new(TracingLog::new(InMemoryLog::new()));
    let pipeline = Pipeline::new(registry, log, pipeline_config);
    let mut subscription = pipeline.subscribe();

    let mut files = Vec::with_capacity(splits.len());
    let mut results = Vec::with_capacity(total);
    for (path, split) in &splits {
        for (index, envelope) in split.envelopes.iter().enumerate() {
            let result = pipeline.ingest(envelope).await;
            results.push(MessageReport {
                file: (*path).clone(),
                index,
                outcome: OutcomeReport::from(&result),
            });
        }
        files.push(file_report(path, split.envelopes.len(), split.trailing.as_ref()));
    }

    let released = pipeline.shutdown().await;
    tracing::debug!(released, "Pipeline drained");
    let flushed = std::iter::from_fn(|| subscription.try_recv())
        .map(FlushReport::from)
        .collect_vec();

    Ok(IngestReport {
        files,
        results,
        flushed,
        experiments: pipeline.experiments().await,
        stats: pipeline.stats(),
    })
}

fn file_report(path: &Path, envelopes: usize, trailing: Option<&Trailing>) -> FileReport {
    if let Some(trailing) = trailing {
        tracing::warn!(
            path = %path.display(),
            offset = trailing.offset,
            error = %trailing.error,
            "Unreadable bytes at end of file"
        );
    }
    FileReport {
        path: path.to_path_buf(),
        envelopes,
        trailing_error: trailing.map(|t| format!("at byte {}: {}", t.offset, t.error)),
    }
}

// ==========================================================================
// INSPECT
// ==========================================================================

/// One line printed by `mlens inspect`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum InspectRecord {
    Message { index: usize, message: Message },
    Invalid { index: usize, error: String },
}

/// Decode every envelope in `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn inspect_file(path: &Path, registry: Arc<SchemaRegistry>) -> Result<Vec<InspectRecord>> {
    let bytes = input::read_file(path).await?;
    let codec = Codec::new(registry);
    let split = input::split_envelopes(&bytes);

    let mut records = split
        .envelopes
        .iter()
        .enumerate()
        .map(|(index, envelope)| match codec.decode_message(envelope) {
            Ok(message) => InspectRecord::Message { index, message },
            Err(e) => InspectRecord::Invalid {
                index,
                error: e.to_string(),
            },
        })
        .collect_vec();

    if let Some(trailing) = split.trailing {
        records.push(InspectRecord::Invalid {
            index: split.envelopes.len(),
            error: format!("at byte {}: {}", trailing.offset, trailing.error),
        });
    }
    Ok(records)
}

// ==========================================================================
// SCHEMAS
// ==========================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SchemasReport<'a> {
    pub schemas: Vec<&'a MessageSchema>,
}

#[must_use]
pub fn list_schemas(registry: &SchemaRegistry) -> SchemasReport<'_> {
    SchemasReport {
        schemas: registry.schemas().collect_vec(),
    }
}
