//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mlens_core::config::{ENV_GRACE_PERIOD_MS, ENV_MAX_BUFFER_SIZE, ENV_SCHEMA_FILE, ENV_WATERMARK_MS};

/// mlens - experiment telemetry ingestion
#[derive(Parser, Debug)]
#[command(name = "mlens")]
#[command(version)]
#[command(about = "Decode, order and ingest experiment telemetry envelopes")]
#[command(
    long_about = "mlens reads files of back-to-back telemetry envelopes, validates them against the schema registry, orders events per experiment and applies lifecycle transitions. Every command prints one JSON document on stdout."
)]
pub struct Cli {
    /// Configuration file (defaults to ./mlens.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// How long an event waits in the ordering buffer
    #[arg(long, global = true)]
    pub watermark_ms: Option<u64>,

    /// Buffered events per experiment before the oldest is forced out
    #[arg(long, global = true)]
    pub max_buffer_size: Option<usize>,

    /// How long events for an unknown experiment wait for its create
    #[arg(long, global = true)]
    pub grace_period_ms: Option<u64>,

    /// Extra schema declarations (TOML)
    #[arg(long, global = true)]
    pub schema_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest envelope files and print a summary
    Ingest {
        /// Envelope files, ingested in order
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Decode every envelope in a file without ingesting it
    Inspect {
        /// Envelope file
        file: PathBuf,
    },

    /// List registered schemas
    Schemas,
}

impl Cli {
    /// Look up a flag by its environment key, so flags layer over the
    /// environment through the same override path.
    #[must_use]
    pub fn flag(&self, key: &str) -> Option<String> {
        match key {
            ENV_WATERMARK_MS => self.watermark_ms.map(|v| v.to_string()),
            ENV_MAX_BUFFER_SIZE => self.max_buffer_size.map(|v| v.to_string()),
            ENV_GRACE_PERIOD_MS => self.grace_period_ms.map(|v| v.to_string()),
            ENV_SCHEMA_FILE => self
                .schema_file
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            _ => None,
        }
    }
}
