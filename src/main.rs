//! # mlens
//!
//! Entry point: parse arguments, layer configuration (file, environment,
//! flags), start tracing on stderr and print one JSON document on stdout.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use mlens::cli::Cli;
use mlens::commands::{execute_command, resolve_config};
use mlens::json::{ErrorCode, JsonError, JsonSuccess};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(report) => {
            print_json(&JsonSuccess::new(report));
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Command failed");
            print_json(&JsonError::new(ErrorCode::classify(&e), format!("{e:#}")));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<serde_json::Value> {
    let config = resolve_config(
        cli.config.as_deref(),
        |key| std::env::var(key).ok(),
        |key| cli.flag(key),
    )?;
    init_tracing(&config.log_filter)?;
    tracing::debug!(?config, "Configuration resolved");

    execute_command(cli.command, &config).await
}

/// Initialize tracing subscriber. Logs go to stderr so stdout stays JSON.
fn init_tracing(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter)
        .with_context(|| format!("Invalid log filter '{filter}'"))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("Failed to install tracing subscriber")
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Failed to serialize output: {e}"),
    }
}
