//! Core types, errors, and configuration for mlens.
//!
//! - **Config**: layered configuration (file < environment < CLI flags)
//! - **Error**: typed, recoverable errors for configuration and file handling

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod config;
pub mod error;

pub use config::{Config, PipelineConfig};
pub use error::{Error, Result};
