//! # mlens
//!
//! Command-line front end for the mlens telemetry protocol.
//!
//! This library re-exports the workspace crates and holds the command
//! implementations behind the `mlens` binary.

pub use mlens_core;
pub use mlens_events;
pub use mlens_proto;

pub mod cli;
pub mod commands;
pub mod input;
pub mod json;
