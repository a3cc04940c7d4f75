//! Configuration management for mlens.
//!
//! Configuration is layered: `mlens.toml` < environment variables < CLI flags.
//! Every layer produces a validated, immutable [`Config`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable overriding [`PipelineConfig::watermark_ms`].
pub const ENV_WATERMARK_MS: &str = "MLENS_WATERMARK_MS";
/// Environment variable overriding [`PipelineConfig::max_buffer_size`].
pub const ENV_MAX_BUFFER_SIZE: &str = "MLENS_MAX_BUFFER_SIZE";
/// Environment variable overriding [`PipelineConfig::grace_period_ms`].
pub const ENV_GRACE_PERIOD_MS: &str = "MLENS_GRACE_PERIOD_MS";
/// Environment variable overriding [`Config::schema_file`].
pub const ENV_SCHEMA_FILE: &str = "MLENS_SCHEMA_FILE";
/// Environment variable overriding [`Config::log_filter`].
pub const ENV_LOG: &str = "MLENS_LOG";

/// Tunables for the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Max hold (milliseconds) since the newest buffered event before a flush.
    #[serde(default = "default_watermark_ms")]
    pub watermark_ms: u64,

    /// Events held per experiment before the oldest is force-flushed.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// How long (milliseconds) events wait for their experiment's `create`.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Capacity of the flush outcome broadcast channel.
    #[serde(default = "default_outcome_capacity")]
    pub outcome_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            watermark_ms: default_watermark_ms(),
            max_buffer_size: default_max_buffer_size(),
            grace_period_ms: default_grace_period_ms(),
            outcome_capacity: default_outcome_capacity(),
        }
    }
}

impl PipelineConfig {
    /// Create a pipeline config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the watermark duration.
    #[must_use]
    pub fn with_watermark(mut self, watermark: Duration) -> Self {
        self.watermark_ms = duration_to_ms(watermark);
        self
    }

    /// Set the forced-flush threshold.
    #[must_use]
    pub const fn with_max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    /// Set the grace period for events of not-yet-created experiments.
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = duration_to_ms(grace);
        self
    }

    /// Watermark as a [`Duration`].
    #[must_use]
    pub const fn watermark(&self) -> Duration {
        Duration::from_millis(self.watermark_ms)
    }

    /// Grace period as a [`Duration`].
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a size is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_size == 0 {
            return Err(Error::invalid_config(
                "pipeline.max_buffer_size",
                "must be greater than 0",
            ));
        }
        if self.outcome_capacity == 0 {
            return Err(Error::invalid_config(
                "pipeline.outcome_capacity",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Pipeline tunables.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Optional TOML file with additional schema versions.
    #[serde(default)]
    pub schema_file: Option<PathBuf>,

    /// `tracing` filter directive.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            schema_file: None,
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML, has unknown keys,
    /// or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::toml_parse_failed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Apply overrides from an arbitrary key lookup (environment-shaped).
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be parsed or the result is invalid.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(ENV_WATERMARK_MS) {
            self.pipeline.watermark_ms = parse_number(ENV_WATERMARK_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_BUFFER_SIZE) {
            self.pipeline.max_buffer_size = parse_number(ENV_MAX_BUFFER_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_GRACE_PERIOD_MS) {
            self.pipeline.grace_period_ms = parse_number(ENV_GRACE_PERIOD_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_SCHEMA_FILE) {
            self.schema_file = Some(PathBuf::from(raw));
        }
        if let Some(raw) = lookup(ENV_LOG) {
            self.log_filter = raw;
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any section is invalid.
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        if self.log_filter.trim().is_empty() {
            return Err(Error::invalid_config("log_filter", "must not be empty"));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| Error::invalid_config(field, format!("'{raw}': {e}")))
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

const fn default_watermark_ms() -> u64 {
    2_000
}

const fn default_max_buffer_size() -> usize {
    1_024
}

const fn default_grace_period_ms() -> u64 {
    500
}

const fn default_outcome_capacity() -> usize {
    1_024
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.watermark(), Duration::from_secs(2));
        assert_eq!(config.max_buffer_size, 1024);
        assert_eq!(config.grace_period(), Duration::from_millis(500));
    }

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = Config::from_toml_str("").expect("empty config is valid");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_pipeline_section() {
        let config = Config::from_toml_str("[pipeline]\nwatermark_ms = 250\n").unwrap();
        assert_eq!(config.pipeline.watermark_ms, 250);
        assert_eq!(config.pipeline.max_buffer_size, 1024);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = Config::from_toml_str("[pipeline]\nwatermark = 250\n");
        assert!(matches!(result, Err(Error::TomlParseFailed { .. })));
    }

    #[test]
    fn test_zero_buffer_size_rejected() {
        let result = Config::from_toml_str("[pipeline]\nmax_buffer_size = 0\n");
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_WATERMARK_MS, "10"),
            (ENV_GRACE_PERIOD_MS, " 20 "),
            (ENV_LOG, "debug"),
        ]);
        let config = Config::default()
            .with_overrides(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.pipeline.watermark_ms, 10);
        assert_eq!(config.pipeline.grace_period_ms, 20);
        assert_eq!(config.log_filter, "debug");
    }

    #[test]
    fn test_unparsable_override_names_variable() {
        let err = Config::default()
            .with_overrides(|key| (key == ENV_MAX_BUFFER_SIZE).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_BUFFER_SIZE));
    }

    #[test]
    fn test_builder_durations() {
        let config = PipelineConfig::new()
            .with_watermark(Duration::from_millis(75))
            .with_grace_period(Duration::from_millis(5))
            .with_max_buffer_size(3);
        assert_eq!(config.watermark_ms, 75);
        assert_eq!(config.grace_period_ms, 5);
        assert_eq!(config.max_buffer_size, 3);
    }
}
