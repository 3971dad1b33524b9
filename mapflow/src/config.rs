//! Engine configuration.
//!
//! An [`EngineConfig`] is read from a YAML or JSON document. Every field
//! has a default, so an empty document is valid. `MAPFLOW_*` environment
//! variables override the document after it is parsed.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::checkpoint::CheckpointPolicy;
use crate::errors::{MapflowError, ValidationError};
use crate::interpreter::RetryConfig;

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Settings of a [`JobService`](crate::jobs::JobService) and its logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Jobs allowed to run at once.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Job-level retry budget given to submitted jobs.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Delay between step attempts.
    #[serde(default)]
    pub retry: RetryConfig,
    /// When checkpoints are taken and where large ones go.
    #[serde(default)]
    pub checkpoint: CheckpointPolicy,
    /// Directory of external checkpoint payloads. In memory when unset.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    /// SQLite database file. In memory when unset.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Default tracing filter directive.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines.
    #[serde(default)]
    pub log_json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            default_max_retries: default_max_retries(),
            retry: RetryConfig::default(),
            checkpoint: CheckpointPolicy::default(),
            checkpoint_dir: None,
            database_path: None,
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl EngineConfig {
    /// Parses a YAML document.
    pub fn from_yaml_str(source: &str) -> Result<Self, MapflowError> {
        serde_yaml::from_str(source).map_err(|e| MapflowError::Serialization(e.to_string()))
    }

    /// Parses a JSON document.
    pub fn from_json_str(source: &str) -> Result<Self, MapflowError> {
        Ok(serde_json::from_str(source)?)
    }

    /// Loads a config file by extension and applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let parsed = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&source),
            _ => Self::from_yaml_str(&source),
        };
        parsed
            .with_context(|| format!("parsing config file {}", path.display()))?
            .with_env_overrides()
    }

    /// Applies `MAPFLOW_*` variables from the process environment.
    pub fn with_env_overrides(self) -> anyhow::Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `MAPFLOW_*` overrides from `lookup`.
    ///
    /// Recognized keys: `MAPFLOW_MAX_CONCURRENT_JOBS`,
    /// `MAPFLOW_DEFAULT_MAX_RETRIES`, `MAPFLOW_CHECKPOINT_DIR`,
    /// `MAPFLOW_DATABASE_PATH`, `MAPFLOW_LOG_LEVEL` and `MAPFLOW_LOG_JSON`.
    pub fn with_overrides<F>(mut self, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("MAPFLOW_MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = value
                .trim()
                .parse()
                .with_context(|| format!("MAPFLOW_MAX_CONCURRENT_JOBS={value}"))?;
        }
        if let Some(value) = lookup("MAPFLOW_DEFAULT_MAX_RETRIES") {
            self.default_max_retries = value
                .trim()
                .parse()
                .with_context(|| format!("MAPFLOW_DEFAULT_MAX_RETRIES={value}"))?;
        }
        if let Some(value) = lookup("MAPFLOW_CHECKPOINT_DIR") {
            self.checkpoint_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("MAPFLOW_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("MAPFLOW_LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some(value) = lookup("MAPFLOW_LOG_JSON") {
            self.log_json = parse_flag(&value)
                .with_context(|| format!("MAPFLOW_LOG_JSON={value}"))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Rejects settings the service cannot run with.
    pub fn validate(&self) -> Result<(), MapflowError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ValidationError::new("max_concurrent_jobs must be at least 1").into());
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got '{other}'"),
    }
}
