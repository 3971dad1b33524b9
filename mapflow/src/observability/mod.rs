//! Logging setup and job summaries.
//!
//! This module provides:
//! - [`init_tracing`], which installs a `tracing-subscriber` formatter
//! - [`job_summary`] and [`log_job_summary`], one wide record per finished job

mod summary;

pub use summary::{job_summary, log_job_summary};

use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over `level`. With `json` set, every line
/// is a JSON object. Fails if a global subscriber is already installed.
pub fn init_tracing(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))
}

/// Installs the global subscriber from an engine configuration.
pub fn init_from_config(config: &EngineConfig) -> anyhow::Result<()> {
    init_tracing(&config.log_level, config.log_json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // Whichever call installs first, the next one must be refused.
        let _ = init_tracing("debug", false);
        assert!(init_tracing("info", true).is_err());
    }
}
