//! Tracing subscriber setup

use crate::config::LoggingConfig;
use crate::{OrchestratorError, Result};
use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG`, falling back to the configured level
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            OrchestratorError::Config(format!("invalid log level '{}': {}", config.level, e))
        }),
    }
}

/// Install the global fmt subscriber
///
/// Fails if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config)?)
        .with_target(config.with_target)
        .try_init()
        .map_err(|e| OrchestratorError::Config(format!("failed to install tracing subscriber: {e}")))
}
