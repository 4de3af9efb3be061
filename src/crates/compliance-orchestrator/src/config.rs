//! Orchestrator configuration
//!
//! Values are layered in this order, later layers winning:
//!
//! 1. built-in defaults
//! 2. a TOML file: the path given to [`ConfigLoader::with_path`], else `$COMPLIANCE_CONFIG`,
//!    else `./config/compliance.toml` when it exists
//! 3. environment overrides: `COMPLIANCE_POLL_INTERVAL_SECS`, `COMPLIANCE_MAX_RETRIES`
//!    and `COMPLIANCE_LOG_LEVEL`
//!
//! ```toml
//! [engine]
//! checkpoint_ns = "compliance"
//! node_timeout_ms = 60000
//!
//! [backoff]
//! rate_limit_base_ms = 1000
//!
//! [scheduler]
//! poll_interval_secs = 60
//!
//! [logging]
//! level = "info"
//!
//! [checkpoint]
//! directory = "/var/lib/compliance/checkpoints"
//!
//! [[tasks]]
//! task_type = "update_compliance_scores"
//! schedule = "daily@02:00"
//! priority = 2
//! ```

use crate::router::{route, TaskCategory};
use crate::scheduler::SchedulerConfig;
use crate::task::{Schedule, ScheduledTask, TaskDescriptor};
use crate::{OrchestratorError, Result};
use compliance_graph::{BackoffConfig, EngineConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "COMPLIANCE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/compliance.toml";
pub const POLL_INTERVAL_ENV: &str = "COMPLIANCE_POLL_INTERVAL_SECS";
pub const MAX_RETRIES_ENV: &str = "COMPLIANCE_MAX_RETRIES";
pub const LOG_LEVEL_ENV: &str = "COMPLIANCE_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or `compliance_graph=debug`
    pub level: String,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
        }
    }
}

/// Where checkpoints are kept
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// Directory for the file store; in-memory when unset
    pub directory: Option<PathBuf>,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub engine: EngineConfig,
    pub backoff: BackoffConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
    pub checkpoint: CheckpointSettings,
    /// Tasks registered at startup
    pub tasks: Vec<TaskDescriptor>,
}

impl OrchestratorConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.poll_interval_secs == 0 {
            return Err(OrchestratorError::Config(
                "scheduler.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.engine.node_timeout_ms == 0 {
            return Err(OrchestratorError::Config(
                "engine.node_timeout_ms must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for descriptor in &self.tasks {
            if route(&descriptor.task_type) == TaskCategory::Error {
                return Err(OrchestratorError::Config(format!(
                    "task type '{}' has no route",
                    descriptor.task_type
                )));
            }
            descriptor.schedule.parse::<Schedule>()?;
            if let Some(id) = &descriptor.task_id {
                if !seen.insert(id.as_str()) {
                    return Err(OrchestratorError::Config(format!("duplicate task id '{id}'")));
                }
            }
        }
        Ok(())
    }

    /// Build the configured startup tasks
    pub fn scheduled_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.tasks
            .iter()
            .cloned()
            .map(|descriptor| descriptor.into_task(&self.scheduler))
            .collect()
    }
}

/// Loads [`OrchestratorConfig`] from defaults, file and environment
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit file; it must exist
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<OrchestratorConfig> {
        self.load_with(|key| std::env::var(key).ok())
    }

    /// Load with a custom environment lookup
    pub fn load_with<F>(&self, env: F) -> Result<OrchestratorConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let explicit = self
            .path
            .clone()
            .or_else(|| env(CONFIG_ENV).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => load_file(&path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    load_file(default)?
                } else {
                    tracing::debug!("No configuration file found, using defaults");
                    OrchestratorConfig::default()
                }
            }
        };

        apply_env_overrides(&mut config, &env)?;
        config.validate()?;
        Ok(config)
    }
}

fn load_file(path: &Path) -> Result<OrchestratorConfig> {
    let content = fs::read_to_string(path).map_err(|e| {
        OrchestratorError::Config(format!("Failed to read configuration file {:?}: {}", path, e))
    })?;
    let config = OrchestratorConfig::from_toml_str(&content)?;
    tracing::info!(path = %path.display(), tasks = config.tasks.len(), "Loaded configuration");
    Ok(config)
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| OrchestratorError::Config(format!("{key} has an invalid value '{value}'")))
}

fn apply_env_overrides<F>(config: &mut OrchestratorConfig, env: &F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = env(POLL_INTERVAL_ENV) {
        config.scheduler.poll_interval_secs = parse_env(POLL_INTERVAL_ENV, &value)?;
    }
    if let Some(value) = env(MAX_RETRIES_ENV) {
        config.scheduler.default_max_retries = parse_env(MAX_RETRIES_ENV, &value)?;
    }
    if let Some(value) = env(LOG_LEVEL_ENV) {
        config.logging.level = value;
    }
    Ok(())
}
