//! Scheduling and dispatch for compliance workflows
//!
//! This crate sits on top of [`compliance_graph`] and turns external task identifiers
//! into workflow runs:
//!
//! - [`router`] maps task types such as `update_compliance_scores` to a category and
//!   runs the category's workflow
//! - [`workflows`] assembles the compliance graph from injected [`CategoryHandler`]s
//! - [`scheduler`] keeps periodic and one-shot tasks and dispatches the most urgent
//!   due task on every tick
//! - [`service`] bundles all of the above behind [`ComplianceOrchestrator`]
//! - [`config`] and [`logging`] provide the TOML configuration and tracing setup used
//!   by the `compliance-orchestrator` binary

pub mod config;
pub mod logging;
pub mod router;
pub mod scheduler;
pub mod service;
pub mod task;
pub mod workflows;

pub use config::{CheckpointSettings, ConfigLoader, LoggingConfig, OrchestratorConfig};
pub use router::{TaskCategory, TaskDispatcher, UnifiedTaskRouter};
pub use scheduler::{SchedulerConfig, SchedulerHealth, TaskScheduler};
pub use service::ComplianceOrchestrator;
pub use task::{Schedule, ScheduledTask, TaskDescriptor, TaskPriority, TaskStatus};
pub use workflows::{build_compliance_graph, handler_fn, CategoryHandler, WorkflowHandlers};

use compliance_graph::{ErrorClass, GraphError};
use thiserror::Error;

/// Errors that can occur during orchestration
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already registered: {0}")]
    DuplicateTask(String),

    /// The router has no category for this task type
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Invalid task parameters: {0}")]
    InvalidParams(String),

    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// Invalid state transition
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// The workflow ended in `FAILED`
    #[error("Workflow {thread_id} failed ({}): {message}", .reason.as_deref().unwrap_or("unknown"))]
    WorkflowFailed {
        thread_id: String,
        reason: Option<String>,
        message: String,
        /// Type and message of the latest recorded error
        error_type: Option<String>,
        last_error: Option<String>,
    },

    /// Workflow execution error
    #[error("Workflow execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Task {task_id} timed out after {timeout_secs}s")]
    DispatchTimeout { task_id: String, timeout_secs: u64 },

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Failure class used by the scheduler to pick a retry strategy
    pub fn error_class(&self) -> ErrorClass {
        match self {
            OrchestratorError::UnknownTaskType(_)
            | OrchestratorError::InvalidParams(_)
            | OrchestratorError::InvalidSchedule { .. }
            | OrchestratorError::Config(_)
            | OrchestratorError::Toml(_)
            | OrchestratorError::Serialization(_) => ErrorClass::Validation,
            OrchestratorError::WorkflowFailed {
                message,
                error_type,
                last_error,
                ..
            } => ErrorClass::classify(error_type.as_deref(), last_error.as_deref().unwrap_or(message)),
            OrchestratorError::DispatchTimeout { .. } => ErrorClass::Timeout,
            OrchestratorError::Graph(GraphError::Validation(_) | GraphError::UnknownNode(_)) => {
                ErrorClass::Validation
            }
            _ => ErrorClass::Unknown,
        }
    }
}

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Get version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
