//! Error types for graph construction and execution
//!
//! ```text
//! GraphError
//! ├── Validation       - graph structure errors found by compile()
//! ├── UnknownNode      - an entry point that is not part of the graph
//! ├── State            - reducer failures while merging a patch
//! ├── Checkpoint       - persistence errors
//! ├── Serialization    - JSON errors
//! ├── NoCheckpointer   - resume/inspection without a saver
//! ├── ThreadNotFound   - resume of a thread with no snapshot
//! └── NotInterrupted   - resume of a thread that is not paused
//! ```
//!
//! Failures *inside* a node never surface as [`GraphError`]. A handler returns a
//! [`NodeError`], the engine records it on the state record and hands control to the
//! error handler, and the caller gets back a state whose status says what happened.

use crate::state::WorkflowStatus;
use compliance_checkpoint::CheckpointError;
use thiserror::Error;

/// Errors raised by the graph API itself
#[derive(Debug, Error)]
pub enum GraphError {
    /// Graph structure is invalid
    #[error("Graph validation failed: {0}")]
    Validation(String),

    /// Execution was asked to start at a node the graph does not contain
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// State merge error
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation needs a checkpoint saver but none is attached
    #[error("{0} requires a checkpointer")]
    NoCheckpointer(&'static str),

    /// No snapshot exists for the thread
    #[error("No checkpoint found for thread '{0}'")]
    ThreadNotFound(String),

    /// Resume was requested for a thread that is not paused
    #[error("Thread '{thread_id}' is {status}, only interrupted threads can be resumed")]
    NotInterrupted {
        thread_id: String,
        status: WorkflowStatus,
    },
}

/// Errors raised while merging a patch into the state record
#[derive(Debug, Error)]
pub enum StateError {
    /// Reducer encountered incompatible types
    #[error("Reducer '{reducer}' cannot merge: {message}")]
    Incompatible { reducer: String, message: String },

    /// A reducer failed on a named field
    #[error("Field '{field}': {source}")]
    Field {
        field: String,
        #[source]
        source: Box<StateError>,
    },
}

/// Failure reported by a node handler
///
/// `error_type` is an explicit classification hint (`"rate_limit"`, `"validation"`,
/// ...). When present it takes priority over keyword matching on the message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct NodeError {
    pub message: String,
    pub error_type: Option<String>,
}

impl NodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
        }
    }

    /// Error carrying an explicit classification
    pub fn typed(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: Some(error_type.into()),
        }
    }
}

impl From<String> for NodeError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for NodeError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<StateError> for NodeError {
    fn from(err: StateError) -> Self {
        Self::typed("validation", err.to_string())
    }
}

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;
