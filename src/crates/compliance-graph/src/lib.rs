//! # compliance-graph - Stateful compliance workflows
//!
//! The execution core of the compliance orchestrator:
//!
//! - [`state`] - the [`ComplianceState`] record and its [`StateUpdate`] patches
//! - [`reducers`] - per-field merge rules applied to every patch
//! - [`policy`] - error classification and retry/backoff/fallback decisions
//! - [`graph`] - the [`StateGraph`] builder and immutable [`CompiledGraph`]
//! - [`engine`] - the execution loop, checkpointing, interrupts and resume
//! - [`interrupt`] - human-confirmation breakpoints
//!
//! ## Quick Start
//!
//! ```rust
//! use compliance_graph::{ComplianceState, StateGraph, StateUpdate, WorkflowStatus, END};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), compliance_graph::GraphError> {
//! let mut graph = StateGraph::new();
//! graph.add_node("collect_evidence", |_state| async move {
//!     Ok(StateUpdate::new().compliance("evidence", json!([{"hash": "a1", "name": "policy.pdf"}])))
//! });
//! graph.add_node("score", |state: ComplianceState| async move {
//!     let evidence = state.compliance_data()["evidence"].as_array().map_or(0, Vec::len);
//!     Ok(StateUpdate::new().result(json!({"evidence_count": evidence})))
//! });
//! graph.add_edge("collect_evidence", "score");
//! graph.add_edge("score", END);
//! graph.set_entry_point("collect_evidence");
//!
//! let compiled = graph.compile()?;
//! let state = compiled.invoke(ComplianceState::new("session-1", "acme", "thread-1")).await?;
//!
//! assert_eq!(state.workflow_status, WorkflowStatus::Completed);
//! assert_eq!(state.task_result, Some(json!({"evidence_count": 1})));
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure handling
//!
//! A handler that returns `Err`, panics or exceeds its timeout is recorded on the
//! state and routed to the built-in [`ERROR_HANDLER`] node, where a
//! [`RecoveryPolicy`] (by default [`RetryPolicyEngine`]) decides whether to wait and
//! re-enter, switch to a fallback endpoint, or fail the run.

pub mod engine;
pub mod error;
pub mod graph;
pub mod interrupt;
pub mod policy;
pub mod reducers;
pub mod state;

pub use engine::EngineConfig;
pub use error::{GraphError, NodeError, Result, StateError};
pub use graph::{
    CompiledGraph, Edge, NodeExecutor, NodeFuture, NodeSpec, RecoveryRouting, RouterFn,
    StateGraph, END, ERROR_HANDLER,
};
pub use interrupt::InterruptConfig;
pub use policy::{
    BackoffConfig, ErrorClass, PolicyError, RecoveryAction, RecoveryPolicy, RetryDecision,
    RetryPolicyEngine,
};
pub use reducers::{ComplianceDataSchema, Reducer};
pub use state::{
    AutonomyLevel, ComplianceState, ErrorEntry, FailureReason, Message, MetadataMap, NodeId,
    StateUpdate, WorkflowStatus,
};

// Re-exported so callers can cancel executions without a direct tokio-util dependency
pub use tokio_util::sync::CancellationToken;
