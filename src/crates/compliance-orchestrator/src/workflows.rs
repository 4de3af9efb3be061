//! The compliance workflow graph
//!
//! ```text
//! compliance_analysis ──> human_review ──┐
//! evidence_processing ───────────────────┤
//! notification_dispatch ─────────────────┼──> finalize ──> END
//! report_generation ─────────────────────┤
//! monitoring_collection ─────────────────┘
//! ```
//!
//! Each category has its own entry node; the router starts a run there. Domain logic
//! lives in [`CategoryHandler`]s injected through [`WorkflowHandlers`]. `human_review`
//! is an interrupt point, so supervised and manual runs pause for confirmation after
//! compliance analysis.

use crate::router::TaskCategory;
use async_trait::async_trait;
use chrono::Utc;
use compliance_graph::{
    BackoffConfig, CompiledGraph, ComplianceState, GraphError, Message, NodeError,
    RetryPolicyEngine, StateGraph, StateUpdate, END,
};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub const COMPLIANCE_ANALYSIS: &str = "compliance_analysis";
pub const EVIDENCE_PROCESSING: &str = "evidence_processing";
pub const NOTIFICATION_DISPATCH: &str = "notification_dispatch";
pub const REPORT_GENERATION: &str = "report_generation";
pub const MONITORING_COLLECTION: &str = "monitoring_collection";
pub const HUMAN_REVIEW: &str = "human_review";
pub const FINALIZE: &str = "finalize";

/// Domain logic behind one category's entry node
#[async_trait]
pub trait CategoryHandler: Send + Sync {
    async fn handle(&self, state: ComplianceState) -> Result<StateUpdate, NodeError>;
}

/// Adapter turning an async closure into a [`CategoryHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CategoryHandler for FnHandler<F>
where
    F: Fn(ComplianceState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StateUpdate, NodeError>> + Send,
{
    async fn handle(&self, state: ComplianceState) -> Result<StateUpdate, NodeError> {
        (self.0)(state).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CategoryHandler>
where
    F: Fn(ComplianceState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StateUpdate, NodeError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Records that the category ran and leaves the result to `finalize`
struct AcknowledgeHandler(TaskCategory);

#[async_trait]
impl CategoryHandler for AcknowledgeHandler {
    async fn handle(&self, state: ComplianceState) -> Result<StateUpdate, NodeError> {
        let task_type = state.metadata().get_str("task_type").unwrap_or("unspecified");
        tracing::debug!(category = %self.0, task_type, "No handler registered, acknowledging");
        Ok(StateUpdate::new().message(Message::system(format!(
            "{} task '{}' acknowledged",
            self.0, task_type
        ))))
    }
}

/// Handlers per category; categories without one are acknowledged and finalized
#[derive(Clone, Default)]
pub struct WorkflowHandlers {
    handlers: HashMap<TaskCategory, Arc<dyn CategoryHandler>>,
}

impl WorkflowHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, category: TaskCategory, handler: Arc<dyn CategoryHandler>) -> Self {
        self.handlers.insert(category, handler);
        self
    }

    pub fn get(&self, category: TaskCategory) -> Arc<dyn CategoryHandler> {
        self.handlers
            .get(&category)
            .cloned()
            .unwrap_or_else(|| Arc::new(AcknowledgeHandler(category)))
    }
}

impl fmt::Debug for WorkflowHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut categories: Vec<_> = self.handlers.keys().map(TaskCategory::as_str).collect();
        categories.sort_unstable();
        f.debug_struct("WorkflowHandlers")
            .field("categories", &categories)
            .finish()
    }
}

async fn review(state: ComplianceState) -> Result<StateUpdate, NodeError> {
    let decision = match state.metadata().get("human_input") {
        Some(input) => json!({"decision": "reviewed", "input": input}),
        None => json!({"decision": "auto_approved"}),
    };
    Ok(StateUpdate::new()
        .compliance("review", json!({"reviewed_at": Utc::now().to_rfc3339(), "outcome": decision}))
        .message(Message::system("Compliance analysis reviewed")))
}

async fn finalize(state: ComplianceState) -> Result<StateUpdate, NodeError> {
    Ok(StateUpdate::new()
        .metadata_entry("finalized_at", json!(Utc::now().to_rfc3339()))
        .metadata_entry("steps", json!(state.visited_nodes().len()))
        .message(Message::system("Workflow finalized")))
}

/// Assemble and compile the compliance graph
pub fn build_compliance_graph(
    handlers: &WorkflowHandlers,
    backoff: BackoffConfig,
) -> Result<CompiledGraph, GraphError> {
    let mut graph = StateGraph::new();

    for category in TaskCategory::ROUTABLE {
        let Some(entry) = category.entry_node() else {
            continue;
        };
        let handler = handlers.get(category);
        graph.add_node(entry, move |state| {
            let handler = handler.clone();
            async move { handler.handle(state).await }
        });
        let next = if category == TaskCategory::Compliance {
            HUMAN_REVIEW
        } else {
            FINALIZE
        };
        graph.add_edge(entry, next);
    }

    graph
        .add_node(HUMAN_REVIEW, review)
        .add_node(FINALIZE, finalize)
        .add_edge(HUMAN_REVIEW, FINALIZE)
        .add_edge(FINALIZE, END)
        .set_entry_point(COMPLIANCE_ANALYSIS)
        .interrupt_before([HUMAN_REVIEW])
        .with_recovery_policy(Arc::new(RetryPolicyEngine::new(backoff)));

    graph.compile()
}
