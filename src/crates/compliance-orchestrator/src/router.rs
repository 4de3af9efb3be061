//! Unified task router
//!
//! One flat table maps every external task identifier to a [`TaskCategory`]. The
//! on-demand API and the scheduler both go through [`UnifiedTaskRouter::execute`],
//! which starts a fresh workflow at the category's entry node and turns the terminal
//! state into a JSON result.

use crate::workflows::{
    COMPLIANCE_ANALYSIS, EVIDENCE_PROCESSING, MONITORING_COLLECTION, NOTIFICATION_DISPATCH,
    REPORT_GENERATION,
};
use crate::{OrchestratorError, Result};
use async_trait::async_trait;
use compliance_graph::{
    AutonomyLevel, CancellationToken, CompiledGraph, ComplianceState, StateUpdate, WorkflowStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Handler family a task type belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Compliance,
    Evidence,
    Notification,
    Reporting,
    Monitoring,
    /// Task type not present in the routing table
    Error,
}

impl TaskCategory {
    /// Categories that own a workflow entry node
    pub const ROUTABLE: [TaskCategory; 5] = [
        TaskCategory::Compliance,
        TaskCategory::Evidence,
        TaskCategory::Notification,
        TaskCategory::Reporting,
        TaskCategory::Monitoring,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Compliance => "compliance",
            TaskCategory::Evidence => "evidence",
            TaskCategory::Notification => "notification",
            TaskCategory::Reporting => "reporting",
            TaskCategory::Monitoring => "monitoring",
            TaskCategory::Error => "error",
        }
    }

    pub fn entry_node(&self) -> Option<&'static str> {
        match self {
            TaskCategory::Compliance => Some(COMPLIANCE_ANALYSIS),
            TaskCategory::Evidence => Some(EVIDENCE_PROCESSING),
            TaskCategory::Notification => Some(NOTIFICATION_DISPATCH),
            TaskCategory::Reporting => Some(REPORT_GENERATION),
            TaskCategory::Monitoring => Some(MONITORING_COLLECTION),
            TaskCategory::Error => None,
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task type to category
pub const ROUTES: &[(&str, TaskCategory)] = &[
    ("update_compliance_scores", TaskCategory::Compliance),
    ("compliance_check", TaskCategory::Compliance),
    ("gap_analysis", TaskCategory::Compliance),
    ("risk_assessment", TaskCategory::Compliance),
    ("process_evidence", TaskCategory::Evidence),
    ("collect_evidence", TaskCategory::Evidence),
    ("evidence_expiry_check", TaskCategory::Evidence),
    ("compliance_alert", TaskCategory::Notification),
    ("send_digest", TaskCategory::Notification),
    ("generate_report", TaskCategory::Reporting),
    ("audit_export", TaskCategory::Reporting),
    ("database_metrics", TaskCategory::Monitoring),
    ("health_check", TaskCategory::Monitoring),
];

/// Category for a task type, [`TaskCategory::Error`] when unknown
pub fn route(task_type: &str) -> TaskCategory {
    ROUTES
        .iter()
        .find(|(name, _)| *name == task_type)
        .map(|(_, category)| *category)
        .unwrap_or(TaskCategory::Error)
}

/// Seam between the scheduler and whatever runs a task
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, task_type: &str, params: Value, cancel: CancellationToken) -> Result<Value>;
}

/// Routes task types onto the compiled compliance graph
#[derive(Debug, Clone)]
pub struct UnifiedTaskRouter {
    graph: Arc<CompiledGraph>,
}

impl UnifiedTaskRouter {
    pub fn new(graph: Arc<CompiledGraph>) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    pub fn route(&self, task_type: &str) -> TaskCategory {
        route(task_type)
    }

    pub async fn execute(&self, task_type: &str, params: Value) -> Result<Value> {
        self.execute_with_cancel(task_type, params, CancellationToken::new())
            .await
    }

    #[tracing::instrument(skip(self, params, cancel))]
    pub async fn execute_with_cancel(
        &self,
        task_type: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value> {
        let category = route(task_type);
        let entry = category
            .entry_node()
            .ok_or_else(|| OrchestratorError::UnknownTaskType(task_type.to_string()))?;

        let state = initial_state(task_type, category, params)?;
        tracing::info!(%category, entry, thread_id = %state.thread_id(), "Dispatching task");

        let finished = self.graph.invoke_from(entry, state, cancel).await?;
        outcome(finished)
    }

    /// Continue an interrupted run with optional reviewer input
    #[tracing::instrument(skip(self, human_input))]
    pub async fn resume(&self, thread_id: &str, human_input: Option<Value>) -> Result<Value> {
        let finished = self
            .graph
            .resume(thread_id, human_input, CancellationToken::new())
            .await?;
        outcome(finished)
    }
}

#[async_trait]
impl TaskDispatcher for UnifiedTaskRouter {
    async fn dispatch(&self, task_type: &str, params: Value, cancel: CancellationToken) -> Result<Value> {
        self.execute_with_cancel(task_type, params, cancel).await
    }
}

fn param_str<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn param_u32(params: &Map<String, Value>, key: &str) -> Result<Option<u32>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| OrchestratorError::InvalidParams(format!("{key} must be a non-negative integer"))),
    }
}

/// Minimal state for a routed task
///
/// Recognised parameters: `thread_id`, `session_id`, `company_id`,
/// `autonomy_level` (defaults to `autonomous`), `max_retries` and `max_turns`. The
/// full parameter object is stored as `metadata.task_params`.
fn initial_state(task_type: &str, category: TaskCategory, params: Value) -> Result<ComplianceState> {
    let params = match params {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => {
            return Err(OrchestratorError::InvalidParams(format!(
                "expected an object, got {other}"
            )))
        }
    };

    let thread_id = param_str(&params, "thread_id")
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-{}", category, Uuid::new_v4()));
    let session_id = param_str(&params, "session_id")
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let company_id = param_str(&params, "company_id").unwrap_or("default").to_string();

    let autonomy = match params.get("autonomy_level") {
        None | Some(Value::Null) => AutonomyLevel::Autonomous,
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| OrchestratorError::InvalidParams(format!("autonomy_level: {e}")))?,
    };

    let mut state = ComplianceState::new(session_id, company_id, thread_id).with_autonomy(autonomy);
    if let Some(max_retries) = param_u32(&params, "max_retries")? {
        state = state.with_max_retries(max_retries);
    }
    if let Some(max_turns) = param_u32(&params, "max_turns")? {
        state = state.with_max_turns(max_turns);
    }

    state
        .apply(
            StateUpdate::new()
                .metadata_entry("task_type", json!(task_type))
                .metadata_entry("task_category", json!(category.as_str()))
                .metadata_entry("task_params", Value::Object(params)),
        )
        .map_err(|e| OrchestratorError::InvalidParams(e.to_string()))?;
    Ok(state)
}

fn outcome(state: ComplianceState) -> Result<Value> {
    match state.workflow_status {
        WorkflowStatus::Completed => Ok(state
            .task_result
            .unwrap_or_else(|| json!({"status": "completed"}))),
        WorkflowStatus::Interrupted => Ok(json!({
            "status": "interrupted",
            "thread_id": state.thread_id(),
            "node": state.interrupted_node,
        })),
        WorkflowStatus::Failed => {
            let last = state.last_error();
            Err(OrchestratorError::WorkflowFailed {
                thread_id: state.thread_id().to_string(),
                reason: state.failure_reason().map(str::to_string),
                message: state
                    .termination_reason
                    .clone()
                    .unwrap_or_else(|| "workflow failed".to_string()),
                error_type: last.and_then(|e| e.error_type.clone()),
                last_error: last.map(|e| e.message.clone()),
            })
        }
        other => Err(OrchestratorError::ExecutionFailed(format!(
            "workflow {} stopped in non-terminal status {other}",
            state.thread_id()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_table() {
        assert_eq!(route("update_compliance_scores"), TaskCategory::Compliance);
        assert_eq!(route("process_evidence"), TaskCategory::Evidence);
        assert_eq!(route("compliance_alert"), TaskCategory::Notification);
        assert_eq!(route("generate_report"), TaskCategory::Reporting);
        assert_eq!(route("database_metrics"), TaskCategory::Monitoring);
        assert_eq!(route("make_coffee"), TaskCategory::Error);
        assert_eq!(TaskCategory::Error.entry_node(), None);
    }

    #[test]
    fn test_initial_state_defaults() {
        let state = initial_state("generate_report", TaskCategory::Reporting, Value::Null).unwrap();
        assert_eq!(state.autonomy_level, AutonomyLevel::Autonomous);
        assert_eq!(state.company_id(), "default");
        assert!(state.thread_id().starts_with("reporting-"));
        assert_eq!(state.metadata().get_str("task_type"), Some("generate_report"));
        assert_eq!(state.workflow_status, WorkflowStatus::Pending);
    }

    #[test]
    fn test_initial_state_reads_params() {
        let params = json!({
            "thread_id": "t-42",
            "company_id": "acme",
            "autonomy_level": "supervised",
            "max_retries": 1,
            "framework": "SOC2",
        });
        let state = initial_state("gap_analysis", TaskCategory::Compliance, params).unwrap();
        assert_eq!(state.thread_id(), "t-42");
        assert_eq!(state.company_id(), "acme");
        assert_eq!(state.autonomy_level, AutonomyLevel::Supervised);
        assert_eq!(state.max_retries, 1);
        assert_eq!(
            state.metadata().get("task_params").and_then(|p| p.get("framework")),
            Some(&json!("SOC2"))
        );
    }

    #[test]
    fn test_initial_state_rejects_bad_params() {
        for params in [json!([1, 2]), json!({"max_retries": -1}), json!({"autonomy_level": "yolo"})] {
            let err = initial_state("gap_analysis", TaskCategory::Compliance, params).unwrap_err();
            assert!(matches!(err, OrchestratorError::InvalidParams(_)));
        }
    }

    #[test]
    fn test_outcome_maps_terminal_states() {
        let mut state = ComplianceState::new("s", "c", "t");
        state.workflow_status = WorkflowStatus::Completed;
        assert_eq!(outcome(state.clone()).unwrap(), json!({"status": "completed"}));

        state.task_result = Some(json!({"score": 0.9}));
        assert_eq!(outcome(state.clone()).unwrap(), json!({"score": 0.9}));

        state.workflow_status = WorkflowStatus::Interrupted;
        state.interrupted_node = Some("human_review".to_string());
        let paused = outcome(state.clone()).unwrap();
        assert_eq!(paused["status"], json!("interrupted"));
        assert_eq!(paused["thread_id"], json!("t"));

        state.workflow_status = WorkflowStatus::InProgress;
        assert!(matches!(outcome(state), Err(OrchestratorError::ExecutionFailed(_))));
    }
}
