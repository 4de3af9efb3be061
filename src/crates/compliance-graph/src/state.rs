//! The compliance state record
//!
//! [`ComplianceState`] is the single record threaded through every node of a workflow.
//! Nodes never mutate it; they receive a copy and return a [`StateUpdate`] patch, which
//! the engine merges with [`ComplianceState::apply`] using the rules in
//! [`crate::reducers`].
//!
//! Identity (`session_id`, `company_id`, `thread_id`) is fixed at construction and has
//! no patch field. `visited_nodes` and the latency counters are only written by the
//! engine, so they are private with read accessors.
//!
//! ```rust
//! use compliance_graph::{ComplianceState, StateUpdate, Message};
//! use serde_json::json;
//!
//! let mut state = ComplianceState::new("session-1", "acme", "thread-1");
//! state
//!     .apply(
//!         StateUpdate::new()
//!             .message(Message::new("system", "assessment started"))
//!             .compliance("frameworks", json!(["SOC2"])),
//!     )
//!     .unwrap();
//!
//! assert_eq!(state.messages().len(), 1);
//! assert_eq!(state.compliance_data()["frameworks"], json!(["SOC2"]));
//! ```

use crate::error::StateError;
use crate::reducers::{self, standard_schema};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Node identifier
pub type NodeId = String;

/// Maximum number of error entries kept on a state record
pub const ERROR_CAPACITY: usize = 10;

/// Default bound on retries per failure episode
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default bound on node executions per run
pub const DEFAULT_MAX_TURNS: u32 = 50;

/// Lifecycle of a workflow run
///
/// ```text
/// PENDING ──► IN_PROGRESS ──► COMPLETED
///                │  ▲
///                ▼  │
///             RETRYING ──► FAILED
///                │
///           INTERRUPTED ──► (resume) IN_PROGRESS
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Interrupted,
    Retrying,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Interrupted => "interrupted",
            WorkflowStatus::Retrying => "retrying",
        }
    }

    /// Completed or failed; the run will not continue
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much a run may do without a human
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    /// Every node waits for confirmation
    Manual,
    /// Configured breakpoints pause the run
    #[default]
    Supervised,
    /// Breakpoints are skipped
    Autonomous,
}

impl AutonomyLevel {
    /// Whether configured interrupt points pause the run
    pub fn requires_confirmation(&self) -> bool {
        !matches!(self, AutonomyLevel::Autonomous)
    }
}

/// Why a run ended in `FAILED`, recorded as `metadata.failure_reason`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MaxRetriesExceeded,
    NonRetryableError,
    Cancelled,
    SessionTimeout,
    MaxTurnsExceeded,
    PolicyEngineFailure,
    UnresolvedErrors,
    InvalidRoute,
    UnroutableRecovery,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::MaxRetriesExceeded => "max_retries_exceeded",
            FailureReason::NonRetryableError => "non_retryable_error",
            FailureReason::Cancelled => "cancelled",
            FailureReason::SessionTimeout => "session_timeout",
            FailureReason::MaxTurnsExceeded => "max_turns_exceeded",
            FailureReason::PolicyEngineFailure => "policy_engine_failure",
            FailureReason::UnresolvedErrors => "unresolved_errors",
            FailureReason::InvalidRoute => "invalid_route",
            FailureReason::UnroutableRecovery => "unroutable_recovery",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversation-style log entry
///
/// Two messages are duplicates when role, content and timestamp all match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    /// Pin the timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A recorded failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Node that failed, when known
    pub node: Option<NodeId>,
    pub message: String,
    /// Explicit classification, e.g. `"rate_limit"`
    pub error_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Set once the failing node has run successfully again
    #[serde(default)]
    pub resolved: bool,
}

impl ErrorEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            node: None,
            message: message.into(),
            error_type: None,
            timestamp: Utc::now(),
            resolved: false,
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

/// Old and new value of one metadata key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

/// One metadata merge that changed at least one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataChange {
    pub timestamp: DateTime<Utc>,
    pub changes: BTreeMap<String, FieldChange>,
}

/// Metadata with change tracking
///
/// Every merge increments `update_count`. Merges that change a value also append a
/// [`MetadataChange`] listing old and new values per key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataMap {
    values: Map<String, Value>,
    history: Vec<MetadataChange>,
    update_count: u64,
}

impl MetadataMap {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn history(&self) -> &[MetadataChange] {
        &self.history
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    pub fn merge(&mut self, incoming: Map<String, Value>, now: DateTime<Utc>) {
        let mut changes = BTreeMap::new();
        for (key, new) in incoming {
            let old = self.values.get(&key).cloned().unwrap_or(Value::Null);
            if old != new {
                changes.insert(
                    key.clone(),
                    FieldChange {
                        old,
                        new: new.clone(),
                    },
                );
            }
            self.values.insert(key, new);
        }

        self.update_count += 1;
        if !changes.is_empty() {
            self.history.push(MetadataChange {
                timestamp: now,
                changes,
            });
        }
    }
}

/// The record carried through a workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceState {
    session_id: String,
    company_id: String,
    thread_id: String,

    pub workflow_status: WorkflowStatus,
    pub current_node: Option<NodeId>,
    pub next_node: Option<NodeId>,
    visited_nodes: Vec<NodeId>,

    messages: Vec<Message>,
    tool_outputs: Map<String, Value>,
    compliance_data: Map<String, Value>,
    metadata: MetadataMap,

    errors: Vec<ErrorEntry>,
    error_count: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub turn_count: u32,
    pub max_turns: u32,

    node_latencies: BTreeMap<NodeId, u64>,
    total_latency_ms: u64,

    pub should_continue: bool,
    pub requires_human_review: bool,
    pub termination_reason: Option<String>,
    pub task_result: Option<Value>,
    pub autonomy_level: AutonomyLevel,
    /// Per-node timeout; `None` uses the engine default
    pub operation_timeout_ms: Option<u64>,
    pub interrupted_node: Option<NodeId>,
    pub last_successful_node: Option<NodeId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ComplianceState {
    pub fn new(
        session_id: impl Into<String>,
        company_id: impl Into<String>,
        thread_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            company_id: company_id.into(),
            thread_id: thread_id.into(),
            workflow_status: WorkflowStatus::Pending,
            current_node: None,
            next_node: None,
            visited_nodes: Vec::new(),
            messages: Vec::new(),
            tool_outputs: Map::new(),
            compliance_data: Map::new(),
            metadata: MetadataMap::default(),
            errors: Vec::new(),
            error_count: 0,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            turn_count: 0,
            max_turns: DEFAULT_MAX_TURNS,
            node_latencies: BTreeMap::new(),
            total_latency_ms: 0,
            should_continue: true,
            requires_human_review: false,
            termination_reason: None,
            task_result: None,
            autonomy_level: AutonomyLevel::default(),
            operation_timeout_ms: None,
            interrupted_node: None,
            last_successful_node: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_autonomy(mut self, level: AutonomyLevel) -> Self {
        self.autonomy_level = level;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn company_id(&self) -> &str {
        &self.company_id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn visited_nodes(&self) -> &[NodeId] {
        &self.visited_nodes
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn tool_outputs(&self) -> &Map<String, Value> {
        &self.tool_outputs
    }

    pub fn compliance_data(&self) -> &Map<String, Value> {
        &self.compliance_data
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    /// Total errors ever recorded, including evicted ones
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn node_latencies(&self) -> &BTreeMap<NodeId, u64> {
        &self.node_latencies
    }

    pub fn total_latency_ms(&self) -> u64 {
        self.total_latency_ms
    }

    /// Most recent error entry
    pub fn last_error(&self) -> Option<&ErrorEntry> {
        self.errors.last()
    }

    /// Whether any recorded error is still unresolved
    pub fn has_pending_errors(&self) -> bool {
        self.errors.iter().any(|e| !e.resolved)
    }

    /// `metadata.failure_reason`, if the run failed
    pub fn failure_reason(&self) -> Option<&str> {
        self.metadata.get_str("failure_reason")
    }

    /// Merge a patch into the record
    ///
    /// The compliance data merge is the only fallible step and runs first, so a
    /// rejected patch leaves the record untouched.
    pub fn apply(&mut self, update: StateUpdate) -> Result<(), StateError> {
        let compliance_data = if update.compliance_data.is_empty() {
            None
        } else {
            Some(standard_schema().apply(&self.compliance_data, &update.compliance_data)?)
        };

        let now = Utc::now();
        if let Some(data) = compliance_data {
            self.compliance_data = data;
        }
        if let Some(next) = update.next_node {
            self.next_node = Some(next);
        }
        reducers::merge_messages(&mut self.messages, update.messages);
        reducers::merge_tool_outputs(&mut self.tool_outputs, update.tool_outputs, now);
        self.error_count += reducers::merge_errors(&mut self.errors, update.errors, ERROR_CAPACITY);
        if let Some(metadata) = update.metadata {
            self.metadata.merge(metadata, now);
        }

        if let Some(status) = update.workflow_status {
            self.workflow_status = status;
        }
        if let Some(flag) = update.should_continue {
            self.should_continue = flag;
        }
        if let Some(flag) = update.requires_human_review {
            self.requires_human_review = flag;
        }
        if let Some(reason) = update.termination_reason {
            self.termination_reason = Some(reason);
        }
        if let Some(result) = update.task_result {
            self.task_result = Some(result);
        }
        if let Some(timeout) = update.operation_timeout_ms {
            self.operation_timeout_ms = Some(timeout);
        }

        self.updated_at = now;
        Ok(())
    }

    /// Record an entry in `visited_nodes`
    pub(crate) fn visit(&mut self, node: &str) {
        self.visited_nodes.push(node.to_string());
    }

    pub(crate) fn record_latency(&mut self, node: &str, elapsed_ms: u64) {
        *self.node_latencies.entry(node.to_string()).or_insert(0) += elapsed_ms;
        self.total_latency_ms += elapsed_ms;
    }

    pub(crate) fn record_error(&mut self, entry: ErrorEntry) {
        self.error_count += reducers::merge_errors(&mut self.errors, vec![entry], ERROR_CAPACITY);
        self.updated_at = Utc::now();
    }

    /// Mark every unresolved error raised by `node` as resolved
    pub(crate) fn resolve_errors_for(&mut self, node: &str) -> usize {
        let mut resolved = 0;
        for entry in self
            .errors
            .iter_mut()
            .filter(|e| !e.resolved && e.node.as_deref() == Some(node))
        {
            entry.resolved = true;
            resolved += 1;
        }
        resolved
    }

    pub(crate) fn merge_metadata(&mut self, values: Map<String, Value>) {
        let now = Utc::now();
        self.metadata.merge(values, now);
        self.updated_at = now;
    }

    /// Move to `FAILED`, recording the reason in metadata
    pub fn fail(&mut self, reason: FailureReason, message: impl Into<String>) {
        let mut values = Map::new();
        values.insert("failure_reason".to_string(), Value::from(reason.as_str()));
        self.merge_metadata(values);
        self.workflow_status = WorkflowStatus::Failed;
        self.should_continue = false;
        self.termination_reason = Some(message.into());
    }
}

/// Partial update returned by a node
///
/// Empty collections and `None` leave the corresponding field alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateUpdate {
    pub next_node: Option<NodeId>,
    pub messages: Vec<Message>,
    pub tool_outputs: Map<String, Value>,
    pub errors: Vec<ErrorEntry>,
    pub compliance_data: Map<String, Value>,
    pub metadata: Option<Map<String, Value>>,
    pub workflow_status: Option<WorkflowStatus>,
    pub should_continue: Option<bool>,
    pub requires_human_review: Option<bool>,
    pub termination_reason: Option<String>,
    pub task_result: Option<Value>,
    pub operation_timeout_ms: Option<u64>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route to `node` after this one
    pub fn goto(mut self, node: impl Into<String>) -> Self {
        self.next_node = Some(node.into());
        self
    }

    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn tool_output(mut self, tool: impl Into<String>, output: Value) -> Self {
        self.tool_outputs.insert(tool.into(), output);
        self
    }

    pub fn error(mut self, entry: ErrorEntry) -> Self {
        self.errors.push(entry);
        self
    }

    pub fn compliance(mut self, key: impl Into<String>, value: Value) -> Self {
        self.compliance_data.insert(key.into(), value);
        self
    }

    pub fn metadata_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn status(mut self, status: WorkflowStatus) -> Self {
        self.workflow_status = Some(status);
        self
    }

    pub fn stop(mut self, reason: impl Into<String>) -> Self {
        self.should_continue = Some(false);
        self.termination_reason = Some(reason.into());
        self
    }

    pub fn human_review(mut self) -> Self {
        self.requires_human_review = Some(true);
        self
    }

    pub fn result(mut self, result: Value) -> Self {
        self.task_result = Some(result);
        self
    }

    pub fn operation_timeout(mut self, timeout_ms: u64) -> Self {
        self.operation_timeout_ms = Some(timeout_ms);
        self
    }
}
