//! Graph execution engine
//!
//! Drives one [`ComplianceState`] through a [`CompiledGraph`]. Each step:
//!
//! 1. check cancellation, the turn cap and the session budget
//! 2. record the node in `visited_nodes` and honour interrupt breakpoints
//! 3. run the handler on its own task with a per-node timeout
//! 4. merge the returned patch, or record the failure and route to
//!    [`ERROR_HANDLER`](crate::ERROR_HANDLER)
//! 5. resolve the successor and write a checkpoint
//!
//! Node failures never escape as `Err`. Returned errors, panics and timeouts all become
//! `errors` entries; the caller always gets a state that is `COMPLETED`, `FAILED` or
//! `INTERRUPTED`. `Err` is reserved for problems outside the workflow: an unknown
//! entry node, a failing checkpoint store, or an invalid resume.
//!
//! The engine keeps no state of its own between calls, so one compiled graph can run
//! many threads concurrently. Cancellation is checked between nodes and during
//! backoff waits, never in the middle of a handler.

use crate::error::{GraphError, NodeError, Result};
use crate::graph::{CompiledGraph, RecoveryRouting, END, ERROR_HANDLER};
use crate::policy::{PolicyError, RecoveryAction, RetryDecision};
use crate::state::{ComplianceState, ErrorEntry, FailureReason, NodeId, WorkflowStatus};
use compliance_checkpoint::{Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSource};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Execution limits and checkpoint placement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Namespace used for every checkpoint written by this graph
    pub checkpoint_ns: String,
    /// Per-node timeout when the state carries no `operation_timeout_ms`
    pub node_timeout_ms: u64,
    /// Wall-clock budget for one invocation; `None` disables it
    pub session_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_ns: "compliance".to_string(),
            node_timeout_ms: 60_000,
            session_timeout_secs: Some(3_600),
        }
    }
}

impl CompiledGraph {
    /// Run from the entry point
    pub async fn invoke(&self, state: ComplianceState) -> Result<ComplianceState> {
        let entry = self.entry.clone();
        self.invoke_from(&entry, state, CancellationToken::new()).await
    }

    /// Run from a named node with a cancellation token
    #[tracing::instrument(skip(self, state, cancel), fields(thread_id = %state.thread_id()))]
    pub async fn invoke_from(
        &self,
        entry: &str,
        state: ComplianceState,
        cancel: CancellationToken,
    ) -> Result<ComplianceState> {
        if entry != ERROR_HANDLER && !self.has_node(entry) {
            return Err(GraphError::UnknownNode(entry.to_string()));
        }

        tracing::info!("Starting workflow execution");
        self.checkpoint(&state, CheckpointSource::Input, None).await?;
        self.run(state, entry.to_string(), false, cancel).await
    }

    /// Resume an interrupted thread from its latest checkpoint
    ///
    /// `human_input` is stored as `metadata.human_input`. The interrupted node runs
    /// next without a second `visited_nodes` entry and without re-checking its
    /// breakpoint.
    #[tracing::instrument(skip(self, human_input, cancel))]
    pub async fn resume(
        &self,
        thread_id: &str,
        human_input: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<ComplianceState> {
        let state = self
            .get_state(thread_id)
            .await?
            .ok_or_else(|| GraphError::ThreadNotFound(thread_id.to_string()))?;
        self.resume_state(state, human_input, cancel).await
    }

    /// Resume from a state held by the caller
    pub async fn resume_state(
        &self,
        mut state: ComplianceState,
        human_input: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<ComplianceState> {
        if state.workflow_status != WorkflowStatus::Interrupted {
            return Err(GraphError::NotInterrupted {
                thread_id: state.thread_id().to_string(),
                status: state.workflow_status,
            });
        }

        let node = state
            .interrupted_node
            .take()
            .or_else(|| state.current_node.clone())
            .ok_or_else(|| {
                GraphError::Validation(format!(
                    "Thread {} has no interrupted node",
                    state.thread_id()
                ))
            })?;
        if !self.has_node(&node) {
            return Err(GraphError::UnknownNode(node));
        }

        let mut values = Map::new();
        values.insert("resumed_from".to_string(), json!(node));
        if let Some(input) = human_input {
            values.insert("human_input".to_string(), input);
        }
        state.merge_metadata(values);
        // A breakpoint hit during recovery resumes into the same retry episode
        state.workflow_status = if state.retry_count > 0 && state.has_pending_errors() {
            WorkflowStatus::Retrying
        } else {
            WorkflowStatus::InProgress
        };
        state.should_continue = true;
        state.termination_reason = None;

        tracing::info!(node = %node, "Resuming interrupted workflow");
        self.checkpoint(&state, CheckpointSource::Resume, Some(&node)).await?;
        self.run(state, node, true, cancel).await
    }

    /// Latest checkpointed state of a thread
    pub async fn get_state(&self, thread_id: &str) -> Result<Option<ComplianceState>> {
        let saver = self
            .checkpointer
            .as_ref()
            .ok_or(GraphError::NoCheckpointer("get_state"))?;
        match saver.get(&self.checkpoint_config(thread_id)).await? {
            Some(checkpoint) => Ok(Some(checkpoint.state()?)),
            None => Ok(None),
        }
    }

    fn checkpoint_config(&self, thread_id: &str) -> CheckpointConfig {
        CheckpointConfig::new()
            .with_thread_id(thread_id)
            .with_checkpoint_ns(self.config.checkpoint_ns.clone())
    }

    async fn checkpoint(
        &self,
        state: &ComplianceState,
        source: CheckpointSource,
        node: Option<&str>,
    ) -> Result<()> {
        let Some(saver) = &self.checkpointer else {
            return Ok(());
        };

        let mut metadata = CheckpointMetadata::new()
            .with_source(source)
            .with_step(state.turn_count)
            .with_status(state.workflow_status.as_str());
        if let Some(node) = node {
            metadata = metadata.with_node(node);
        }

        let saved = saver
            .put(
                &self.checkpoint_config(state.thread_id()),
                Checkpoint::from_state(state)?,
                metadata,
            )
            .await?;
        tracing::debug!(checkpoint_id = ?saved.checkpoint_id, source = ?source, "Checkpoint saved");
        Ok(())
    }

    async fn run(
        &self,
        mut state: ComplianceState,
        start: NodeId,
        mut resuming: bool,
        cancel: CancellationToken,
    ) -> Result<ComplianceState> {
        let started = Instant::now();
        let budget = self.config.session_timeout_secs.map(Duration::from_secs);
        let mut node = start;

        loop {
            if node == END {
                return self.finish(state).await;
            }
            if cancel.is_cancelled() {
                state.fail(
                    FailureReason::Cancelled,
                    format!("Execution cancelled before {node}"),
                );
                return self.finish(state).await;
            }
            if state.turn_count >= state.max_turns {
                state.fail(
                    FailureReason::MaxTurnsExceeded,
                    format!("Reached max turns ({})", state.max_turns),
                );
                return self.finish(state).await;
            }
            if budget.is_some_and(|budget| started.elapsed() >= budget) {
                state.fail(
                    FailureReason::SessionTimeout,
                    "Session wall-clock budget exhausted",
                );
                return self.finish(state).await;
            }

            state.current_node = Some(node.clone());
            if !resuming {
                state.visit(&node);
                if node != ERROR_HANDLER
                    && self
                        .interrupts
                        .should_interrupt_before(&node, state.autonomy_level)
                {
                    return self.interrupt(state, node).await;
                }
            }
            resuming = false;

            let next = if node == ERROR_HANDLER {
                self.recover(&mut state, &cancel).await
            } else {
                self.execute_node(&node, &mut state, &cancel).await
            };

            state.turn_count += 1;
            state.next_node = Some(next.clone());
            self.checkpoint(&state, CheckpointSource::Loop, Some(&node))
                .await?;

            if !state.should_continue || state.workflow_status.is_terminal() {
                return self.finish(state).await;
            }
            node = next;
        }
    }

    async fn execute_node(
        &self,
        node: &str,
        state: &mut ComplianceState,
        cancel: &CancellationToken,
    ) -> NodeId {
        let Some(spec) = self.nodes.get(node) else {
            state.fail(
                FailureReason::InvalidRoute,
                format!("Node {node} does not exist"),
            );
            return END.to_string();
        };

        state.next_node = None;
        let timeout = Duration::from_millis(
            state
                .operation_timeout_ms
                .unwrap_or(self.config.node_timeout_ms),
        );

        tracing::debug!(node = %node, timeout_ms = timeout.as_millis() as u64, "Executing node");
        let started = Instant::now();
        let mut handle = tokio::spawn((spec.executor)(state.clone()));
        let joined = tokio::select! {
            joined = tokio::time::timeout(timeout, &mut handle) => Some(joined),
            _ = cancel.cancelled() => None,
        };
        let outcome = match joined {
            Some(Ok(Ok(result))) => result,
            Some(Ok(Err(join_err))) => Err(NodeError::new(format!(
                "Node {node} panicked: {join_err}"
            ))),
            Some(Err(_)) => {
                handle.abort();
                Err(NodeError::typed(
                    "timeout",
                    format!("Node {node} timed out after {}ms", timeout.as_millis()),
                ))
            }
            None => {
                handle.abort();
                state.record_latency(node, started.elapsed().as_millis() as u64);
                state.fail(
                    FailureReason::Cancelled,
                    format!("Execution cancelled while running {node}"),
                );
                return END.to_string();
            }
        };
        state.record_latency(node, started.elapsed().as_millis() as u64);

        let mut update = match outcome {
            Ok(update) => update,
            Err(err) => return Self::record_failure(node, state, err),
        };

        let reported_errors = !update.errors.is_empty();
        for entry in update.errors.iter_mut().filter(|e| e.node.is_none()) {
            entry.node = Some(node.to_string());
        }
        if let Err(err) = state.apply(update) {
            return Self::record_failure(node, state, err.into());
        }
        if reported_errors {
            tracing::warn!(node = %node, "Node reported errors, routing to error handler");
            return ERROR_HANDLER.to_string();
        }

        let resolved = state.resolve_errors_for(node);
        match state.workflow_status {
            WorkflowStatus::Pending => state.workflow_status = WorkflowStatus::InProgress,
            // The episode ends only when the node that failed succeeds; re-entering an
            // earlier node keeps the retry budget running.
            WorkflowStatus::Retrying if resolved == 0 && state.has_pending_errors() => {
                tracing::debug!(
                    node = %node,
                    retries = state.retry_count,
                    "Node succeeded while failed node is still pending"
                );
            }
            WorkflowStatus::Retrying => {
                tracing::info!(
                    node = %node,
                    retries = state.retry_count,
                    resolved_errors = resolved,
                    "Node recovered after retry"
                );
                state.workflow_status = WorkflowStatus::InProgress;
                state.retry_count = 0;
            }
            _ => {}
        }
        state.last_successful_node = Some(node.to_string());

        match self.route(node, state) {
            Ok(next) => next,
            Err(target) => {
                state.fail(
                    FailureReason::InvalidRoute,
                    format!("Node {node} routed to unknown node {target}"),
                );
                END.to_string()
            }
        }
    }

    fn record_failure(node: &str, state: &mut ComplianceState, err: NodeError) -> NodeId {
        tracing::warn!(node = %node, error = %err, "Node failed, routing to error handler");
        let mut entry = ErrorEntry::new(err.message).with_node(node);
        entry.error_type = err.error_type;
        state.record_error(entry);
        ERROR_HANDLER.to_string()
    }

    fn decide(&self, state: &ComplianceState) -> std::result::Result<RetryDecision, PolicyError> {
        catch_unwind(AssertUnwindSafe(|| {
            let class = self.policy.classify(state)?;
            self.policy.decide(state, class)
        }))
        .unwrap_or_else(|_| Err(PolicyError::Internal("recovery policy panicked".to_string())))
    }

    async fn recover(&self, state: &mut ComplianceState, cancel: &CancellationToken) -> NodeId {
        let decision = match self.decide(state) {
            Ok(decision) => decision,
            Err(err) => {
                tracing::error!(error = %err, "Recovery policy failed");
                state.requires_human_review = true;
                state.fail(
                    FailureReason::PolicyEngineFailure,
                    format!("Recovery policy failed: {err}"),
                );
                return END.to_string();
            }
        };

        let failed_node = state.last_error().and_then(|e| e.node.clone());
        tracing::info!(
            class = %decision.class,
            action = ?decision.action,
            wait_ms = ?decision.wait_ms(),
            retry_count = state.retry_count,
            failed_node = ?failed_node,
            "Recovery decision"
        );

        if let Err(err) = state.apply(decision.patch) {
            state.fail(
                FailureReason::PolicyEngineFailure,
                format!("Recovery patch rejected: {err}"),
            );
            return END.to_string();
        }

        if decision.action == RecoveryAction::Fail {
            if state.workflow_status != WorkflowStatus::Failed {
                state.fail(
                    FailureReason::NonRetryableError,
                    format!("Recovery policy gave up on {} error", decision.class),
                );
            }
            return END.to_string();
        }

        if let Some(wait) = decision.wait.filter(|w| !w.is_zero()) {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {
                    state.fail(FailureReason::Cancelled, "Execution cancelled during retry backoff");
                    return END.to_string();
                }
            }
        }

        let target = match self.recovery_routing {
            RecoveryRouting::FailedNode => failed_node,
            RecoveryRouting::LastSuccessfulNode => state.last_successful_node.clone(),
        };
        match target.filter(|t| self.has_node(t)) {
            Some(target) => {
                state.retry_count += 1;
                tracing::info!(node = %target, retry_count = state.retry_count, "Re-entering node");
                target
            }
            None => {
                state.fail(
                    FailureReason::UnroutableRecovery,
                    format!(
                        "No node to re-enter under {:?} recovery routing",
                        self.recovery_routing
                    ),
                );
                END.to_string()
            }
        }
    }

    async fn interrupt(&self, mut state: ComplianceState, node: NodeId) -> Result<ComplianceState> {
        state.workflow_status = WorkflowStatus::Interrupted;
        state.interrupted_node = Some(node.clone());
        state.next_node = Some(node.clone());
        state.termination_reason = Some(format!("Awaiting human confirmation before {node}"));

        self.checkpoint(&state, CheckpointSource::Terminal, Some(&node))
            .await?;
        tracing::info!(node = %node, "Workflow interrupted for human review");
        Ok(state)
    }

    async fn finish(&self, mut state: ComplianceState) -> Result<ComplianceState> {
        match state.workflow_status {
            WorkflowStatus::Failed | WorkflowStatus::Interrupted => {}
            _ if state.has_pending_errors() => state.fail(
                FailureReason::UnresolvedErrors,
                "Workflow ended with unresolved errors",
            ),
            _ => {
                state.workflow_status = WorkflowStatus::Completed;
                state.should_continue = false;
            }
        }

        let node = state.current_node.clone();
        self.checkpoint(&state, CheckpointSource::Terminal, node.as_deref())
            .await?;

        match state.workflow_status {
            WorkflowStatus::Failed => tracing::warn!(
                reason = ?state.failure_reason(),
                termination_reason = ?state.termination_reason,
                errors = state.error_count(),
                "Workflow failed"
            ),
            status => tracing::info!(
                status = %status,
                turns = state.turn_count,
                total_latency_ms = state.total_latency_ms(),
                "Workflow finished"
            ),
        }
        Ok(state)
    }
}
