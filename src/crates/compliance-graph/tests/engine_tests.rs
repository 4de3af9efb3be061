//! Integration tests for the graph execution engine

use compliance_checkpoint::{CheckpointConfig, CheckpointSaver, CheckpointSource, InMemoryCheckpointSaver};
use compliance_graph::{
    AutonomyLevel, BackoffConfig, CancellationToken, ComplianceState, EngineConfig, ErrorClass, ErrorEntry,
    GraphError, NodeError, PolicyError, RecoveryPolicy, RecoveryRouting, RetryDecision,
    RetryPolicyEngine, StateGraph, StateUpdate, WorkflowStatus, END, ERROR_HANDLER,
};
use futures::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn state(thread: &str) -> ComplianceState {
    ComplianceState::new("session-1", "acme", thread)
}

fn deterministic_policy() -> Arc<RetryPolicyEngine> {
    Arc::new(RetryPolicyEngine::new(BackoffConfig::default().without_jitter()))
}

/// Node that fails with `error` for the first `failures` calls, then succeeds
fn flaky(
    graph: &mut StateGraph,
    name: &str,
    failures: usize,
    error: NodeError,
) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    graph.add_node(name, move |_state| {
        let counter = counter.clone();
        let error = error.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < failures {
                Err(error)
            } else {
                Ok(StateUpdate::new())
            }
        }
    });
    calls
}

fn review_graph() -> StateGraph {
    let mut graph = StateGraph::new();
    graph
        .add_node("analyze", |_state| async move {
            Ok(StateUpdate::new().compliance("frameworks", json!(["SOC2"])))
        })
        .add_node("human_review", |state: ComplianceState| async move {
            let approved = state
                .metadata()
                .get("human_input")
                .and_then(|input| input.get("approved"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Ok(StateUpdate::new().compliance("review", json!({"approved": approved})))
        })
        .add_node("finalize", |_state| async move {
            Ok(StateUpdate::new().result(json!({"status": "assessed"})))
        })
        .add_edge("analyze", "human_review")
        .add_edge("human_review", "finalize")
        .add_edge("finalize", END)
        .set_entry_point("analyze")
        .interrupt_before(["human_review"]);
    graph
}

#[tokio::test]
async fn test_linear_workflow_completes() {
    let saver = Arc::new(InMemoryCheckpointSaver::new());
    let compiled = review_graph()
        .compile()
        .unwrap()
        .with_checkpointer(saver.clone());

    let result = compiled
        .invoke(state("t-linear").with_autonomy(AutonomyLevel::Autonomous))
        .await
        .unwrap();

    assert_eq!(result.workflow_status, WorkflowStatus::Completed);
    assert_eq!(result.visited_nodes(), ["analyze", "human_review", "finalize"]);
    assert_eq!(result.turn_count, 3);
    assert_eq!(result.task_result, Some(json!({"status": "assessed"})));
    assert_eq!(result.node_latencies().len(), 3);
    assert_eq!(result.retry_count, 0);

    // input + one per node + terminal
    let config = CheckpointConfig::new()
        .with_thread_id("t-linear")
        .with_checkpoint_ns("compliance");
    let history: Vec<_> = saver
        .list(&config, None, None)
        .await
        .unwrap()
        .map(|t| t.unwrap())
        .collect()
        .await;
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].metadata.source, Some(CheckpointSource::Terminal));
    assert_eq!(history[4].metadata.source, Some(CheckpointSource::Input));
    let ids: Vec<u64> = history.iter().map(|t| t.checkpoint.id).collect();
    assert_eq!(ids, vec![5, 4, 3, 2, 1]);
}

#[tokio::test]
async fn test_unknown_entry_node_is_rejected() {
    let compiled = review_graph().compile().unwrap();
    let err = compiled
        .invoke_from("missing", state("t"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::UnknownNode(name) if name == "missing"));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_failure_retries_after_backoff() {
    let mut graph = StateGraph::new();
    let calls = flaky(
        &mut graph,
        "fetch_evidence",
        1,
        NodeError::typed("rate_limit", "429 Too Many Requests"),
    );
    graph
        .add_edge("fetch_evidence", END)
        .set_entry_point("fetch_evidence")
        .with_recovery_policy(deterministic_policy());
    let compiled = graph.compile().unwrap();

    let started = tokio::time::Instant::now();
    let result = compiled.invoke(state("t-rate")).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(1_000));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.workflow_status, WorkflowStatus::Completed);
    assert_eq!(
        result.visited_nodes(),
        ["fetch_evidence", ERROR_HANDLER, "fetch_evidence"]
    );
    assert_eq!(result.retry_count, 0);
    assert_eq!(result.error_count(), 1);
    assert!(!result.has_pending_errors());
    assert_eq!(result.metadata().get_str("last_error_class"), Some("rate_limit"));
    assert_eq!(result.metadata().get("retry_wait_ms"), Some(&json!(1_000)));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_the_run() {
    let mut graph = StateGraph::new();
    let calls = flaky(&mut graph, "sync", usize::MAX, NodeError::new("mysterious failure"));
    graph
        .add_edge("sync", END)
        .set_entry_point("sync")
        .with_recovery_policy(deterministic_policy());
    let compiled = graph.compile().unwrap();

    let result = compiled
        .invoke(state("t-exhausted").with_max_retries(1))
        .await
        .unwrap();

    // first attempt plus two retries; the third failure sees retry_count 2 > 1
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.workflow_status, WorkflowStatus::Failed);
    assert!(!result.should_continue);
    assert!(result.requires_human_review);
    assert_eq!(result.retry_count, 2);
    assert_eq!(result.failure_reason(), Some("max_retries_exceeded"));
    assert_eq!(result.errors().len(), 3);
    assert!(result.termination_reason.is_some());
}

#[tokio::test]
async fn test_validation_error_is_not_retried() {
    let mut graph = StateGraph::new();
    let calls = flaky(
        &mut graph,
        "ingest",
        usize::MAX,
        NodeError::new("schema validation failed: missing company_id"),
    );
    graph.add_edge("ingest", END).set_entry_point("ingest");
    let compiled = graph.compile().unwrap();

    let result = compiled.invoke(state("t-validation")).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.workflow_status, WorkflowStatus::Failed);
    assert!(result.requires_human_review);
    assert_eq!(result.failure_reason(), Some("non_retryable_error"));
    assert_eq!(result.retry_count, 0);
    assert_eq!(result.visited_nodes(), ["ingest", ERROR_HANDLER]);
}

#[tokio::test]
async fn test_panicking_handler_is_captured() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut graph = StateGraph::new();
    graph
        .add_node("score", move |_state| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("score table corrupted");
                }
                Ok(StateUpdate::new())
            }
        })
        .add_edge("score", END)
        .set_entry_point("score")
        .with_recovery_policy(Arc::new(RetryPolicyEngine::new(BackoffConfig {
            unknown_base_ms: 1,
            ..BackoffConfig::default()
        })));
    let compiled = graph.compile().unwrap();

    let result = compiled.invoke(state("t-panic")).await.unwrap();

    assert_eq!(result.workflow_status, WorkflowStatus::Completed);
    assert!(result.errors()[0].message.contains("panicked"));
    assert!(result.errors()[0].resolved);
}

#[tokio::test(start_paused = true)]
async fn test_node_timeout_grows_operation_timeout() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut graph = StateGraph::new();
    graph
        .add_node("scan", move |_state| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok(StateUpdate::new())
            }
        })
        .add_edge("scan", END)
        .set_entry_point("scan");
    let compiled = graph.compile().unwrap();

    let mut initial = state("t-timeout");
    initial.operation_timeout_ms = Some(100);
    let result = compiled.invoke(initial).await.unwrap();

    assert_eq!(result.workflow_status, WorkflowStatus::Completed);
    assert_eq!(result.errors()[0].error_type.as_deref(), Some("timeout"));
    assert_eq!(result.operation_timeout_ms, Some(150));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_handler_reported_errors_trigger_recovery() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut graph = StateGraph::new();
    graph
        .add_node("notify", move |_state| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(StateUpdate::new().error(ErrorEntry::new("external api 500").with_type("api")))
                } else {
                    Ok(StateUpdate::new().result(json!({"sent": true})))
                }
            }
        })
        .add_edge("notify", END)
        .set_entry_point("notify");
    let compiled = graph.compile().unwrap();

    let result = compiled.invoke(state("t-reported")).await.unwrap();

    assert_eq!(result.workflow_status, WorkflowStatus::Completed);
    assert_eq!(result.errors()[0].node.as_deref(), Some("notify"));
    assert!(result.errors()[0].resolved);
    assert_eq!(result.task_result, Some(json!({"sent": true})));
}

#[tokio::test]
async fn test_interrupt_and_resume_with_human_input() {
    let saver = Arc::new(InMemoryCheckpointSaver::new());
    let compiled = review_graph()
        .compile()
        .unwrap()
        .with_checkpointer(saver.clone());

    let paused = compiled.invoke(state("t-review")).await.unwrap();
    assert_eq!(paused.workflow_status, WorkflowStatus::Interrupted);
    assert_eq!(paused.interrupted_node.as_deref(), Some("human_review"));
    assert_eq!(paused.visited_nodes(), ["analyze", "human_review"]);

    let resumed = compiled
        .resume(
            "t-review",
            Some(json!({"approved": true})),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(resumed.workflow_status, WorkflowStatus::Completed);
    assert_eq!(resumed.visited_nodes(), ["analyze", "human_review", "finalize"]);
    assert_eq!(resumed.compliance_data()["review"], json!({"approved": true}));
    assert_eq!(resumed.metadata().get_str("resumed_from"), Some("human_review"));
    assert!(resumed.interrupted_node.is_none());

    // the resume checkpoint records the transition back to in_progress
    let config = CheckpointConfig::new()
        .with_thread_id("t-review")
        .with_checkpoint_ns("compliance");
    let resume_checkpoint = saver
        .list(&config, None, None)
        .await
        .unwrap()
        .map(|t| t.unwrap())
        .filter(|t| futures::future::ready(t.metadata.source == Some(CheckpointSource::Resume)))
        .next()
        .await
        .unwrap();
    assert_eq!(resume_checkpoint.metadata.status.as_deref(), Some("in_progress"));
    let snapshot: ComplianceState = resume_checkpoint.checkpoint.state().unwrap();
    assert_eq!(snapshot.visited_nodes(), ["analyze", "human_review"]);
}

#[tokio::test]
async fn test_resume_rejects_non_interrupted_threads() {
    let saver = Arc::new(InMemoryCheckpointSaver::new());
    let compiled = review_graph()
        .compile()
        .unwrap()
        .with_checkpointer(saver);

    let missing = compiled
        .resume("never-ran", None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(missing, GraphError::ThreadNotFound(_)));

    compiled
        .invoke(state("t-done").with_autonomy(AutonomyLevel::Autonomous))
        .await
        .unwrap();
    let err = compiled
        .resume("t-done", None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GraphError::NotInterrupted { status: WorkflowStatus::Completed, .. }
    ));
}

#[tokio::test]
async fn test_resume_requires_checkpointer() {
    let compiled = review_graph().compile().unwrap();
    let err = compiled
        .resume("t", None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::NoCheckpointer(_)));
}

#[tokio::test]
async fn test_manual_autonomy_pauses_before_every_node() {
    let compiled = review_graph().compile().unwrap();

    let paused = compiled
        .invoke(state("t-manual").with_autonomy(AutonomyLevel::Manual))
        .await
        .unwrap();
    assert_eq!(paused.interrupted_node.as_deref(), Some("analyze"));

    let next = compiled
        .resume_state(paused, None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(next.workflow_status, WorkflowStatus::Interrupted);
    assert_eq!(next.interrupted_node.as_deref(), Some("human_review"));
    assert_eq!(next.visited_nodes(), ["analyze", "human_review"]);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let saver = Arc::new(InMemoryCheckpointSaver::new());
    let compiled = review_graph()
        .compile()
        .unwrap()
        .with_checkpointer(saver.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = compiled
        .invoke_from("analyze", state("t-cancel"), cancel)
        .await
        .unwrap();

    assert_eq!(result.workflow_status, WorkflowStatus::Failed);
    assert_eq!(result.failure_reason(), Some("cancelled"));
    assert!(!result.should_continue);
    assert!(result.visited_nodes().is_empty());

    let stored = compiled.get_state("t-cancel").await.unwrap().unwrap();
    assert_eq!(stored.failure_reason(), Some("cancelled"));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_interrupts_backoff_wait() {
    let mut graph = StateGraph::new();
    flaky(&mut graph, "fetch", usize::MAX, NodeError::typed("rate_limit", "429"));
    graph
        .add_edge("fetch", END)
        .set_entry_point("fetch")
        .with_recovery_policy(Arc::new(RetryPolicyEngine::new(BackoffConfig {
            rate_limit_base_ms: 60_000,
            ..BackoffConfig::default()
        })));
    let compiled = graph.compile().unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let result = compiled
        .invoke_from("fetch", state("t-cancel-wait"), cancel)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(result.workflow_status, WorkflowStatus::Failed);
    assert_eq!(result.failure_reason(), Some("cancelled"));
    assert!(result
        .termination_reason
        .as_deref()
        .unwrap()
        .contains("backoff"));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_a_running_node() {
    let saver = Arc::new(InMemoryCheckpointSaver::new());
    let mut graph = StateGraph::new();
    graph
        .add_node("render", |_state| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(StateUpdate::new())
        })
        .add_edge("render", END)
        .set_entry_point("render");
    let compiled = graph.compile().unwrap().with_checkpointer(saver);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let result = compiled
        .invoke_from("render", state("t-cancel-node"), cancel)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(result.workflow_status, WorkflowStatus::Failed);
    assert_eq!(result.failure_reason(), Some("cancelled"));
    assert!(!result.should_continue);

    let stored = compiled.get_state("t-cancel-node").await.unwrap().unwrap();
    assert_eq!(stored.workflow_status, WorkflowStatus::Failed);
    assert_eq!(stored.failure_reason(), Some("cancelled"));
}

#[tokio::test]
async fn test_max_turns_forces_termination() {
    let mut graph = StateGraph::new();
    graph
        .add_node("poll", |_state| async move { Ok(StateUpdate::new().goto("poll")) })
        .set_entry_point("poll");
    let compiled = graph.compile().unwrap();

    let result = compiled
        .invoke(state("t-turns").with_max_turns(5))
        .await
        .unwrap();

    assert_eq!(result.turn_count, 5);
    assert_eq!(result.workflow_status, WorkflowStatus::Failed);
    assert_eq!(result.failure_reason(), Some("max_turns_exceeded"));
}

#[tokio::test(start_paused = true)]
async fn test_session_budget_forces_termination() {
    let mut graph = StateGraph::new();
    graph
        .add_node("poll", |_state| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(StateUpdate::new().goto("poll"))
        })
        .set_entry_point("poll");
    let compiled = graph.compile().unwrap().with_config(EngineConfig {
        session_timeout_secs: Some(25),
        ..EngineConfig::default()
    });

    let result = compiled.invoke(state("t-session")).await.unwrap();

    assert_eq!(result.turn_count, 3);
    assert_eq!(result.workflow_status, WorkflowStatus::Failed);
    assert_eq!(result.failure_reason(), Some("session_timeout"));
    assert!(!result.should_continue);
}

#[tokio::test]
async fn test_route_to_unknown_node_fails() {
    let mut graph = StateGraph::new();
    graph
        .add_node("triage", |_state| async move { Ok(StateUpdate::new().goto("nowhere")) })
        .set_entry_point("triage");
    let compiled = graph.compile().unwrap();

    let result = compiled.invoke(state("t-route")).await.unwrap();
    assert_eq!(result.workflow_status, WorkflowStatus::Failed);
    assert_eq!(result.failure_reason(), Some("invalid_route"));
}

#[tokio::test]
async fn test_conditional_routing_is_driven_by_state() {
    let mut graph = StateGraph::new();
    let branches = HashMap::from([
        ("escalate".to_string(), "alert".to_string()),
        ("ok".to_string(), END.to_string()),
    ]);
    graph
        .add_node("score", |_state| async move {
            Ok(StateUpdate::new().compliance("score", json!(42)))
        })
        .add_node("alert", |_state| async move {
            Ok(StateUpdate::new().result(json!({"alerted": true})))
        })
        .add_conditional_edges(
            "score",
            |state: &ComplianceState| {
                let score = state.compliance_data()["score"].as_i64().unwrap_or(0);
                if score < 60 { "escalate".to_string() } else { "ok".to_string() }
            },
            branches,
        )
        .add_edge("alert", END)
        .set_entry_point("score");
    let compiled = graph.compile().unwrap();

    let result = compiled.invoke(state("t-cond")).await.unwrap();
    assert_eq!(result.visited_nodes(), ["score", "alert"]);
    assert_eq!(result.task_result, Some(json!({"alerted": true})));
}

#[tokio::test]
async fn test_pending_errors_prevent_completion() {
    let mut graph = StateGraph::new();
    graph
        .add_node("noop", |_state| async move { Ok(StateUpdate::new()) })
        .set_entry_point("noop");
    let compiled = graph.compile().unwrap();

    let mut initial = state("t-pending");
    initial
        .apply(StateUpdate::new().error(ErrorEntry::new("left over").with_node("legacy_sync")))
        .unwrap();

    let result = compiled.invoke(initial).await.unwrap();
    assert_eq!(result.workflow_status, WorkflowStatus::Failed);
    assert_eq!(result.failure_reason(), Some("unresolved_errors"));
}

#[tokio::test]
async fn test_last_successful_node_recovery_routing() {
    let mut graph = StateGraph::new();
    graph.add_node("prepare", |_state| async move { Ok(StateUpdate::new()) });
    flaky(&mut graph, "submit", 1, NodeError::typed("api", "external api 500"));
    graph
        .add_edge("prepare", "submit")
        .add_edge("submit", END)
        .set_entry_point("prepare")
        .with_recovery_routing(RecoveryRouting::LastSuccessfulNode);
    let compiled = graph.compile().unwrap();

    let result = compiled.invoke(state("t-last-ok")).await.unwrap();
    assert_eq!(result.workflow_status, WorkflowStatus::Completed);
    assert_eq!(
        result.visited_nodes(),
        ["prepare", "submit", ERROR_HANDLER, "prepare", "submit"]
    );
}

fn prepare_then_submit(routing: RecoveryRouting) -> (StateGraph, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let mut graph = StateGraph::new();
    let prepared = flaky(&mut graph, "prepare", 0, NodeError::new("unused"));
    let submitted = flaky(
        &mut graph,
        "submit",
        usize::MAX,
        NodeError::typed("api", "external api 500"),
    );
    graph
        .add_edge("prepare", "submit")
        .add_edge("submit", END)
        .set_entry_point("prepare")
        .with_recovery_routing(routing);
    (graph, prepared, submitted)
}

#[tokio::test]
async fn test_last_successful_node_routing_exhausts_retries() {
    let (graph, prepared, submitted) = prepare_then_submit(RecoveryRouting::LastSuccessfulNode);
    let compiled = graph.compile().unwrap();

    let result = compiled
        .invoke(state("t-last-ok-exhausted").with_max_retries(3))
        .await
        .unwrap();

    // re-entering prepare must not end the episode while submit keeps failing
    assert_eq!(result.workflow_status, WorkflowStatus::Failed);
    assert_eq!(result.failure_reason(), Some("max_retries_exceeded"));
    assert_eq!(result.retry_count, 4);
    assert_eq!(submitted.load(Ordering::SeqCst), 5);
    assert_eq!(prepared.load(Ordering::SeqCst), 5);
    assert!(result.turn_count < result.max_turns);
}

#[tokio::test]
async fn test_failed_node_routing_exhausts_retries_on_multi_node_graph() {
    let (graph, prepared, submitted) = prepare_then_submit(RecoveryRouting::FailedNode);
    let compiled = graph.compile().unwrap();

    let result = compiled
        .invoke(state("t-failed-node-exhausted").with_max_retries(3))
        .await
        .unwrap();

    assert_eq!(result.workflow_status, WorkflowStatus::Failed);
    assert_eq!(result.failure_reason(), Some("max_retries_exceeded"));
    assert_eq!(result.retry_count, 4);
    assert_eq!(submitted.load(Ordering::SeqCst), 5);
    assert_eq!(prepared.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_episode_survives_breakpoint_on_recovery_path() {
    let saver = Arc::new(InMemoryCheckpointSaver::new());
    let mut graph = StateGraph::new();
    graph
        .add_node("prepare", |_state| async move { Ok(StateUpdate::new()) })
        .add_node("review", |_state| async move { Ok(StateUpdate::new()) });
    let submitted = flaky(&mut graph, "submit", 1, NodeError::typed("api", "external api 500"));
    graph
        .add_edge("prepare", "review")
        .add_edge("review", "submit")
        .add_edge("submit", END)
        .set_entry_point("prepare")
        .interrupt_before(["review"])
        .with_recovery_routing(RecoveryRouting::LastSuccessfulNode);
    let compiled = graph.compile().unwrap().with_checkpointer(saver);

    let paused = compiled.invoke(state("t-retry-review")).await.unwrap();
    assert_eq!(paused.interrupted_node.as_deref(), Some("review"));
    assert_eq!(paused.retry_count, 0);

    // submit fails once, recovery re-enters review and pauses again
    let paused = compiled
        .resume("t-retry-review", None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(paused.workflow_status, WorkflowStatus::Interrupted);
    assert_eq!(paused.interrupted_node.as_deref(), Some("review"));
    assert_eq!(paused.retry_count, 1);
    assert!(paused.has_pending_errors());

    let done = compiled
        .resume("t-retry-review", None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(done.workflow_status, WorkflowStatus::Completed);
    assert_eq!(done.retry_count, 0);
    assert!(!done.has_pending_errors());
    assert_eq!(submitted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_recovery_without_target_is_unroutable() {
    let mut graph = StateGraph::new();
    graph
        .add_node("noop", |_state| async move { Ok(StateUpdate::new()) })
        .set_entry_point("noop");
    let compiled = graph.compile().unwrap();

    let mut initial = state("t-unroutable");
    initial
        .apply(StateUpdate::new().error(ErrorEntry::new("orphan failure").with_type("api")))
        .unwrap();

    let result = compiled
        .invoke_from(ERROR_HANDLER, initial, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.workflow_status, WorkflowStatus::Failed);
    assert_eq!(result.failure_reason(), Some("unroutable_recovery"));
}

struct BrokenPolicy {
    panic: bool,
}

impl RecoveryPolicy for BrokenPolicy {
    fn classify(&self, _state: &ComplianceState) -> Result<ErrorClass, PolicyError> {
        if self.panic {
            panic!("classifier bug");
        }
        Err(PolicyError::Internal("classifier offline".to_string()))
    }

    fn decide(&self, _state: &ComplianceState, _class: ErrorClass) -> Result<RetryDecision, PolicyError> {
        unreachable!("classify always fails")
    }
}

#[tokio::test]
async fn test_policy_failures_resolve_to_failed() {
    for panic in [false, true] {
        let mut graph = StateGraph::new();
        flaky(&mut graph, "step", usize::MAX, NodeError::new("boom"));
        graph
            .add_edge("step", END)
            .set_entry_point("step")
            .with_recovery_policy(Arc::new(BrokenPolicy { panic }));
        let compiled = graph.compile().unwrap();

        let result = compiled.invoke(state("t-policy")).await.unwrap();
        assert_eq!(result.workflow_status, WorkflowStatus::Failed);
        assert_eq!(result.failure_reason(), Some("policy_engine_failure"));
        assert!(result.requires_human_review);
    }
}

#[tokio::test]
async fn test_concurrent_threads_share_one_graph() {
    let saver = Arc::new(InMemoryCheckpointSaver::new());
    let compiled = Arc::new(
        review_graph()
            .compile()
            .unwrap()
            .with_checkpointer(saver.clone()),
    );

    let mut handles = Vec::new();
    for i in 0..10 {
        let compiled = compiled.clone();
        handles.push(tokio::spawn(async move {
            compiled
                .invoke(state(&format!("t-{i}")).with_autonomy(AutonomyLevel::Autonomous))
                .await
                .unwrap()
        }));
    }

    for handle in handles {
        let result = handle.await.unwrap();
        assert_eq!(result.workflow_status, WorkflowStatus::Completed);
        assert_eq!(result.visited_nodes().len(), 3);
    }
    assert_eq!(saver.thread_count().await, 10);
    assert_eq!(saver.checkpoint_count().await, 50);
}
