//! Scheduler behaviour against scripted dispatchers

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use compliance_graph::{BackoffConfig, CancellationToken, StateUpdate, WorkflowStatus};
use compliance_orchestrator::{
    handler_fn, ComplianceOrchestrator, OrchestratorConfig, OrchestratorError, Result, Schedule,
    ScheduledTask, SchedulerConfig, SchedulerHealth, TaskCategory, TaskDescriptor, TaskDispatcher,
    TaskPriority, TaskScheduler, TaskStatus, WorkflowHandlers,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

fn rate_limited() -> OrchestratorError {
    OrchestratorError::WorkflowFailed {
        thread_id: "t".to_string(),
        reason: Some("max_retries_exceeded".to_string()),
        message: "rate limited".to_string(),
        error_type: None,
        last_error: Some("HTTP 429 too many requests".to_string()),
    }
}

/// Records dispatched task types and fails with a fixed error until `fail_times` is used up
struct Scripted {
    calls: Mutex<Vec<String>>,
    failures: AtomicUsize,
    error: fn() -> OrchestratorError,
}

impl Scripted {
    fn new(fail_times: usize, error: fn() -> OrchestratorError) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(fail_times),
            error,
        })
    }

    fn ok() -> Arc<Self> {
        Self::new(0, rate_limited)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskDispatcher for Scripted {
    async fn dispatch(&self, task_type: &str, _params: Value, _cancel: CancellationToken) -> Result<Value> {
        self.calls.lock().unwrap().push(task_type.to_string());
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err((self.error)());
        }
        Ok(json!({"status": "completed", "task_type": task_type}))
    }
}

/// Blocks until released
struct Gate(Arc<Notify>);

#[async_trait]
impl TaskDispatcher for Gate {
    async fn dispatch(&self, _task_type: &str, _params: Value, _cancel: CancellationToken) -> Result<Value> {
        self.0.notified().await;
        Ok(json!({"status": "completed"}))
    }
}

struct Sleepy;

#[async_trait]
impl TaskDispatcher for Sleepy {
    async fn dispatch(&self, _task_type: &str, _params: Value, _cancel: CancellationToken) -> Result<Value> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(Value::Null)
    }
}

struct Panicky;

#[async_trait]
impl TaskDispatcher for Panicky {
    async fn dispatch(&self, _task_type: &str, _params: Value, _cancel: CancellationToken) -> Result<Value> {
        panic!("dispatcher exploded");
    }
}

fn scheduler(dispatcher: Arc<dyn TaskDispatcher>) -> TaskScheduler {
    TaskScheduler::new(
        dispatcher,
        SchedulerConfig::default(),
        BackoffConfig::default().without_jitter(),
    )
}

fn once(id: &str, task_type: &str) -> ScheduledTask {
    ScheduledTask::new(task_type, Schedule::Once).with_id(id)
}

#[tokio::test]
async fn test_most_urgent_due_task_dispatches_first() {
    let gate = Arc::new(Notify::new());
    let scheduler = scheduler(Arc::new(Gate(gate.clone())));
    let now = Utc::now();

    let normal = once("normal", "generate_report")
        .with_priority(TaskPriority::Normal)
        .with_next_run(now);
    let critical = once("critical", "compliance_alert")
        .with_priority(TaskPriority::Critical)
        .with_next_run(now);
    scheduler.register(normal).await.unwrap();
    scheduler.register(critical).await.unwrap();

    let handle = scheduler.tick_at(now).await.expect("a task is due");

    let critical = scheduler.task_status("critical").await.unwrap();
    assert_eq!(critical.status, TaskStatus::Running);
    assert_eq!(critical.last_run, Some(now));

    let normal = scheduler.task_status("normal").await.unwrap();
    assert_eq!(normal.status, TaskStatus::Pending);
    assert_eq!(normal.next_run, Some(now));
    assert_eq!(normal.run_count, 0);
    assert!(normal.last_run.is_none());

    gate.notify_one();
    handle.await.unwrap();
    assert_eq!(
        scheduler.task_status("critical").await.unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn test_tasks_not_yet_due_are_skipped() {
    let dispatcher = Scripted::ok();
    let scheduler = scheduler(dispatcher.clone());
    let now = Utc::now();
    let later = now + ChronoDuration::minutes(10);

    scheduler
        .register(once("later", "generate_report").with_next_run(later))
        .await
        .unwrap();
    let before = scheduler.task_status("later").await.unwrap();

    assert!(scheduler.tick_at(now).await.is_none());
    assert_eq!(scheduler.task_status("later").await.unwrap(), before);
    assert!(dispatcher.calls().is_empty());

    scheduler.tick_at(later).await.unwrap().await.unwrap();
    assert_eq!(dispatcher.calls(), ["generate_report"]);
}

#[tokio::test]
async fn test_retryable_failure_backs_off_then_fails_after_budget() {
    let dispatcher = Scripted::new(usize::MAX, rate_limited);
    let scheduler = scheduler(dispatcher.clone());
    let start = Utc::now();
    scheduler
        .register(
            once("scores", "update_compliance_scores")
                .with_max_retries(2)
                .with_next_run(start),
        )
        .await
        .unwrap();

    scheduler.tick_at(start).await.unwrap().await.unwrap();
    let task = scheduler.task_status("scores").await.unwrap();
    assert_eq!(task.status, TaskStatus::Retrying);
    assert_eq!(task.retry_count, 1);
    assert!(task.next_run.unwrap() >= start + ChronoDuration::milliseconds(1_000));
    assert!(task.last_error.as_deref().unwrap().contains("max_retries_exceeded"));

    // still inside the backoff window
    assert!(scheduler.tick_at(start).await.is_none());

    scheduler
        .tick_at(start + ChronoDuration::seconds(2))
        .await
        .unwrap()
        .await
        .unwrap();
    let task = scheduler.task_status("scores").await.unwrap();
    assert_eq!(task.status, TaskStatus::Retrying);
    assert_eq!(task.retry_count, 2);
    assert!(task.next_run.unwrap() >= start + ChronoDuration::milliseconds(2_000));

    scheduler
        .tick_at(start + ChronoDuration::seconds(30))
        .await
        .unwrap()
        .await
        .unwrap();
    let task = scheduler.task_status("scores").await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 3);

    assert!(scheduler.tick_at(start + ChronoDuration::hours(1)).await.is_none());
    assert_eq!(dispatcher.calls().len(), 3);
    assert_eq!(
        scheduler.health().await,
        SchedulerHealth {
            pending: 0,
            running: 0,
            failed: 1,
            total: 1
        }
    );
}

#[tokio::test]
async fn test_validation_failure_is_not_retried() {
    let dispatcher = Scripted::new(1, || OrchestratorError::InvalidParams("missing framework".into()));
    let scheduler = scheduler(dispatcher.clone());
    let now = Utc::now();
    scheduler
        .register(once("gap", "gap_analysis").with_next_run(now))
        .await
        .unwrap();

    scheduler.tick_at(now).await.unwrap().await.unwrap();
    let task = scheduler.task_status("gap").await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 1);
    assert!(task.last_error.unwrap().contains("missing framework"));
}

#[tokio::test]
async fn test_resume_revives_failed_task_with_fresh_budget() {
    let dispatcher = Scripted::new(1, || OrchestratorError::InvalidParams("bad".into()));
    let scheduler = scheduler(dispatcher.clone());
    let now = Utc::now();
    scheduler
        .register(once("gap", "gap_analysis").with_next_run(now))
        .await
        .unwrap();
    scheduler.tick_at(now).await.unwrap().await.unwrap();
    assert_eq!(scheduler.task_status("gap").await.unwrap().status, TaskStatus::Failed);

    scheduler.resume("gap").await.unwrap();
    let task = scheduler.task_status("gap").await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);

    scheduler
        .tick_at(Utc::now() + ChronoDuration::seconds(1))
        .await
        .unwrap()
        .await
        .unwrap();
    let task = scheduler.task_status("gap").await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.run_count, 2);
    assert!(task.last_error.is_none());
}

#[tokio::test]
async fn test_pause_and_resume() {
    let scheduler = scheduler(Scripted::ok());
    let now = Utc::now();
    scheduler
        .register(once("report", "generate_report").with_next_run(now))
        .await
        .unwrap();

    scheduler.pause("report").await.unwrap();
    assert!(scheduler.task_status("report").await.unwrap().paused);
    assert!(scheduler.tick_at(now).await.is_none());

    scheduler.resume("report").await.unwrap();
    scheduler.tick_at(now).await.unwrap().await.unwrap();
    assert_eq!(
        scheduler.task_status("report").await.unwrap().status,
        TaskStatus::Completed
    );

    assert!(matches!(
        scheduler.pause("missing").await,
        Err(OrchestratorError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn test_cancelled_task_is_never_selected_or_resumed() {
    let scheduler = scheduler(Scripted::ok());
    let now = Utc::now();
    scheduler
        .register(once("alert", "compliance_alert").with_next_run(now))
        .await
        .unwrap();

    scheduler.cancel("alert").await.unwrap();
    assert_eq!(
        scheduler.task_status("alert").await.unwrap().status,
        TaskStatus::Cancelled
    );
    assert!(scheduler.tick_at(now).await.is_none());
    assert!(matches!(
        scheduler.resume("alert").await,
        Err(OrchestratorError::InvalidStateTransition { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_timeout_is_retried_as_timeout() {
    let scheduler = scheduler(Arc::new(Sleepy));
    let now = Utc::now();
    scheduler
        .register(
            once("slow", "database_metrics")
                .with_timeout(Duration::from_secs(1))
                .with_next_run(now),
        )
        .await
        .unwrap();

    scheduler.tick_at(now).await.unwrap().await.unwrap();
    let task = scheduler.task_status("slow").await.unwrap();
    assert_eq!(task.status, TaskStatus::Retrying);
    assert_eq!(task.retry_count, 1);
    assert!(task.last_error.unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_timeout_leaves_a_failed_workflow_checkpoint() {
    let handlers = WorkflowHandlers::new().with(
        TaskCategory::Reporting,
        handler_fn(|_state| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(StateUpdate::new().result(json!({"report": "late.pdf"})))
        }),
    );
    let orchestrator = ComplianceOrchestrator::new(OrchestratorConfig::default(), handlers)
        .await
        .unwrap();
    let descriptor = TaskDescriptor {
        task_id: Some("report".to_string()),
        timeout_secs: Some(5),
        params: json!({"thread_id": "t-timeout"}),
        ..TaskDescriptor::new("generate_report", "once")
    };
    orchestrator.schedule_task(descriptor).await.unwrap();

    orchestrator.scheduler().tick().await.unwrap().await.unwrap();

    let task = orchestrator.scheduler().task_status("report").await.unwrap();
    assert_eq!(task.status, TaskStatus::Retrying);
    assert!(task.last_error.unwrap().contains("timed out"));

    let stored = orchestrator.workflow_state("t-timeout").await.unwrap().unwrap();
    assert_eq!(stored.workflow_status, WorkflowStatus::Failed);
    assert_eq!(stored.failure_reason(), Some("cancelled"));
    assert!(!stored.should_continue);
    assert!(stored.termination_reason.is_some());
}

#[tokio::test]
async fn test_dispatcher_panic_is_recorded() {
    let scheduler = scheduler(Arc::new(Panicky));
    let now = Utc::now();
    scheduler
        .register(once("boom", "health_check").with_next_run(now))
        .await
        .unwrap();

    scheduler.tick_at(now).await.unwrap().await.unwrap();
    let task = scheduler.task_status("boom").await.unwrap();
    assert_eq!(task.status, TaskStatus::Retrying);
    assert!(task.last_error.unwrap().contains("panicked"));
}

#[tokio::test]
async fn test_run_loop_drains_due_tasks_until_cancelled() {
    let dispatcher = Scripted::ok();
    let scheduler = scheduler(dispatcher.clone());
    let now = Utc::now();
    for (id, priority) in [("a", TaskPriority::Low), ("b", TaskPriority::High), ("c", TaskPriority::Normal)] {
        scheduler
            .register(once(id, "health_check").with_priority(priority).with_next_run(now))
            .await
            .unwrap();
    }
    scheduler
        .register(
            ScheduledTask::new("database_metrics", Schedule::every(Duration::from_secs(600)))
                .with_id("metrics"),
        )
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let runner = {
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    for _ in 0..200 {
        if scheduler.health().await.pending == 1 && scheduler.health().await.running == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    runner.await.unwrap();

    for id in ["a", "b", "c"] {
        assert_eq!(scheduler.task_status(id).await.unwrap().status, TaskStatus::Completed);
    }
    let metrics = scheduler.task_status("metrics").await.unwrap();
    assert_eq!(metrics.status, TaskStatus::Pending);
    assert_eq!(metrics.run_count, 1);
    assert!(metrics.next_run.unwrap() > Utc::now() + ChronoDuration::minutes(9));
    assert_eq!(dispatcher.calls().len(), 4);

    let listed: Vec<_> = scheduler.list().await.into_iter().map(|t| t.task_id).collect();
    assert_eq!(listed, ["b", "c", "metrics", "a"]);
}
