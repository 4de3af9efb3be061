//! Task scheduler
//!
//! A single poll loop owns the task table. Each tick picks the most urgent due task,
//! marks it `RUNNING`, advances its `next_run` and hands it to a [`TaskDispatcher`] on
//! its own tokio task, so a long workflow never holds up the next tick. Readiness is
//! only evaluated on poll, which bounds drift to one `poll_interval_secs`.
//!
//! Failed dispatches are classified with the same taxonomy the graph engine uses.
//! Retryable failures wait out the matching backoff in `RETRYING`; validation
//! failures and exhausted retry budgets park the task in `FAILED` until
//! [`TaskScheduler::resume`] is called.

use crate::router::TaskDispatcher;
use crate::task::{ScheduledTask, TaskStatus};
use crate::{OrchestratorError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use compliance_graph::{BackoffConfig, CancellationToken};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// How long a timed-out dispatch gets to wind down after cancellation
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Poll cadence and per-task defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    pub default_max_retries: u32,
    pub default_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            default_max_retries: 3,
            default_timeout_secs: 300,
        }
    }
}

/// Task counts by state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchedulerHealth {
    /// `PENDING` and `RETRYING`
    pub pending: usize,
    pub running: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Clone)]
pub struct TaskScheduler {
    tasks: Arc<RwLock<BTreeMap<String, ScheduledTask>>>,
    dispatcher: Arc<dyn TaskDispatcher>,
    backoff: BackoffConfig,
    config: SchedulerConfig,
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("config", &self.config)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl TaskScheduler {
    pub fn new(dispatcher: Arc<dyn TaskDispatcher>, config: SchedulerConfig, backoff: BackoffConfig) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(BTreeMap::new())),
            dispatcher,
            backoff,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Add a task; a task without `next_run` gets the schedule's first due time
    pub async fn register(&self, mut task: ScheduledTask) -> Result<String> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.task_id) {
            return Err(OrchestratorError::DuplicateTask(task.task_id));
        }
        if task.next_run.is_none() {
            task.next_run = task.schedule.first_run(Utc::now());
        }

        tracing::info!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            schedule = %task.schedule,
            priority = task.priority.value(),
            "Task registered"
        );
        let task_id = task.task_id.clone();
        tasks.insert(task_id.clone(), task);
        Ok(task_id)
    }

    /// Dispatch the most urgent task due now
    pub async fn tick(&self) -> Option<JoinHandle<()>> {
        self.tick_at(Utc::now()).await
    }

    /// Dispatch the most urgent task due at `now`
    ///
    /// Returns the handle of the spawned dispatch, or `None` when nothing is due. Tasks
    /// that are not selected are left untouched.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Option<JoinHandle<()>> {
        self.dispatch_next(now, CancellationToken::new()).await
    }

    async fn dispatch_next(&self, now: DateTime<Utc>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let (task_id, task_type, params, timeout) = {
            let mut tasks = self.tasks.write().await;
            let selected = tasks
                .values()
                .filter(|task| task.is_due(now))
                .min_by(|a, b| {
                    a.priority
                        .cmp(&b.priority)
                        .then_with(|| a.next_run.cmp(&b.next_run))
                        .then_with(|| a.task_id.cmp(&b.task_id))
                })?
                .task_id
                .clone();
            let task = tasks.get_mut(&selected)?;

            task.status = TaskStatus::Running;
            task.last_run = Some(now);
            task.run_count += 1;
            task.next_run = task.schedule.next_after(now);

            tracing::info!(
                task_id = %task.task_id,
                task_type = %task.task_type,
                priority = task.priority.value(),
                attempt = task.retry_count + 1,
                "Dispatching scheduled task"
            );
            (task.task_id.clone(), task.task_type.clone(), task.params.clone(), task.timeout())
        };

        let scheduler = self.clone();
        Some(tokio::spawn(async move {
            let result = scheduler.dispatch(&task_id, &task_type, params, timeout, cancel).await;
            scheduler.record_outcome(&task_id, result, Utc::now()).await;
        }))
    }

    async fn dispatch(
        &self,
        task_id: &str,
        task_type: &str,
        params: Value,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Value> {
        let run = AssertUnwindSafe(self.dispatcher.dispatch(task_type, params, cancel.clone()))
            .catch_unwind();
        tokio::pin!(run);
        match tokio::time::timeout(timeout, &mut run).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OrchestratorError::ExecutionFailed(format!(
                "dispatcher panicked while running {task_type}"
            ))),
            Err(_) => {
                // Let the workflow record its cancellation before the future is dropped
                cancel.cancel();
                if tokio::time::timeout(CANCEL_GRACE, &mut run).await.is_err() {
                    tracing::warn!(
                        task_id,
                        grace_ms = CANCEL_GRACE.as_millis() as u64,
                        "Timed out dispatch ignored cancellation"
                    );
                }
                Err(OrchestratorError::DispatchTimeout {
                    task_id: task_id.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn record_outcome(&self, task_id: &str, result: Result<Value>, now: DateTime<Utc>) {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(task_id) else {
            tracing::warn!(task_id, "Dispatch finished for a task that is no longer registered");
            return;
        };

        match result {
            Ok(value) => {
                task.last_result = Some(value);
                task.last_error = None;
                task.retry_count = 0;
                if task.status == TaskStatus::Cancelled {
                    return;
                }
                task.status = if task.schedule.is_periodic() {
                    TaskStatus::Pending
                } else {
                    TaskStatus::Completed
                };
                tracing::info!(task_id, status = %task.status, "Scheduled task succeeded");
            }
            Err(err) => {
                task.last_error = Some(err.to_string());
                if task.status == TaskStatus::Cancelled {
                    return;
                }
                task.retry_count += 1;
                let class = err.error_class();

                if !class.is_retryable() || task.retry_count > task.max_retries {
                    task.status = TaskStatus::Failed;
                    tracing::error!(
                        task_id,
                        error = %err,
                        error_class = %class,
                        retry_count = task.retry_count,
                        "Scheduled task failed permanently"
                    );
                    return;
                }

                let wait = self
                    .backoff
                    .wait_for(class, task.retry_count - 1)
                    .unwrap_or_default();
                task.status = TaskStatus::Retrying;
                task.next_run = ChronoDuration::from_std(wait)
                    .ok()
                    .and_then(|wait| now.checked_add_signed(wait))
                    .or(Some(now));
                tracing::warn!(
                    task_id,
                    error = %err,
                    error_class = %class,
                    retry_count = task.retry_count,
                    wait_ms = wait.as_millis() as u64,
                    "Scheduled task will be retried"
                );
            }
        }
    }

    /// Exclude a task from selection; a running dispatch finishes normally
    pub async fn pause(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        if matches!(task.status, TaskStatus::Completed | TaskStatus::Cancelled) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: task.status.to_string(),
                to: "paused".to_string(),
            });
        }
        task.paused = true;
        tracing::info!(task_id, "Task paused");
        Ok(())
    }

    /// Clear a pause, or bring a `FAILED` task back with a fresh retry budget
    ///
    /// Resumed tasks are due on the next tick.
    pub async fn resume(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        if matches!(task.status, TaskStatus::Completed | TaskStatus::Cancelled) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: task.status.to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }

        let now = Utc::now();
        task.paused = false;
        if task.status == TaskStatus::Failed {
            task.status = TaskStatus::Pending;
            task.retry_count = 0;
            task.next_run = Some(now);
        } else if task.next_run.is_none() {
            task.next_run = Some(now);
        }
        tracing::info!(task_id, status = %task.status, "Task resumed");
        Ok(())
    }

    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        if task.status == TaskStatus::Completed {
            return Err(OrchestratorError::InvalidStateTransition {
                from: task.status.to_string(),
                to: TaskStatus::Cancelled.to_string(),
            });
        }
        task.status = TaskStatus::Cancelled;
        task.next_run = None;
        tracing::info!(task_id, "Task cancelled");
        Ok(())
    }

    pub async fn task_status(&self, task_id: &str) -> Option<ScheduledTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// All tasks, most urgent first
    pub async fn list(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<_> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.task_id.cmp(&b.task_id)));
        tasks
    }

    pub async fn health(&self) -> SchedulerHealth {
        let tasks = self.tasks.read().await;
        let mut health = SchedulerHealth {
            total: tasks.len(),
            ..SchedulerHealth::default()
        };
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending | TaskStatus::Retrying => health.pending += 1,
                TaskStatus::Running => health.running += 1,
                TaskStatus::Failed => health.failed += 1,
                TaskStatus::Completed | TaskStatus::Cancelled => {}
            }
        }
        health
    }

    /// Poll until `cancel` fires
    ///
    /// Every poll drains all due tasks, then sleeps for the poll interval. On shutdown
    /// running dispatches see a cancelled token and are awaited before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        let poll = Duration::from_secs(self.config.poll_interval_secs.max(1));
        tracing::info!(poll_interval_secs = poll.as_secs(), "Scheduler started");

        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
        while !cancel.is_cancelled() {
            in_flight.retain(|handle| !handle.is_finished());

            let now = Utc::now();
            while let Some(handle) = self.dispatch_next(now, cancel.child_token()).await {
                in_flight.push(handle);
            }

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = cancel.cancelled() => {}
            }
        }

        tracing::info!(in_flight = in_flight.len(), "Scheduler stopping");
        for result in futures::future::join_all(in_flight).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Dispatch task aborted");
            }
        }
    }
}
