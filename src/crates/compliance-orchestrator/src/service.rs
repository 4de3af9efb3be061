//! Service entry points
//!
//! [`ComplianceOrchestrator`] wires the compiled compliance graph, its checkpoint
//! store, the unified router and the scheduler together from one
//! [`OrchestratorConfig`]. It is the API the binary and embedding services call.

use crate::config::OrchestratorConfig;
use crate::router::{route, TaskCategory, UnifiedTaskRouter};
use crate::scheduler::{SchedulerHealth, TaskScheduler};
use crate::task::{ScheduledTask, TaskDescriptor};
use crate::workflows::{build_compliance_graph, WorkflowHandlers};
use crate::{OrchestratorError, Result};
use compliance_checkpoint::{CheckpointSaver, FileCheckpointSaver, InMemoryCheckpointSaver};
use compliance_graph::{CancellationToken, ComplianceState};
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug)]
pub struct ComplianceOrchestrator {
    config: OrchestratorConfig,
    router: Arc<UnifiedTaskRouter>,
    scheduler: TaskScheduler,
}

impl ComplianceOrchestrator {
    /// Build from configuration and register the configured tasks
    ///
    /// Checkpoints go to `checkpoint.directory` when set, otherwise to memory.
    pub async fn new(config: OrchestratorConfig, handlers: WorkflowHandlers) -> Result<Self> {
        let saver: Arc<dyn CheckpointSaver> = match &config.checkpoint.directory {
            Some(directory) => Arc::new(FileCheckpointSaver::new(directory.clone())),
            None => Arc::new(InMemoryCheckpointSaver::new()),
        };
        Self::with_checkpointer(config, handlers, saver).await
    }

    pub async fn with_checkpointer(
        config: OrchestratorConfig,
        handlers: WorkflowHandlers,
        saver: Arc<dyn CheckpointSaver>,
    ) -> Result<Self> {
        config.validate()?;

        let graph = build_compliance_graph(&handlers, config.backoff.clone())?
            .with_checkpointer(saver)
            .with_config(config.engine.clone());
        let router = Arc::new(UnifiedTaskRouter::new(Arc::new(graph)));
        let scheduler = TaskScheduler::new(
            router.clone(),
            config.scheduler.clone(),
            config.backoff.clone(),
        );

        for task in config.scheduled_tasks()? {
            scheduler.register(task).await?;
        }
        tracing::info!(
            tasks = config.tasks.len(),
            checkpoint_ns = %config.engine.checkpoint_ns,
            "Compliance orchestrator ready"
        );

        Ok(Self {
            config,
            router,
            scheduler,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn router(&self) -> &UnifiedTaskRouter {
        &self.router
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Run a task immediately and return its result
    pub async fn execute_task(&self, task_type: &str, params: Value) -> Result<Value> {
        self.router.execute(task_type, params).await
    }

    /// Register a task with the scheduler and return its id
    pub async fn schedule_task(&self, descriptor: TaskDescriptor) -> Result<String> {
        if route(&descriptor.task_type) == TaskCategory::Error {
            return Err(OrchestratorError::UnknownTaskType(descriptor.task_type));
        }
        let task: ScheduledTask = descriptor.into_task(&self.config.scheduler)?;
        self.scheduler.register(task).await
    }

    /// Current scheduler record of a task as a JSON map
    pub async fn task_status(&self, task_id: &str) -> Result<Map<String, Value>> {
        let task = self
            .scheduler
            .task_status(task_id)
            .await
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        match serde_json::to_value(task)? {
            Value::Object(map) => Ok(map),
            other => Err(OrchestratorError::ExecutionFailed(format!(
                "task {task_id} serialized to {other}"
            ))),
        }
    }

    /// Continue a run that paused for human review
    pub async fn resume(&self, thread_id: &str, human_input: Option<Value>) -> Result<Value> {
        self.router.resume(thread_id, human_input).await
    }

    /// Latest checkpointed state of a workflow thread
    pub async fn workflow_state(&self, thread_id: &str) -> Result<Option<ComplianceState>> {
        Ok(self.router.graph().get_state(thread_id).await?)
    }

    pub async fn health(&self) -> SchedulerHealth {
        self.scheduler.health().await
    }

    /// Drive the scheduler until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        self.scheduler.run(cancel).await
    }
}
