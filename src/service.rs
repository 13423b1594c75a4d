//! The core facade adapters speak to: submit, plan, approve, signal, list,
//! and executor control. Front-ends (CLI, webhook servers) stay thin by
//! calling these operations and nothing else.

use crate::agent::Planner;
use crate::config::Config;
use crate::executor::{ExecutorService, ExecutorStatus, ProcessMap, TaskSignal};
use crate::models::{LogLevel, Plan, Summary, Task, TaskLogEntry, TaskStatus};
use crate::notifier::Notifier;
use crate::sandbox;
use crate::store::{StatusFields, TaskStore};
use crate::toolconfig::ToolRegistry;
use crate::{NightshiftError, Result};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::info;

/// Submission options supplied by adapters.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub timeout_seconds: Option<u64>,
}

/// A task together with its audit trail and completion summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskDetails {
    pub task: Task,
    pub logs: Vec<TaskLogEntry>,
    pub summary: Option<Summary>,
}

pub struct Nightshift {
    config: Config,
    store: TaskStore,
    registry: ToolRegistry,
    planner: Planner,
    process_map: ProcessMap,
    executor: Arc<ExecutorService>,
}

impl Nightshift {
    pub fn new(config: Config) -> Result<Self> {
        config.ensure_layout()?;
        let store = TaskStore::open(&config.database_path())?;
        let registry = ToolRegistry::load(&config.tool_registry_path())?;
        let process_map = ProcessMap::new();
        let notifier = Notifier::new(config.clone());
        let executor = Arc::new(ExecutorService::new(
            config.clone(),
            store.clone(),
            registry.clone(),
            process_map.clone(),
            notifier,
        ));
        let planner = Planner::new(config.agent.clone(), registry.clone());
        Ok(Self {
            config,
            store,
            registry,
            planner,
            process_map,
            executor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Create a STAGED task from the raw request.
    pub fn submit(&self, description: &str, options: SubmitOptions) -> Result<String> {
        if description.trim().is_empty() {
            return Err(NightshiftError::InvalidPlan(
                "task description is empty".to_string(),
            ));
        }
        let task = Task::new(description).with_timeout(
            options
                .timeout_seconds
                .unwrap_or(self.config.agent.default_timeout_seconds),
        );
        self.store.create(&task)?;
        self.store
            .append_log(&task.task_id, LogLevel::Info, "task submitted");
        info!(task_id = %task.task_id, "task submitted");
        Ok(task.task_id)
    }

    /// Run the planner and persist the resulting plan on the task.
    pub async fn plan_task(&self, task_id: &str) -> Result<Plan> {
        let mut task = self.must_get(task_id)?;
        let plan = self.planner.plan(&task.description).await?;
        task.apply_plan(&plan);
        self.store.update_plan(task_id, &task)?;
        self.store.append_log(
            task_id,
            LogLevel::Info,
            &format!("plan stored: {} tools", plan.allowed_tools.len()),
        );
        Ok(plan)
    }

    /// Re-plan with reviewer feedback; the task stays STAGED.
    pub async fn replan(&self, task_id: &str, feedback: &str) -> Result<Plan> {
        let mut task = self.must_get(task_id)?;
        let plan = self.planner.revise(&task, feedback).await?;
        task.apply_plan(&plan);
        self.store.update_plan(task_id, &task)?;
        self.store
            .append_log(task_id, LogLevel::Info, "plan revised");
        Ok(plan)
    }

    /// Approve for execution. Sandbox and tool validation run here so a
    /// dangerous plan can never reach COMMITTED.
    pub fn approve(&self, task_id: &str) -> Result<()> {
        let task = self.must_get(task_id)?;
        if let Err(e) = sandbox::validate_directories(&task.allowed_directories) {
            self.store
                .append_log(task_id, LogLevel::Error, &format!("approval rejected: {e}"));
            return Err(e);
        }
        if let Err(e) = self.registry.validate_tools(&task.allowed_tools) {
            self.store
                .append_log(task_id, LogLevel::Error, &format!("approval rejected: {e}"));
            return Err(e);
        }
        self.store
            .update_status(task_id, TaskStatus::Committed, StatusFields::default())?;
        self.store.append_log(task_id, LogLevel::Info, "approved");
        info!(task_id, "task approved");
        Ok(())
    }

    /// Cancel a task that has not started running.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        self.must_get(task_id)?;
        self.store.update_status(
            task_id,
            TaskStatus::Cancelled,
            StatusFields {
                error_message: Some("cancelled before execution".to_string()),
                ..Default::default()
            },
        )?;
        self.store.append_log(task_id, LogLevel::Info, "cancelled");
        Ok(())
    }

    /// Suspend the task's live subprocess.
    pub fn pause(&self, task_id: &str) -> Result<()> {
        self.process_map.signal(task_id, TaskSignal::Pause)
    }

    /// Resume a paused subprocess.
    pub fn resume(&self, task_id: &str) -> Result<()> {
        self.process_map.signal(task_id, TaskSignal::Resume)
    }

    /// Kill the task's live subprocess; the run ends CANCELLED.
    pub fn kill_task(&self, task_id: &str) -> Result<()> {
        self.process_map.signal(task_id, TaskSignal::Kill)
    }

    pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        self.store.list(status)
    }

    /// Task record with its logs and (when present) persisted summary.
    pub fn get(&self, task_id: &str) -> Result<TaskDetails> {
        let task = self.must_get(task_id)?;
        let logs = self.store.get_logs(task_id)?;
        let summary = std::fs::read_to_string(self.config.notification_path(task_id))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());
        Ok(TaskDetails {
            task,
            logs,
            summary,
        })
    }

    /// Truncate the store. Artifacts on disk are left in place.
    pub fn clear_all(&self) -> Result<()> {
        self.store.clear_all()
    }

    pub async fn executor_start(&self) -> Result<()> {
        self.executor
            .start(
                self.config.executor.max_workers,
                Duration::from_secs_f64(self.config.executor.poll_interval_secs),
            )
            .await
    }

    pub async fn executor_stop(&self, graceful_timeout: Duration) -> Result<()> {
        self.executor.stop(graceful_timeout).await
    }

    pub async fn executor_status(&self) -> ExecutorStatus {
        self.executor.status().await
    }

    fn must_get(&self, task_id: &str) -> Result<Task> {
        self.store
            .get(task_id)?
            .ok_or_else(|| NightshiftError::NotFound(task_id.to_string()))
    }
}
