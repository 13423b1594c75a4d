//! Background execution service: a single polling controller plus a pool of
//! workers, each owning one sandboxed agent subprocess at a time.

pub mod lock;
pub mod process_map;

pub use lock::ExecutorLock;
pub use process_map::{ProcessMap, TaskSignal};

use crate::agent::AgentRunner;
use crate::config::Config;
use crate::models::{LogLevel, Task, TaskStatus};
use crate::notifier::Notifier;
use crate::store::{StatusFields, TaskStore};
use crate::toolconfig::ToolRegistry;
use crate::{NightshiftError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutorStatus {
    pub running: bool,
    pub worker_count: usize,
    pub active_tasks: Vec<String>,
}

struct RunningState {
    shutdown_tx: watch::Sender<bool>,
    controller: JoinHandle<()>,
    permits: Arc<Semaphore>,
    max_workers: usize,
    _lock: ExecutorLock,
}

/// Long-lived singleton driving committed tasks to completion.
pub struct ExecutorService {
    config: Config,
    store: TaskStore,
    registry: ToolRegistry,
    process_map: ProcessMap,
    notifier: Arc<Notifier>,
    runner_working_dir: Option<PathBuf>,
    state: Mutex<Option<RunningState>>,
}

impl ExecutorService {
    pub fn new(
        config: Config,
        store: TaskStore,
        registry: ToolRegistry,
        process_map: ProcessMap,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            process_map,
            notifier: Arc::new(notifier),
            runner_working_dir: None,
            state: Mutex::new(None),
        }
    }

    /// Pin the working directory workers run tasks in. Defaults to the
    /// process working directory.
    pub fn with_runner_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runner_working_dir = Some(dir.into());
        self
    }

    /// Start polling. Refuses when this or another process already holds
    /// the executor lock.
    pub async fn start(&self, max_workers: usize, poll_interval: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(NightshiftError::Executor {
                message: "executor is already running".to_string(),
            });
        }
        let lock = ExecutorLock::acquire(&self.config.executor_lock_path())?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(max_workers));
        let controller = tokio::spawn(Self::poll_loop(
            self.config.clone(),
            self.store.clone(),
            self.registry.clone(),
            self.process_map.clone(),
            self.notifier.clone(),
            self.runner_working_dir.clone(),
            permits.clone(),
            poll_interval,
            shutdown_rx,
        ));

        *state = Some(RunningState {
            shutdown_tx,
            controller,
            permits,
            max_workers,
            _lock: lock,
        });
        info!(max_workers, ?poll_interval, "executor started");
        Ok(())
    }

    /// Stop polling; wait up to `graceful_timeout` for in-flight workers,
    /// then kill their subprocesses.
    pub async fn stop(&self, graceful_timeout: Duration) -> Result<()> {
        let Some(state) = self.state.lock().await.take() else {
            return Ok(());
        };
        let _ = state.shutdown_tx.send(true);
        if let Err(e) = state.controller.await {
            warn!("controller join failed: {e}");
        }

        let wanted = state.max_workers as u32;
        match timeout(graceful_timeout, state.permits.clone().acquire_many_owned(wanted)).await {
            Ok(Ok(_permits)) => info!("executor stopped; all workers drained"),
            Ok(Err(e)) => warn!("worker drain failed: {e}"),
            Err(_) => {
                warn!("graceful timeout elapsed; killing live subprocesses");
                self.process_map.kill_all();
                let _ = timeout(
                    Duration::from_secs(5),
                    state.permits.clone().acquire_many_owned(wanted),
                )
                .await;
            }
        }
        Ok(())
    }

    pub async fn status(&self) -> ExecutorStatus {
        let state = self.state.lock().await;
        ExecutorStatus {
            running: state.is_some(),
            worker_count: state.as_ref().map(|s| s.max_workers).unwrap_or(0),
            active_tasks: self.process_map.active_tasks(),
        }
    }

    pub fn process_map(&self) -> &ProcessMap {
        &self.process_map
    }

    #[allow(clippy::too_many_arguments)]
    async fn poll_loop(
        config: Config,
        store: TaskStore,
        registry: ToolRegistry,
        process_map: ProcessMap,
        notifier: Arc<Notifier>,
        working_dir: Option<PathBuf>,
        permits: Arc<Semaphore>,
        poll_interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!("polling loop started");
        loop {
            tokio::select! {
                _ = sleep(poll_interval) => {}
                _ = shutdown_rx.changed() => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }

            // Claim work while idle slots remain; storage errors are logged
            // and retried on the next tick.
            loop {
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    break;
                };
                match store.acquire_for_execution() {
                    Ok(Some(task)) => {
                        tokio::spawn(Self::run_one(
                            config.clone(),
                            store.clone(),
                            registry.clone(),
                            process_map.clone(),
                            notifier.clone(),
                            working_dir.clone(),
                            task,
                            permit,
                        ));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("task acquisition failed, retrying next tick: {e}");
                        break;
                    }
                }
            }
        }
        debug!("polling loop exited");
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one(
        config: Config,
        store: TaskStore,
        registry: ToolRegistry,
        process_map: ProcessMap,
        notifier: Arc<Notifier>,
        working_dir: Option<PathBuf>,
        task: Task,
        permit: OwnedSemaphorePermit,
    ) {
        let task_id = task.task_id.clone();
        info!(%task_id, "worker picked up task");

        let runner = match AgentRunner::new(
            config,
            store.clone(),
            registry,
            process_map,
        ) {
            Ok(runner) => match &working_dir {
                Some(dir) => runner.with_working_dir(dir),
                None => runner,
            },
            Err(e) => {
                Self::fail_task(&store, &task_id, &e.to_string());
                drop(permit);
                return;
            }
        };

        match runner.execute(&task).await {
            Ok(outcome) => {
                // Refetch so the summary carries the terminal status.
                let final_task = store.get(&task_id).ok().flatten().unwrap_or(task);
                if let Err(e) = notifier.notify(&final_task, &outcome).await {
                    warn!(%task_id, "notification failed: {e}");
                }
            }
            Err(e) => {
                error!(%task_id, "run failed before completion: {e}");
                Self::fail_task(&store, &task_id, &e.to_string());
            }
        }
        drop(permit);
    }

    fn fail_task(store: &TaskStore, task_id: &str, message: &str) {
        store.append_log(task_id, LogLevel::Error, message);
        let fields = StatusFields {
            error_message: Some(message.to_string()),
            ..Default::default()
        };
        if let Err(e) = store.update_status(task_id, TaskStatus::Failed, fields) {
            error!(%task_id, "could not mark task failed: {e}");
        }
    }
}
