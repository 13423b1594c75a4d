//! Sandboxed execution of one claimed task.
//!
//! The runner owns the subprocess from spawn to reap: it publishes the PID,
//! registers the control channel, stream-parses stdout, enforces the task
//! timeout, applies pause/resume/kill requests, and converts every outcome
//! into a terminal task state. The only error it raises past its boundary
//! is a launch failure before the PID was published.

use super::stream::StreamCollector;
use super::{find_agent_binary, prepare_environment, AgentCommandBuilder, OutputFormat};
use crate::config::Config;
use crate::executor::process_map::{ProcessMap, TaskSignal};
use crate::models::{ExecutionOutcome, FileChange, LogLevel, Task, TaskStatus};
use crate::sandbox::SandboxProfile;
use crate::store::{StatusFields, TaskStore};
use crate::toolconfig::ToolRegistry;
use crate::tracker::FileTracker;
use crate::{constants, NightshiftError, Result};
use serde_json::json;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

/// Why the subprocess stopped producing output.
enum RunEnd {
    /// Stdout reached EOF; wait for the exit status.
    Finished,
    /// Killed on user request; the message becomes the error.
    Cancelled(String),
    /// The task's wall-clock limit elapsed.
    TimedOut,
}

pub struct AgentRunner {
    config: Config,
    store: TaskStore,
    registry: ToolRegistry,
    process_map: ProcessMap,
    working_dir: PathBuf,
}

impl AgentRunner {
    pub fn new(
        config: Config,
        store: TaskStore,
        registry: ToolRegistry,
        process_map: ProcessMap,
    ) -> Result<Self> {
        let working_dir = std::env::current_dir()
            .map_err(|e| NightshiftError::StorageIo(format!("current dir: {e}")))?;
        Ok(Self {
            config,
            store,
            registry,
            process_map,
            working_dir,
        })
    }

    /// Override the run's working directory (and file-tracker root).
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Run the task to a terminal state. The caller has already claimed it
    /// (status RUNNING).
    pub async fn execute(&self, task: &Task) -> Result<ExecutionOutcome> {
        let task_id = task.task_id.clone();
        let started = Instant::now();
        let timeout_seconds = task.timeout_seconds;
        let deadline = started + Duration::from_secs(timeout_seconds);

        let sandbox = SandboxProfile::generate(&task.allowed_directories, task.needs_git)
            .map_err(|e| NightshiftError::LaunchFailed(e.to_string()))?;
        let tool_config = self
            .registry
            .write_manifest(&task.allowed_tools)
            .map_err(|e| NightshiftError::LaunchFailed(e.to_string()))?;
        let tracker = FileTracker::start(&self.working_dir)
            .map_err(|e| NightshiftError::LaunchFailed(e.to_string()))?;

        let binary = find_agent_binary(&self.config.agent).await?;
        let env = prepare_environment(&self.config.agent, task.needs_git).await?;

        let mut builder = AgentCommandBuilder::new(binary)
            .with_output_format(OutputFormat::StreamJson)
            .with_allowed_tools(&task.allowed_tools)
            .with_tool_config(tool_config.path())
            .with_prompt(task.description.clone())
            .with_working_dir(&self.working_dir);
        if let Some(system_prompt) = &task.system_prompt {
            builder = builder.with_system_prompt(system_prompt.clone());
        }
        for dir in &task.allowed_directories {
            builder = builder.add_directory(dir);
        }

        let mut child = builder
            .command(&sandbox, &env, Some(&self.working_dir))
            .spawn()
            .map_err(|e| NightshiftError::LaunchFailed(format!("spawn agent binary: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| NightshiftError::LaunchFailed("subprocess has no pid".to_string()))?;

        // PID publication must precede any pause/resume/kill possibility.
        if let Err(e) = self.store.set_process_id(&task_id, Some(pid)) {
            warn!(%task_id, pid, "failed to record pid, killing subprocess: {e}");
            let _ = child.kill().await;
            return Err(NightshiftError::LaunchFailed(format!(
                "could not record pid: {e}"
            )));
        }
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let _map_entry = self.process_map.register(&task_id, pid, signal_tx);
        self.store
            .append_log(&task_id, LogLevel::Info, &format!("agent started, pid {pid}"));
        info!(%task_id, pid, "agent subprocess started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| NightshiftError::LaunchFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| NightshiftError::LaunchFailed("stderr not captured".to_string()))?;
        let stderr_reader = tokio::spawn(async move {
            let mut buf = String::new();
            let mut stderr = stderr;
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut collector = StreamCollector::new();
        let mut end = RunEnd::Finished;

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => collector.ingest(&line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(%task_id, "stdout read error: {e}");
                        break;
                    }
                },
                signal = signal_rx.recv() => {
                    match signal {
                        Some(TaskSignal::Pause) => {
                            if self.deliver(&task_id, pid, StopSignal::Pause) {
                                self.transition(&task_id, TaskStatus::Paused, "paused");
                            } else {
                                end = RunEnd::Cancelled("already terminated".to_string());
                                break;
                            }
                        }
                        Some(TaskSignal::Resume) => {
                            if self.deliver(&task_id, pid, StopSignal::Resume) {
                                self.transition(&task_id, TaskStatus::Running, "resumed");
                            } else {
                                end = RunEnd::Cancelled("already terminated".to_string());
                                break;
                            }
                        }
                        Some(TaskSignal::Kill) => {
                            end = if self.deliver(&task_id, pid, StopSignal::Kill) {
                                RunEnd::Cancelled("killed by request".to_string())
                            } else {
                                RunEnd::Cancelled("already terminated".to_string())
                            };
                            break;
                        }
                        // Channel closed; keep draining stdout.
                        None => {}
                    }
                },
                _ = sleep_until(deadline) => {
                    warn!(%task_id, pid, "task timeout after {timeout_seconds}s");
                    self.deliver(&task_id, pid, StopSignal::Kill);
                    end = RunEnd::TimedOut;
                    break;
                }
            }
        }

        // Drain whatever stdout remains after a kill, then reap.
        if !matches!(end, RunEnd::Finished) {
            let _ = tokio::time::timeout(Duration::from_secs(2), async {
                while let Ok(Some(line)) = lines.next_line().await {
                    collector.ingest(&line);
                }
            })
            .await;
        }
        let exit_status = match tokio::time::timeout_at(
            deadline + Duration::from_secs(5),
            child.wait(),
        )
        .await
        {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(%task_id, "wait failed: {e}");
                None
            }
            Err(_) => {
                warn!(%task_id, pid, "subprocess ignored deadline; killing");
                let _ = child.kill().await;
                if matches!(end, RunEnd::Finished) {
                    end = RunEnd::TimedOut;
                }
                child.wait().await.ok()
            }
        };
        let stderr_output = stderr_reader.await.unwrap_or_default();
        let execution_time = started.elapsed().as_secs_f64();

        // Diff before the terminal commit so the artifact set is complete
        // when observers see the final status.
        let file_changes = tracker.stop();
        let return_code = exit_status.and_then(|s| s.code()).unwrap_or(-1);
        let result_path = self.write_artifacts(
            &task_id,
            &collector,
            &stderr_output,
            return_code,
            &file_changes,
        )?;

        // Temp files go before the terminal status is committed.
        drop(tool_config);
        drop(sandbox);

        let (status, error_message, success) = match end {
            RunEnd::Cancelled(message) => (TaskStatus::Cancelled, Some(message), false),
            RunEnd::TimedOut => (
                TaskStatus::Failed,
                Some(
                    NightshiftError::TimeoutExceeded {
                        seconds: timeout_seconds,
                    }
                    .to_string(),
                ),
                false,
            ),
            RunEnd::Finished if return_code == 0 => (TaskStatus::Completed, None, true),
            RunEnd::Finished => {
                let tail: String = stderr_output
                    .chars()
                    .take(constants::STDERR_TRUNCATE_LENGTH)
                    .collect();
                let failure = NightshiftError::AgentFailure(format!(
                    "exited with code {return_code}: {}",
                    tail.trim()
                ));
                (TaskStatus::Failed, Some(failure.to_string()), false)
            }
        };

        let fields = StatusFields {
            result_path: Some(result_path.display().to_string()),
            token_usage: collector.token_usage,
            execution_time: Some(execution_time),
            error_message: error_message.clone(),
        };
        if let Err(e) = self.store.update_status(&task_id, status, fields.clone()) {
            // A pause landing between kill and commit leaves the row PAUSED;
            // route through RUNNING so the terminal state is recorded.
            warn!(%task_id, "terminal transition failed: {e}");
            let _ = self
                .store
                .update_status(&task_id, TaskStatus::Running, StatusFields::default());
            self.store.update_status(&task_id, status, fields)?;
        }
        let level = if success { LogLevel::Info } else { LogLevel::Error };
        self.store.append_log(
            &task_id,
            level,
            &format!(
                "agent finished: {} in {execution_time:.1}s",
                status.as_str()
            ),
        );
        debug!(%task_id, status = %status, execution_time, "run complete");

        Ok(ExecutionOutcome {
            success,
            token_usage: collector.token_usage,
            execution_time,
            result_path: result_path.display().to_string(),
            error_message,
            file_changes,
            response_text: (!collector.response_text.is_empty())
                .then(|| collector.response_text.clone()),
        })
    }

    /// Write the raw-output and file-change artifacts.
    fn write_artifacts(
        &self,
        task_id: &str,
        collector: &StreamCollector,
        stderr: &str,
        return_code: i32,
        file_changes: &[FileChange],
    ) -> Result<PathBuf> {
        let output_dir = self.config.output_dir();
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| NightshiftError::StorageIo(format!("{}: {e}", output_dir.display())))?;

        let result_path = self.config.output_artifact_path(task_id);
        let artifact = json!({
            "stdout": collector.raw_stdout,
            "stderr": stderr,
            "return_code": return_code,
            "token_usage": collector.token_usage,
        });
        std::fs::write(&result_path, serde_json::to_string_pretty(&artifact)?)
            .map_err(|e| NightshiftError::StorageIo(format!("{}: {e}", result_path.display())))?;

        let files_path = self.config.files_artifact_path(task_id);
        std::fs::write(&files_path, serde_json::to_string_pretty(file_changes)?)
            .map_err(|e| NightshiftError::StorageIo(format!("{}: {e}", files_path.display())))?;

        Ok(result_path)
    }

    fn transition(&self, task_id: &str, status: TaskStatus, verb: &str) {
        match self.store.update_status(task_id, status, StatusFields::default()) {
            Ok(()) => self.store.append_log(task_id, LogLevel::Info, verb),
            Err(e) => warn!(%task_id, "could not record {verb}: {e}"),
        }
    }

    /// Deliver a control signal to the subprocess. Returns false when the
    /// PID is already gone.
    fn deliver(&self, task_id: &str, pid: u32, signal: StopSignal) -> bool {
        match deliver_os_signal(pid, signal) {
            Ok(()) => true,
            Err(e) => {
                warn!(%task_id, pid, "signal delivery failed: {e}");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StopSignal {
    Pause,
    Resume,
    Kill,
}

#[cfg(unix)]
fn deliver_os_signal(pid: u32, signal: StopSignal) -> std::result::Result<(), String> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    let os_signal = match signal {
        StopSignal::Pause => Signal::SIGSTOP,
        StopSignal::Resume => Signal::SIGCONT,
        StopSignal::Kill => Signal::SIGKILL,
    };
    // The subprocess is its own group leader; signal the whole group.
    killpg(Pid::from_raw(pid as i32), os_signal).map_err(|e| e.to_string())
}

#[cfg(not(unix))]
fn deliver_os_signal(_pid: u32, _signal: StopSignal) -> std::result::Result<(), String> {
    Err("signal delivery unsupported on this platform".to_string())
}
