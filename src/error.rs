use thiserror::Error;

/// Convenience type alias for Results with NightshiftError
pub type Result<T> = std::result::Result<T, NightshiftError>;

/// Main error type for NightShift
///
/// Each variant corresponds to a failure class in the task lifecycle:
/// storage, planning, sandboxing, subprocess execution, and notification.
#[derive(Error, Debug)]
pub enum NightshiftError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage error: {0}")]
    StorageIo(String),

    #[error("invalid transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("planner timed out after {seconds}s")]
    PlannerTimeout { seconds: u64 },

    #[error("launch failed: {0}")]
    LaunchFailed(String),

    #[error("dangerous path: {0}")]
    DangerousPath(String),

    #[error("task {0} has no live process")]
    NotRunning(String),

    #[error("agent failure: {0}")]
    AgentFailure(String),

    #[error("task exceeded timeout of {seconds}s")]
    TimeoutExceeded { seconds: u64 },

    #[error("notifier error: {0}")]
    Notifier(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("executor error: {message}")]
    Executor { message: String },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl NightshiftError {
    /// Storage-class errors are retried by the executor's polling loop;
    /// everything else surfaces to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NightshiftError::Storage(_) | NightshiftError::StorageIo(_)
        )
    }
}
