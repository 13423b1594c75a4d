use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current position of a task in the staged-approval lifecycle.
///
/// Wire representation is the lowercase string form; the store and all
/// artifacts use it verbatim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Staged,
    Committed,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Staged => "staged",
            TaskStatus::Committed => "committed",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// The allowed edges of the status transition graph. Cancellation is
    /// reachable from every non-terminal state except mid-claim: staged and
    /// committed tasks cancel directly, running and paused ones via kill.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Staged, Committed)
                | (Staged, Cancelled)
                | (Committed, Running)
                | (Committed, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staged" => Ok(TaskStatus::Staged),
            "committed" => Ok(TaskStatus::Committed),
            "running" => Ok(TaskStatus::Running),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("unknown task status: {s}")),
        }
    }
}

/// Generate a fresh task identifier: `task_` plus eight lowercase hex chars.
pub fn new_task_id() -> String {
    format!("task_{:08x}", rand::random::<u32>())
}

/// Check a candidate against the task identifier grammar.
pub fn is_valid_task_id(candidate: &str) -> bool {
    regex::Regex::new(r"^task_[0-9a-f]{8}$")
        .map(|re| re.is_match(candidate))
        .unwrap_or(false)
}

/// The central entity: one user request moving through the lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub description: String,
    pub status: TaskStatus,
    pub allowed_tools: Vec<String>,
    pub allowed_directories: Vec<String>,
    pub needs_git: bool,
    pub system_prompt: Option<String>,
    pub estimated_tokens: Option<u64>,
    pub estimated_time: Option<u64>,
    pub timeout_seconds: u64,
    pub process_id: Option<u32>,
    pub result_path: Option<String>,
    pub token_usage: Option<u64>,
    pub execution_time: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a STAGED task from the original user request.
    pub fn new(description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: new_task_id(),
            description: description.into(),
            status: TaskStatus::Staged,
            allowed_tools: Vec::new(),
            allowed_directories: Vec::new(),
            needs_git: false,
            system_prompt: None,
            estimated_tokens: None,
            estimated_time: None,
            timeout_seconds: crate::constants::DEFAULT_TASK_TIMEOUT_SECS,
            process_id: None,
            result_path: None,
            token_usage: None,
            execution_time: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Enrich the task from a planner-produced plan. Only valid while STAGED;
    /// the store enforces that restriction on persistence.
    pub fn apply_plan(&mut self, plan: &Plan) {
        self.description = plan.enhanced_prompt.clone();
        self.allowed_tools = plan.allowed_tools.clone();
        self.allowed_directories = plan.allowed_directories.clone();
        self.needs_git = plan.needs_git;
        self.system_prompt = Some(plan.system_prompt.clone());
        self.estimated_tokens = plan.estimated_tokens;
        self.estimated_time = plan.estimated_time;
        self.updated_at = Utc::now();
    }
}

/// Structured execution plan produced by the planner adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub enhanced_prompt: String,
    pub allowed_tools: Vec<String>,
    pub allowed_directories: Vec<String>,
    #[serde(default)]
    pub needs_git: bool,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub estimated_tokens: Option<u64>,
    #[serde(default)]
    pub estimated_time: Option<u64>,
}

/// Kind of filesystem change observed between tracker snapshots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
}

/// One observed change inside the tracked directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileChange {
    pub path: String,
    pub kind: FileChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_hash: Option<String>,
}

/// Severity levels for the append-only task audit trail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(format!("unknown log level: {s}")),
        }
    }
}

/// One entry of a task's append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Outcome of a single agent-runner execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub token_usage: Option<u64>,
    pub execution_time: f64,
    pub result_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub file_changes: Vec<FileChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
}

/// Completion summary composed by the notifier and persisted as an artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub task_id: String,
    pub description: String,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    pub execution_time: Option<f64>,
    pub token_usage: Option<u64>,
    pub file_changes: FileChangeSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
}

/// File changes grouped per category, truncated for display.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileChangeSummary {
    pub created: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}
