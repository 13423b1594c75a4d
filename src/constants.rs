//! System-wide constants shared across the task lifecycle engine.

/// Default hard wall-clock limit for a single agent run.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 900;

/// Default wall-clock limit for a planning invocation.
pub const DEFAULT_PLANNER_TIMEOUT_SECS: u64 = 120;

/// Default number of concurrent executor workers.
pub const DEFAULT_MAX_WORKERS: usize = 3;

/// Default executor polling interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 1.0;

/// SQLite busy timeout. Workers contend on the exclusive acquisition
/// transaction, so this must stay at or above 30 seconds.
pub const DB_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Summary truncation: original user request.
pub const SUMMARY_DESCRIPTION_LIMIT: usize = 500;

/// Summary truncation: concatenated agent response text.
pub const SUMMARY_RESPONSE_LIMIT: usize = 1_000;

/// Summary truncation: error message.
pub const SUMMARY_ERROR_LIMIT: usize = 300;

/// Summary limit: file changes listed per category before "and N more".
pub const SUMMARY_FILES_PER_CATEGORY: usize = 5;

/// Stderr tail carried into a FAILED task's error message.
pub const STDERR_TRUNCATE_LENGTH: usize = 500;

/// Directory entries the file tracker never descends into.
pub const TRACKER_SKIP_DIRS: &[&str] = &[
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    "target",
    ".git",
    ".hg",
    ".svn",
];

/// Path prefixes the sandbox refuses to write-allow.
pub const SANDBOX_DENIED_ROOTS: &[&str] = &[
    "/private",
    "/etc",
    "/var",
    "/usr",
    "/bin",
    "/sbin",
    "/System",
    "/Library",
    "/Applications",
    "/Volumes",
];

/// Environment variable holding the subscription-mode token passed to the
/// agent binary.
pub const SUBSCRIPTION_TOKEN_ENV: &str = "CLAUDE_CODE_OAUTH_TOKEN";

/// Conflicting direct-API token, stripped from agent subprocesses so the
/// binary authenticates under the subscription plan.
pub const CONFLICTING_TOKEN_ENV: &str = "ANTHROPIC_API_KEY";

/// Environment variable the GitHub token is handed to children under.
pub const GIT_TOKEN_ENV: &str = "GH_TOKEN";

/// Qualified external tool identifiers: `ext__<server>__<op>`.
pub const EXTERNAL_TOOL_PREFIX: &str = "ext__";
