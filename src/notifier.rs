//! Completion notifications: summary assembly, artifact persistence, and
//! delivery to the terminal and configured external sinks.

use crate::agent::stream::extract_response_text;
use crate::config::Config;
use crate::constants::{
    SUMMARY_DESCRIPTION_LIMIT, SUMMARY_ERROR_LIMIT, SUMMARY_FILES_PER_CATEGORY,
    SUMMARY_RESPONSE_LIMIT,
};
use crate::models::{
    ExecutionOutcome, FileChangeKind, FileChangeSummary, Summary, Task,
};
use crate::{NightshiftError, Result};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Per-task routing metadata written by an adapter before submission and
/// consumed (then cleared) after completion.
#[derive(Debug, Deserialize)]
struct SinkRoute {
    webhook_url: String,
    #[serde(default)]
    channel: Option<String>,
}

pub struct Notifier {
    config: Config,
    http: reqwest::Client,
    terminal: bool,
}

impl Notifier {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            terminal: true,
        }
    }

    pub fn with_terminal(mut self, enabled: bool) -> Self {
        self.terminal = enabled;
        self
    }

    /// Compose and deliver the completion summary. Persistence failures
    /// surface; sink failures are logged and swallowed.
    pub async fn notify(&self, task: &Task, outcome: &ExecutionOutcome) -> Result<()> {
        let summary = build_summary(task, outcome);

        let dir = self.config.notifications_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| NightshiftError::Notifier(format!("{}: {e}", dir.display())))?;
        let path = self.config.notification_path(&task.task_id);
        std::fs::write(&path, serde_json::to_string_pretty(&summary)?)
            .map_err(|e| NightshiftError::Notifier(format!("{}: {e}", path.display())))?;
        debug!(task_id = %task.task_id, path = %path.display(), "summary persisted");

        if self.terminal {
            println!("{}", render_terminal(&summary));
        }

        self.deliver_to_sink(task, &summary).await;
        Ok(())
    }

    async fn deliver_to_sink(&self, task: &Task, summary: &Summary) {
        let route_path = self.config.route_path(&task.task_id);
        let raw = match std::fs::read_to_string(&route_path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let route: SinkRoute = match serde_json::from_str(&raw) {
            Ok(route) => route,
            Err(e) => {
                warn!(task_id = %task.task_id, "unreadable sink route, skipping: {e}");
                let _ = std::fs::remove_file(&route_path);
                return;
            }
        };

        let mut payload = serde_json::json!({
            "text": render_terminal(summary),
            "summary": summary,
        });
        if let Some(channel) = &route.channel {
            payload["channel"] = serde_json::Value::String(channel.clone());
        }

        match self.http.post(&route.webhook_url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!(task_id = %task.task_id, "summary posted to external sink");
            }
            Ok(response) => {
                warn!(task_id = %task.task_id, status = %response.status(), "sink rejected summary");
            }
            Err(e) => warn!(task_id = %task.task_id, "sink delivery failed: {e}"),
        }
        // Routing metadata is one-shot.
        let _ = std::fs::remove_file(&route_path);
    }
}

/// Assemble a bounded, display-ready summary from the task record and the
/// run outcome.
pub fn build_summary(task: &Task, outcome: &ExecutionOutcome) -> Summary {
    let response_text = outcome
        .response_text
        .clone()
        .or_else(|| response_text_from_artifact(&outcome.result_path));

    Summary {
        task_id: task.task_id.clone(),
        description: truncate_with_marker(&task.description, SUMMARY_DESCRIPTION_LIMIT),
        status: task.status,
        timestamp: Utc::now(),
        execution_time: task.execution_time.or(Some(outcome.execution_time)),
        token_usage: task.token_usage.or(outcome.token_usage),
        file_changes: summarize_file_changes(outcome),
        error_message: task
            .error_message
            .clone()
            .or_else(|| outcome.error_message.clone())
            .map(|m| truncate_with_marker(&m, SUMMARY_ERROR_LIMIT)),
        result_path: Some(outcome.result_path.clone()),
        response_text: response_text
            .filter(|t| !t.is_empty())
            .map(|t| truncate_with_marker(&t, SUMMARY_RESPONSE_LIMIT)),
    }
}

/// Scan a persisted raw-output artifact for the concatenated text deltas.
fn response_text_from_artifact(result_path: &str) -> Option<String> {
    let raw = std::fs::read_to_string(result_path).ok()?;
    let artifact: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let stdout = artifact.get("stdout")?.as_str()?;
    Some(extract_response_text(stdout))
}

fn summarize_file_changes(outcome: &ExecutionOutcome) -> FileChangeSummary {
    let mut summary = FileChangeSummary::default();
    for change in &outcome.file_changes {
        let bucket = match change.kind {
            FileChangeKind::Created => &mut summary.created,
            FileChangeKind::Modified => &mut summary.modified,
            FileChangeKind::Deleted => &mut summary.deleted,
        };
        bucket.push(change.path.clone());
    }
    for bucket in [
        &mut summary.created,
        &mut summary.modified,
        &mut summary.deleted,
    ] {
        if bucket.len() > SUMMARY_FILES_PER_CATEGORY {
            let extra = bucket.len() - SUMMARY_FILES_PER_CATEGORY;
            bucket.truncate(SUMMARY_FILES_PER_CATEGORY);
            bucket.push(format!("and {extra} more"));
        }
    }
    summary
}

fn truncate_with_marker(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(limit).collect();
    truncated.push_str(" [truncated]");
    truncated
}

/// Human-readable rendering for the terminal sink and chat messages.
pub fn render_terminal(summary: &Summary) -> String {
    let mut out = format!(
        "Task {} {}\n  {}\n",
        summary.task_id,
        summary.status.as_str(),
        summary.description
    );
    if let Some(seconds) = summary.execution_time {
        out.push_str(&format!("  execution time: {seconds:.1}s\n"));
    }
    if let Some(tokens) = summary.token_usage {
        out.push_str(&format!("  tokens: {tokens}\n"));
    }
    let files = &summary.file_changes;
    if !files.created.is_empty() {
        out.push_str(&format!("  created: {}\n", files.created.join(", ")));
    }
    if !files.modified.is_empty() {
        out.push_str(&format!("  modified: {}\n", files.modified.join(", ")));
    }
    if !files.deleted.is_empty() {
        out.push_str(&format!("  deleted: {}\n", files.deleted.join(", ")));
    }
    if let Some(error) = &summary.error_message {
        out.push_str(&format!("  error: {error}\n"));
    }
    if let Some(text) = &summary.response_text {
        out.push_str(&format!("  response: {text}\n"));
    }
    out
}
