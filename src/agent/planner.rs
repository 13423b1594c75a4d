//! Planning-mode invocation of the agent binary.
//!
//! A single-shot subprocess turns a natural-language request into a
//! structured [`Plan`]. The binary's structured-output behavior varies by
//! version, so the response parser accepts three shapes, tried in order:
//! a `structured_output` envelope, a `result` string (possibly inside a
//! Markdown code fence), or the raw stdout as JSON.

use super::{find_agent_binary, prepare_environment, AgentCommandBuilder, OutputFormat};
use crate::config::AgentConfig;
use crate::models::{Plan, Task};
use crate::sandbox::SandboxProfile;
use crate::toolconfig::ToolRegistry;
use crate::{NightshiftError, Result};
use serde_json::Value;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

pub struct Planner {
    config: AgentConfig,
    registry: ToolRegistry,
}

impl Planner {
    pub fn new(config: AgentConfig, registry: ToolRegistry) -> Self {
        Self { config, registry }
    }

    /// Produce a plan for a fresh request.
    pub async fn plan(&self, description: &str) -> Result<Plan> {
        let prompt = self.build_planning_prompt(description, None);
        self.invoke(prompt).await
    }

    /// Revise an existing plan using reviewer feedback. The previous plan is
    /// included so the binary revises rather than starts over.
    pub async fn revise(&self, task: &Task, feedback: &str) -> Result<Plan> {
        let previous = Plan {
            enhanced_prompt: task.description.clone(),
            allowed_tools: task.allowed_tools.clone(),
            allowed_directories: task.allowed_directories.clone(),
            needs_git: task.needs_git,
            system_prompt: task.system_prompt.clone().unwrap_or_default(),
            estimated_tokens: task.estimated_tokens,
            estimated_time: task.estimated_time,
        };
        let context = format!(
            "Previous plan:\n{}\n\nReviewer feedback:\n{feedback}",
            serde_json::to_string_pretty(&previous)?
        );
        let prompt = self.build_planning_prompt(&task.description, Some(&context));
        self.invoke(prompt).await
    }

    async fn invoke(&self, prompt: String) -> Result<Plan> {
        let binary = find_agent_binary(&self.config).await?;
        let env = prepare_environment(&self.config, false).await?;
        // Planning writes nothing; run it unwrapped.
        let sandbox = SandboxProfile::generate(&[], false)?;

        let mut command = AgentCommandBuilder::new(binary)
            .with_output_format(OutputFormat::Json)
            .with_prompt(prompt)
            .command(&sandbox, &env, None);

        let seconds = self.config.planner_timeout_seconds;
        let started = std::time::Instant::now();
        let child = command
            .spawn()
            .map_err(|e| NightshiftError::LaunchFailed(format!("planner subprocess: {e}")))?;

        // kill_on_drop reaps the subprocess when the timeout drops the future.
        let output = match timeout(Duration::from_secs(seconds), child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| NightshiftError::LaunchFailed(format!("planner wait: {e}")))?
            }
            Err(_) => return Err(NightshiftError::PlannerTimeout { seconds }),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NightshiftError::InvalidPlan(format!(
                "planner exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let plan = parse_plan_response(&stdout)?;
        self.registry.validate_tools(&plan.allowed_tools)?;
        info!(
            tools = plan.allowed_tools.len(),
            directories = plan.allowed_directories.len(),
            elapsed = ?started.elapsed(),
            "plan produced"
        );
        Ok(plan)
    }

    fn build_planning_prompt(&self, description: &str, revision_context: Option<&str>) -> String {
        let mut prompt = format!(
            "You are the planning stage of an overnight task automation system. \
             Convert the user's request into an execution plan.\n\n\
             Request:\n{description}\n\n\
             {}\n\
             Respond with a single JSON object with exactly these fields:\n\
             - enhanced_prompt (string): the request, enriched with concrete instructions\n\
             - allowed_tools (array of strings): tool identifiers the run may use; \
               external server operations as ext__<server>__<operation>\n\
             - allowed_directories (array of strings): absolute paths the run may write to; \
               empty array for read-only work\n\
             - needs_git (boolean): whether the run pushes to git or GitHub\n\
             - system_prompt (string): preamble for the execution run\n\
             - estimated_tokens (integer): rough token estimate\n\
             - estimated_time (integer): rough seconds estimate\n",
            self.registry.describe_for_prompt(),
        );
        if let Some(context) = revision_context {
            prompt.push('\n');
            prompt.push_str(context);
        }
        prompt
    }
}

/// Parse a planning response, accepting all three known shapes in order.
pub fn parse_plan_response(stdout: &str) -> Result<Plan> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(NightshiftError::InvalidPlan("empty planner output".to_string()));
    }

    let outer: Value = serde_json::from_str(trimmed)
        .map_err(|e| NightshiftError::InvalidPlan(format!("planner output is not JSON: {e}")))?;

    // Shape 1: {"structured_output": {...plan...}}
    if let Some(structured) = outer.get("structured_output") {
        debug!("plan parsed from structured_output envelope");
        return plan_from_value(structured.clone());
    }

    // Shape 2: {"result": "...json, possibly fenced..."}
    if let Some(result) = outer.get("result").and_then(Value::as_str) {
        let inner = strip_code_fences(result);
        let value: Value = serde_json::from_str(inner).map_err(|e| {
            NightshiftError::InvalidPlan(format!("result field is not JSON: {e}"))
        })?;
        debug!("plan parsed from result string");
        return plan_from_value(value);
    }

    // Shape 3: the raw stdout is the plan itself.
    plan_from_value(outer)
}

fn plan_from_value(value: Value) -> Result<Plan> {
    if value.get("allowed_directories").is_none()
        || value.get("allowed_directories") == Some(&Value::Null)
    {
        return Err(NightshiftError::InvalidPlan(
            "plan is missing allowed_directories (use [] for read-only plans)".to_string(),
        ));
    }
    serde_json::from_value(value)
        .map_err(|e| NightshiftError::InvalidPlan(format!("missing required field: {e}")))
}

/// Remove a surrounding Markdown code fence (``` or ```json) if present.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string ("json", "JSON", ...) up to the first newline.
    let body = match rest.split_once('\n') {
        Some((_info, body)) => body,
        None => return trimmed,
    };
    body.trim_end()
        .strip_suffix("```")
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN_JSON: &str = r#"{
        "enhanced_prompt": "write a haiku about dusk into haiku.md",
        "allowed_tools": ["Write"],
        "allowed_directories": ["/tmp/work"],
        "needs_git": false,
        "system_prompt": "be brief",
        "estimated_tokens": 500,
        "estimated_time": 30
    }"#;

    fn expected_plan() -> Plan {
        Plan {
            enhanced_prompt: "write a haiku about dusk into haiku.md".to_string(),
            allowed_tools: vec!["Write".to_string()],
            allowed_directories: vec!["/tmp/work".to_string()],
            needs_git: false,
            system_prompt: "be brief".to_string(),
            estimated_tokens: Some(500),
            estimated_time: Some(30),
        }
    }

    #[test]
    fn structured_output_shape() {
        let stdout = format!(r#"{{"type":"result","structured_output":{PLAN_JSON}}}"#);
        assert_eq!(parse_plan_response(&stdout).unwrap(), expected_plan());
    }

    #[test]
    fn result_string_shape() {
        let envelope = serde_json::json!({ "type": "result", "result": PLAN_JSON });
        let stdout = serde_json::to_string(&envelope).unwrap();
        assert_eq!(parse_plan_response(&stdout).unwrap(), expected_plan());
    }

    #[test]
    fn fenced_result_string_shape() {
        for fence in ["```", "```json"] {
            let fenced = format!("{fence}\n{PLAN_JSON}\n```");
            let envelope = serde_json::json!({ "result": fenced });
            let stdout = serde_json::to_string(&envelope).unwrap();
            assert_eq!(
                parse_plan_response(&stdout).unwrap(),
                expected_plan(),
                "fence {fence} failed"
            );
        }
    }

    #[test]
    fn raw_stdout_shape() {
        assert_eq!(parse_plan_response(PLAN_JSON).unwrap(), expected_plan());
    }

    #[test]
    fn all_shapes_agree() {
        let raw = parse_plan_response(PLAN_JSON).unwrap();
        let structured = parse_plan_response(&format!(
            r#"{{"structured_output":{PLAN_JSON}}}"#
        ))
        .unwrap();
        let result = parse_plan_response(
            &serde_json::to_string(&serde_json::json!({ "result": PLAN_JSON })).unwrap(),
        )
        .unwrap();
        assert_eq!(raw, structured);
        assert_eq!(raw, result);
    }

    #[test]
    fn missing_allowed_directories_rejected() {
        let stdout = r#"{"enhanced_prompt":"x","allowed_tools":["Write"]}"#;
        assert!(matches!(
            parse_plan_response(stdout),
            Err(NightshiftError::InvalidPlan(_))
        ));
        let stdout = r#"{"enhanced_prompt":"x","allowed_tools":[],"allowed_directories":null}"#;
        assert!(matches!(
            parse_plan_response(stdout),
            Err(NightshiftError::InvalidPlan(_))
        ));
    }

    #[test]
    fn empty_directories_means_read_only() {
        let stdout = r#"{"enhanced_prompt":"x","allowed_tools":[],"allowed_directories":[]}"#;
        let plan = parse_plan_response(stdout).unwrap();
        assert!(plan.allowed_directories.is_empty());
    }

    #[test]
    fn non_json_rejected() {
        assert!(matches!(
            parse_plan_response("I cannot plan this"),
            Err(NightshiftError::InvalidPlan(_))
        ));
        assert!(matches!(
            parse_plan_response(""),
            Err(NightshiftError::InvalidPlan(_))
        ));
    }

    #[test]
    fn fence_stripping() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }
}
