//! Fluent construction of agent-binary invocations.

use super::AgentEnvironment;
use crate::sandbox::SandboxProfile;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// How the agent binary reports results on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// One JSON document after completion; used for planning.
    Json,
    /// Newline-delimited JSON events; used for execution.
    StreamJson,
}

impl OutputFormat {
    fn as_flag(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::StreamJson => "stream-json",
        }
    }
}

/// Builder for one subprocess invocation. The prompt travels as the final
/// positional argument; stdin stays closed.
#[derive(Debug, Clone)]
pub struct AgentCommandBuilder {
    binary_path: String,
    output_format: OutputFormat,
    prompt: Option<String>,
    system_prompt: Option<String>,
    allowed_tools: Vec<String>,
    tool_config: Option<PathBuf>,
    additional_dirs: Vec<PathBuf>,
    working_dir: Option<PathBuf>,
}

impl AgentCommandBuilder {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            output_format: OutputFormat::Json,
            prompt: None,
            system_prompt: None,
            allowed_tools: Vec::new(),
            tool_config: None,
            additional_dirs: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        if !prompt.is_empty() {
            self.system_prompt = Some(prompt);
        }
        self
    }

    pub fn with_allowed_tools(mut self, tools: &[String]) -> Self {
        self.allowed_tools = tools.to_vec();
        self
    }

    pub fn with_tool_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.tool_config = Some(path.into());
        self
    }

    pub fn add_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.additional_dirs.push(path.into());
        self
    }

    pub fn with_working_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(path.into());
        self
    }

    /// Argument vector for the bare (unwrapped) invocation.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            self.output_format.as_flag().to_string(),
        ];
        if self.output_format == OutputFormat::StreamJson {
            args.push("--verbose".to_string());
        }
        if let Some(system_prompt) = &self.system_prompt {
            args.push("--system-prompt".to_string());
            args.push(system_prompt.clone());
        }
        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.allowed_tools.join(","));
        }
        if let Some(tool_config) = &self.tool_config {
            args.push("--mcp-config".to_string());
            args.push(tool_config.display().to_string());
        }
        for dir in &self.additional_dirs {
            args.push("--add-dir".to_string());
            args.push(dir.display().to_string());
        }
        if let Some(prompt) = &self.prompt {
            args.push(prompt.clone());
        }
        args
    }

    /// Assemble the final [`Command`]: sandbox wrapping, environment edits,
    /// working directory, and piped stdio.
    pub fn command(
        &self,
        sandbox: &SandboxProfile,
        env: &AgentEnvironment,
        working_dir_override: Option<&Path>,
    ) -> Command {
        let (program, args) = sandbox.wrap(&self.binary_path, self.build_args());
        let mut command = Command::new(program);
        command.args(args);
        for name in &env.remove {
            command.env_remove(name);
        }
        for (name, value) in &env.set {
            command.env(name, value);
        }
        if let Some(dir) = working_dir_override.or(self.working_dir.as_deref()) {
            command.current_dir(dir);
        }
        // Own process group, so pause/kill signals reach the binary's
        // children as well and never strand the stdio pipes.
        #[cfg(unix)]
        command.process_group(0);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}
