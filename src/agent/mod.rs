//! Integration with the headless agent binary.
//!
//! The binary is treated as an opaque subprocess: the planner invokes it in
//! single-shot JSON mode, the runner in streaming mode under the sandbox.

pub mod command_builder;
pub mod planner;
pub mod runner;
pub mod stream;

pub use command_builder::{AgentCommandBuilder, OutputFormat};
pub use planner::Planner;
pub use runner::AgentRunner;

use crate::config::AgentConfig;
use crate::{constants, NightshiftError, Result};
use tracing::{debug, info, warn};

/// Locate the agent binary: explicit configuration first, then common
/// install locations.
pub async fn find_agent_binary(config: &AgentConfig) -> Result<String> {
    if let Some(path) = &config.binary_path {
        return Ok(path.clone());
    }

    let mut candidates = vec!["claude".to_string(), "/usr/local/bin/claude".to_string()];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".local/bin/claude").display().to_string());
    }

    for path in &candidates {
        match tokio::process::Command::new(path)
            .arg("--version")
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                info!("found agent binary at {path}");
                return Ok(path.clone());
            }
            Ok(_) => debug!("binary at {path} exists but --version failed"),
            Err(_) => debug!("no binary at {path}"),
        }
    }

    Err(NightshiftError::Configuration(
        "agent binary not found; set NIGHTSHIFT_AGENT_BINARY".to_string(),
    ))
}

/// Environment adjustments applied to every agent subprocess.
#[derive(Debug, Clone, Default)]
pub struct AgentEnvironment {
    pub remove: Vec<String>,
    pub set: Vec<(String, String)>,
}

/// Build the child environment: strip the conflicting direct-API token,
/// inject the subscription-mode token, and fetch a GitHub token when the
/// task needs git access.
pub async fn prepare_environment(config: &AgentConfig, needs_git: bool) -> Result<AgentEnvironment> {
    let token = config.subscription_token.clone().ok_or_else(|| {
        NightshiftError::Configuration(format!(
            "{} is required to invoke the agent binary",
            constants::SUBSCRIPTION_TOKEN_ENV
        ))
    })?;

    let mut env = AgentEnvironment {
        remove: vec![constants::CONFLICTING_TOKEN_ENV.to_string()],
        set: vec![(constants::SUBSCRIPTION_TOKEN_ENV.to_string(), token)],
    };

    if needs_git {
        match fetch_github_token().await {
            Some(gh_token) => env
                .set
                .push((constants::GIT_TOKEN_ENV.to_string(), gh_token)),
            None => warn!("needs_git set but no GitHub token available from gh"),
        }
    }

    Ok(env)
}

async fn fetch_github_token() -> Option<String> {
    let output = tokio::process::Command::new("gh")
        .args(["auth", "token"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!token.is_empty()).then_some(token)
}
