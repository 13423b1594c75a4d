use crate::{constants, NightshiftError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Runtime configuration, loaded once from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub executor: ExecutorConfig,
    pub agent: AgentConfig,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub max_workers: usize,
    pub poll_interval_secs: f64,
    pub auto_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Explicit agent binary path; when unset the runner probes PATH.
    pub binary_path: Option<String>,
    pub default_timeout_seconds: u64,
    pub planner_timeout_seconds: u64,
    /// Subscription-mode token handed to agent subprocesses.
    pub subscription_token: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        // A missing .env file is fine; explicit environment always wins.
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("loaded .env from {}", path.display()),
            Err(_) => tracing::debug!("no .env file found"),
        }

        let data_dir = match env::var("NIGHTSHIFT_HOME") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => dirs::home_dir()
                .ok_or_else(|| {
                    NightshiftError::Configuration(
                        "cannot resolve home directory; set NIGHTSHIFT_HOME".to_string(),
                    )
                })?
                .join(".nightshift"),
        };

        let max_workers = parse_env("NIGHTSHIFT_MAX_WORKERS", constants::DEFAULT_MAX_WORKERS)?;
        if max_workers == 0 {
            return Err(NightshiftError::Configuration(
                "NIGHTSHIFT_MAX_WORKERS must be at least 1".to_string(),
            ));
        }

        let poll_interval_secs = parse_env(
            "NIGHTSHIFT_POLL_INTERVAL",
            constants::DEFAULT_POLL_INTERVAL_SECS,
        )?;
        if poll_interval_secs <= 0.0 {
            return Err(NightshiftError::Configuration(
                "NIGHTSHIFT_POLL_INTERVAL must be positive".to_string(),
            ));
        }

        let executor = ExecutorConfig {
            max_workers,
            poll_interval_secs,
            auto_start: parse_env("NIGHTSHIFT_AUTO_START", true)?,
        };

        let subscription_token = env::var(constants::SUBSCRIPTION_TOKEN_ENV)
            .ok()
            .filter(|token| !token.trim().is_empty());

        let agent = AgentConfig {
            binary_path: env::var("NIGHTSHIFT_AGENT_BINARY")
                .ok()
                .filter(|p| !p.trim().is_empty()),
            default_timeout_seconds: parse_env(
                "NIGHTSHIFT_TASK_TIMEOUT",
                constants::DEFAULT_TASK_TIMEOUT_SECS,
            )?,
            planner_timeout_seconds: parse_env(
                "NIGHTSHIFT_PLANNER_TIMEOUT",
                constants::DEFAULT_PLANNER_TIMEOUT_SECS,
            )?,
            subscription_token,
        };

        Ok(Config {
            executor,
            agent,
            data_dir,
        })
    }

    /// Ensure the on-disk data layout exists.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.database_dir(),
            self.logs_dir(),
            self.output_dir(),
            self.notifications_dir(),
            self.config_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| NightshiftError::StorageIo(format!("{}: {e}", dir.display())))?;
        }
        Ok(())
    }

    pub fn database_dir(&self) -> PathBuf {
        self.data_dir.join("database")
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_dir().join("nightshift.db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("output")
    }

    pub fn notifications_dir(&self) -> PathBuf {
        self.data_dir.join("notifications")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.data_dir.join("config")
    }

    pub fn tool_registry_path(&self) -> PathBuf {
        self.config_dir().join("tool_servers.json")
    }

    pub fn executor_lock_path(&self) -> PathBuf {
        self.data_dir.join("executor.pid")
    }

    pub fn output_artifact_path(&self, task_id: &str) -> PathBuf {
        self.output_dir().join(format!("{task_id}_output.json"))
    }

    pub fn files_artifact_path(&self, task_id: &str) -> PathBuf {
        self.output_dir().join(format!("{task_id}_files.json"))
    }

    pub fn notification_path(&self, task_id: &str) -> PathBuf {
        self.notifications_dir()
            .join(format!("{task_id}_notification.json"))
    }

    pub fn route_path(&self, task_id: &str) -> PathBuf {
        self.notifications_dir().join(format!("{task_id}_route.json"))
    }

    /// Configuration rooted at an arbitrary directory, for tests.
    pub fn test_config(data_dir: &Path) -> Self {
        Config {
            executor: ExecutorConfig {
                max_workers: constants::DEFAULT_MAX_WORKERS,
                poll_interval_secs: 0.05,
                auto_start: false,
            },
            agent: AgentConfig {
                binary_path: None,
                default_timeout_seconds: constants::DEFAULT_TASK_TIMEOUT_SECS,
                planner_timeout_seconds: constants::DEFAULT_PLANNER_TIMEOUT_SECS,
                subscription_token: Some("test-token".to_string()),
            },
            data_dir: data_dir.to_path_buf(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
            NightshiftError::Configuration(format!("invalid value for {name}: {raw}"))
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests;
