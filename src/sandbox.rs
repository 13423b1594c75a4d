//! Platform sandbox profile generation.
//!
//! On macOS the agent subprocess runs under `sandbox-exec` with a generated
//! profile that denies filesystem writes outside the task's allow-list. On
//! platforms without a supported sandbox facility generation is a no-op and
//! commands run unwrapped; directory validation still applies everywhere.

use crate::constants::SANDBOX_DENIED_ROOTS;
use crate::{NightshiftError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Reject any allow-list entry that is `/` itself, relative, or equal to or
/// under one of the protected system roots. Warns when the home directory
/// itself is write-allowed.
pub fn validate_directories(directories: &[String]) -> Result<()> {
    let home = dirs::home_dir();
    for raw in directories {
        let path = Path::new(raw);
        if !path.is_absolute() {
            return Err(NightshiftError::DangerousPath(format!(
                "{raw} is not an absolute path"
            )));
        }
        if path == Path::new("/") {
            return Err(NightshiftError::DangerousPath("/".to_string()));
        }
        for root in SANDBOX_DENIED_ROOTS {
            let root_path = Path::new(root);
            if path == root_path || path.starts_with(root_path) {
                return Err(NightshiftError::DangerousPath(raw.clone()));
            }
        }
        if let Some(home) = &home {
            if path == home.as_path() {
                warn!("allowed_directories grants writes to the entire home directory");
            }
        }
    }
    Ok(())
}

/// The write-allow entries a profile grants, before rendering. Sorted so
/// repeated generation yields an identical set.
pub fn write_allow_entries(directories: &[String], needs_git: bool) -> Vec<String> {
    let mut entries: Vec<String> = directories.iter().map(|d| format!("subpath:{d}")).collect();

    entries.push("subpath:/tmp".to_string());
    entries.push("subpath:/private/tmp".to_string());
    entries.push("subpath:/private/var/folders".to_string());

    if let Some(home) = dirs::home_dir() {
        let home = home.display().to_string();
        // Agent-binary configuration and credential files used by external
        // tool servers.
        entries.push(format!("subpath:{home}/.claude"));
        entries.push(format!("literal:{home}/.claude.json"));
        entries.push(format!("subpath:{home}/.nightshift"));
        if needs_git {
            entries.push(format!("subpath:{home}/.config/gh"));
        }
    }
    if needs_git {
        entries.push("literal:/dev/null".to_string());
        entries.push("literal:/dev/tty".to_string());
    }

    entries.sort();
    entries.dedup();
    entries
}

/// Render the sandbox-exec profile text. Deny-by-default, then carve-outs
/// for execution, reads, network, IPC, and the write allow-list.
pub fn render_profile(directories: &[String], needs_git: bool) -> String {
    let mut profile = String::from(
        "(version 1)\n\
         (deny default)\n\
         (allow process-exec*)\n\
         (allow process-fork)\n\
         (allow file-read*)\n\
         (allow file-read-metadata)\n\
         (allow network*)\n\
         (allow mach-lookup)\n\
         (allow sysctl-read)\n\
         (allow ipc-posix-shm)\n\
         (allow signal (target same-sandbox))\n",
    );

    profile.push_str("(allow file-write*\n");
    for entry in write_allow_entries(directories, needs_git) {
        if let Some((kind, path)) = entry.split_once(':') {
            profile.push_str(&format!("    ({kind} \"{path}\")\n"));
        }
    }
    profile.push_str(")\n");

    if needs_git {
        // TLS certificate validation and DNS resolution for git/gh network use.
        profile.push_str(
            "(allow mach-lookup\n\
             \x20   (global-name \"com.apple.SecurityServer\")\n\
             \x20   (global-name \"com.apple.trustd\")\n\
             \x20   (global-name \"com.apple.dnssd.service\")\n\
             \x20   (global-name \"com.apple.nesessionmanager.content-filter\"))\n",
        );
    }

    profile
}

/// A generated profile file. Dropping the guard removes the temp file, so
/// workers hold it for exactly the lifetime of the subprocess.
pub struct SandboxProfile {
    file: Option<NamedTempFile>,
}

impl SandboxProfile {
    /// Validate the allow-list and, on macOS, write the profile to a temp
    /// location. Elsewhere this validates and returns an inert guard.
    pub fn generate(directories: &[String], needs_git: bool) -> Result<Self> {
        validate_directories(directories)?;

        if !sandbox_available() {
            debug!("no sandbox facility on this platform; running unwrapped");
            return Ok(Self { file: None });
        }

        let mut file = NamedTempFile::new()
            .map_err(|e| NightshiftError::StorageIo(format!("sandbox profile: {e}")))?;
        file.write_all(render_profile(directories, needs_git).as_bytes())
            .map_err(|e| NightshiftError::StorageIo(format!("sandbox profile: {e}")))?;
        debug!(path = %file.path().display(), "sandbox profile written");
        Ok(Self { file: Some(file) })
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path())
    }

    /// Wrap `program args...` with the sandbox invocation when a profile
    /// exists; otherwise return the command unchanged.
    pub fn wrap(&self, program: &str, args: Vec<String>) -> (String, Vec<String>) {
        match self.path() {
            Some(profile) => {
                let mut wrapped = vec![
                    "-f".to_string(),
                    profile.display().to_string(),
                    program.to_string(),
                ];
                wrapped.extend(args);
                ("sandbox-exec".to_string(), wrapped)
            }
            None => (program.to_string(), args),
        }
    }
}

fn sandbox_available() -> bool {
    cfg!(target_os = "macos")
}
