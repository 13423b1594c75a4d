//! File-based singleton lock for the executor.
//!
//! One executor per data directory: the lock file records the owning PID so
//! CLI and webhook adapters can tell whether (and where) an executor is
//! running. Stale locks from crashed processes are reclaimed.

use crate::{NightshiftError, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct ExecutorLock {
    path: PathBuf,
    pid: u32,
}

impl ExecutorLock {
    /// Take the lock, refusing while another live executor holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(existing) = Self::read(path) {
            if pid_alive(existing) {
                return Err(NightshiftError::Executor {
                    message: format!("executor already running with pid {existing}"),
                });
            }
            warn!(pid = existing, "removing stale executor lock");
            let _ = std::fs::remove_file(path);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| NightshiftError::StorageIo(format!("{}: {e}", parent.display())))?;
        }
        let pid = std::process::id();
        std::fs::write(path, pid.to_string())
            .map_err(|e| NightshiftError::StorageIo(format!("{}: {e}", path.display())))?;
        info!(pid, path = %path.display(), "executor lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    /// PID recorded in the lock file, if any.
    pub fn read(path: &Path) -> Option<u32> {
        let raw = std::fs::read_to_string(path).ok()?;
        raw.trim().parse().ok()
    }
}

impl Drop for ExecutorLock {
    fn drop(&mut self) {
        // Only remove a lock we still own.
        if Self::read(&self.path) == Some(self.pid) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_writes_own_pid_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("executor.pid");
        {
            let _lock = ExecutorLock::acquire(&path).unwrap();
            assert_eq!(ExecutorLock::read(&path), Some(std::process::id()));
        }
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("executor.pid");
        let _lock = ExecutorLock::acquire(&path).unwrap();
        // Our own PID is alive, so a second acquisition must refuse.
        assert!(matches!(
            ExecutorLock::acquire(&path),
            Err(NightshiftError::Executor { .. })
        ));
    }

    #[test]
    fn stale_lock_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("executor.pid");
        // No live process should have this PID (beyond pid_max on Linux).
        std::fs::write(&path, "4999999").unwrap();
        let _lock = ExecutorLock::acquire(&path).unwrap();
        assert_eq!(ExecutorLock::read(&path), Some(std::process::id()));
    }
}
