//! Process-wide map of live agent subprocesses.
//!
//! Pause/resume/kill requests from adapters are routed through here to the
//! worker that owns the subprocess. A missing entry means the task has no
//! live process in this executor.

use crate::{NightshiftError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Control requests deliverable to a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSignal {
    Pause,
    Resume,
    Kill,
}

#[derive(Debug)]
struct ProcessHandle {
    pid: u32,
    signal_tx: mpsc::UnboundedSender<TaskSignal>,
}

#[derive(Clone, Default)]
pub struct ProcessMap {
    inner: Arc<Mutex<HashMap<String, ProcessHandle>>>,
}

impl ProcessMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly spawned subprocess. The returned guard removes the
    /// entry when the owning worker finishes.
    pub fn register(
        &self,
        task_id: &str,
        pid: u32,
        signal_tx: mpsc::UnboundedSender<TaskSignal>,
    ) -> ProcessMapGuard {
        let mut map = self.lock();
        map.insert(
            task_id.to_string(),
            ProcessHandle { pid, signal_tx },
        );
        debug!(task_id, pid, "process registered");
        ProcessMapGuard {
            map: self.clone(),
            task_id: task_id.to_string(),
        }
    }

    /// Route a control request to the owning worker.
    pub fn signal(&self, task_id: &str, signal: TaskSignal) -> Result<()> {
        let map = self.lock();
        let handle = map
            .get(task_id)
            .ok_or_else(|| NightshiftError::NotRunning(task_id.to_string()))?;
        handle
            .signal_tx
            .send(signal)
            .map_err(|_| NightshiftError::NotRunning(task_id.to_string()))
    }

    pub fn pid_of(&self, task_id: &str) -> Option<u32> {
        self.lock().get(task_id).map(|h| h.pid)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    pub fn active_tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = self.lock().keys().cloned().collect();
        tasks.sort();
        tasks
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Last-resort shutdown path: SIGKILL every live subprocess directly.
    pub fn kill_all(&self) {
        let map = self.lock();
        for (task_id, handle) in map.iter() {
            warn!(task_id, pid = handle.pid, "force-killing subprocess on shutdown");
            kill_pid(handle.pid);
        }
    }

    fn remove(&self, task_id: &str) {
        if self.lock().remove(task_id).is_some() {
            debug!(task_id, "process deregistered");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProcessHandle>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes the owning task's map entry on drop.
pub struct ProcessMapGuard {
    map: ProcessMap,
    task_id: String,
}

impl Drop for ProcessMapGuard {
    fn drop(&mut self) {
        self.map.remove(&self.task_id);
    }
}

#[cfg(unix)]
pub fn kill_pid(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
pub fn kill_pid(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_without_entry_is_not_running() {
        let map = ProcessMap::new();
        let result = map.signal("task_00000000", TaskSignal::Pause);
        assert!(matches!(result, Err(NightshiftError::NotRunning(_))));
    }

    #[test]
    fn register_signal_and_guard_cleanup() {
        let map = ProcessMap::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let _guard = map.register("task_0000abcd", 1234, tx);
            assert_eq!(map.pid_of("task_0000abcd"), Some(1234));
            assert_eq!(map.active_tasks(), vec!["task_0000abcd".to_string()]);

            map.signal("task_0000abcd", TaskSignal::Pause).unwrap();
            map.signal("task_0000abcd", TaskSignal::Kill).unwrap();
            assert_eq!(rx.try_recv().unwrap(), TaskSignal::Pause);
            assert_eq!(rx.try_recv().unwrap(), TaskSignal::Kill);
        }
        assert!(!map.contains("task_0000abcd"));
        assert!(map.is_empty());
    }

    #[test]
    fn closed_receiver_reports_not_running() {
        let map = ProcessMap::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let _guard = map.register("task_0000ffff", 99, tx);
        drop(rx);
        assert!(matches!(
            map.signal("task_0000ffff", TaskSignal::Resume),
            Err(NightshiftError::NotRunning(_))
        ));
    }
}
