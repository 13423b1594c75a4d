//! Durable task store on a single-file SQLite database.
//!
//! Holds the `tasks` table and the append-only `task_logs` audit trail.
//! All mutators route through here; the exclusive-transaction protocol in
//! [`TaskStore::acquire_for_execution`] is what makes concurrent workers
//! safe.

use crate::models::{LogLevel, Task, TaskLogEntry, TaskStatus};
use crate::{constants, NightshiftError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    task_id             TEXT PRIMARY KEY,
    description         TEXT NOT NULL,
    status              TEXT NOT NULL,
    allowed_tools       TEXT NOT NULL DEFAULT '[]',
    allowed_directories TEXT NOT NULL DEFAULT '[]',
    needs_git           INTEGER NOT NULL DEFAULT 0,
    system_prompt       TEXT,
    estimated_tokens    INTEGER,
    estimated_time      INTEGER,
    timeout_seconds     INTEGER NOT NULL,
    process_id          INTEGER,
    result_path         TEXT,
    token_usage         INTEGER,
    execution_time      REAL,
    error_message       TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    started_at          TEXT,
    completed_at        TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_status_created
    ON tasks (status, created_at);
CREATE TABLE IF NOT EXISTS task_logs (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id   TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    level     TEXT NOT NULL,
    message   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs (task_id);
";

/// Optional fields persisted together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusFields {
    pub result_path: Option<String>,
    pub token_usage: Option<u64>,
    pub execution_time: Option<f64>,
    pub error_message: Option<String>,
}

/// Shared handle over the embedded database. Cloning is cheap; all clones
/// serialize on the same connection.
#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    /// Open (and migrate) the database at `path`, creating parent
    /// directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| NightshiftError::StorageIo(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout={};
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
            constants::DB_BUSY_TIMEOUT_MS
        ))?;
        Ok(())
    }

    /// Insert a new task. Duplicate identifiers are rejected by the
    /// primary-key constraint.
    pub fn create(&self, task: &Task) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tasks (task_id, description, status, allowed_tools,
                allowed_directories, needs_git, system_prompt, estimated_tokens,
                estimated_time, timeout_seconds, process_id, result_path,
                token_usage, execution_time, error_message, created_at,
                updated_at, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                task.task_id,
                task.description,
                task.status.as_str(),
                serde_json::to_string(&task.allowed_tools)?,
                serde_json::to_string(&task.allowed_directories)?,
                task.needs_git as i64,
                task.system_prompt,
                task.estimated_tokens.map(|v| v as i64),
                task.estimated_time.map(|v| v as i64),
                task.timeout_seconds as i64,
                task.process_id.map(|v| v as i64),
                task.result_path,
                task.token_usage.map(|v| v as i64),
                task.execution_time,
                task.error_message,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
                task.started_at.map(|t| t.to_rfc3339()),
                task.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        debug!(task_id = %task.task_id, "task created");
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.lock();
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
                params![task_id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    /// All tasks, newest first, optionally restricted to one status.
    pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut tasks = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1
                     ORDER BY created_at DESC, rowid DESC"
                ))?;
                let rows = stmt.query_map(params![status.as_str()], row_to_task)?;
                for row in rows {
                    tasks.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     ORDER BY created_at DESC, rowid DESC"
                ))?;
                let rows = stmt.query_map([], row_to_task)?;
                for row in rows {
                    tasks.push(row?);
                }
            }
        }
        Ok(tasks)
    }

    /// Persist plan-derived fields. Only STAGED tasks may be re-planned.
    pub fn update_plan(&self, task_id: &str, task: &Task) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let status = current_status(&tx, task_id)?;
        if status != TaskStatus::Staged {
            return Err(NightshiftError::InvalidPlan(format!(
                "task {task_id} is {status}, plans may only change while staged"
            )));
        }
        tx.execute(
            "UPDATE tasks SET description = ?1, allowed_tools = ?2,
                allowed_directories = ?3, needs_git = ?4, system_prompt = ?5,
                estimated_tokens = ?6, estimated_time = ?7, updated_at = ?8
             WHERE task_id = ?9",
            params![
                task.description,
                serde_json::to_string(&task.allowed_tools)?,
                serde_json::to_string(&task.allowed_directories)?,
                task.needs_git as i64,
                task.system_prompt,
                task.estimated_tokens.map(|v| v as i64),
                task.estimated_time.map(|v| v as i64),
                Utc::now().to_rfc3339(),
                task_id,
            ],
        )?;
        tx.commit()?;
        debug!(task_id, "plan updated");
        Ok(())
    }

    /// Move a task along the transition graph, maintaining the timestamp and
    /// process-id invariants. Disallowed edges fail without touching the row.
    pub fn update_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        fields: StatusFields,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = current_status(&tx, task_id)?;
        if !current.can_transition_to(new_status) {
            return Err(NightshiftError::InvalidTransition {
                task_id: task_id.to_string(),
                from: current.as_str().to_string(),
                to: new_status.as_str().to_string(),
            });
        }

        let now = Utc::now().to_rfc3339();
        let started_at = if new_status == TaskStatus::Running {
            Some(now.clone())
        } else {
            None
        };
        let completed_at = if new_status.is_terminal() {
            Some(now.clone())
        } else {
            None
        };
        let clear_pid = !matches!(new_status, TaskStatus::Running | TaskStatus::Paused);

        tx.execute(
            "UPDATE tasks SET
                status = ?1,
                updated_at = ?2,
                started_at = COALESCE(started_at, ?3),
                completed_at = COALESCE(?4, completed_at),
                process_id = CASE WHEN ?5 THEN NULL ELSE process_id END,
                result_path = COALESCE(?6, result_path),
                token_usage = COALESCE(?7, token_usage),
                execution_time = COALESCE(?8, execution_time),
                error_message = COALESCE(?9, error_message)
             WHERE task_id = ?10",
            params![
                new_status.as_str(),
                now,
                started_at,
                completed_at,
                clear_pid,
                fields.result_path,
                fields.token_usage.map(|v| v as i64),
                fields.execution_time,
                fields.error_message,
                task_id,
            ],
        )?;
        tx.commit()?;
        debug!(task_id, from = %current, to = %new_status, "status updated");
        Ok(())
    }

    /// Record the live subprocess PID for a RUNNING or PAUSED task.
    pub fn set_process_id(&self, task_id: &str, pid: Option<u32>) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE tasks SET process_id = ?1, updated_at = ?2
             WHERE task_id = ?3 AND status IN ('running', 'paused')",
            params![pid.map(|v| v as i64), Utc::now().to_rfc3339(), task_id],
        )?;
        if changed == 0 {
            return Err(NightshiftError::NotFound(format!(
                "{task_id} (not running)"
            )));
        }
        Ok(())
    }

    /// Atomically claim the oldest COMMITTED task for execution.
    ///
    /// The exclusive transaction guarantees two concurrent workers can never
    /// claim the same row: the second worker blocks on the lock and then
    /// observes the first worker's RUNNING update.
    pub fn acquire_for_execution(&self) -> Result<Option<Task>> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        let task_id: Option<String> = tx
            .query_row(
                "SELECT task_id FROM tasks WHERE status = 'committed'
                 ORDER BY created_at ASC, rowid ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(task_id) = task_id else {
            return Ok(None);
        };

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE tasks SET status = 'running', started_at = ?1, updated_at = ?1
             WHERE task_id = ?2",
            params![now, task_id],
        )?;
        let task = tx.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
            params![task_id],
            row_to_task,
        )?;
        tx.commit()?;
        debug!(task_id = %task.task_id, "task acquired for execution");
        Ok(Some(task))
    }

    pub fn count_by_status(&self, status: TaskStatus) -> Result<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Append to the audit trail. Failures are non-fatal and swallowed.
    pub fn append_log(&self, task_id: &str, level: LogLevel, message: &str) {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO task_logs (task_id, timestamp, level, message)
             VALUES (?1, ?2, ?3, ?4)",
            params![task_id, Utc::now().to_rfc3339(), level.as_str(), message],
        );
        if let Err(e) = result {
            warn!(task_id, "failed to append task log: {e}");
        }
    }

    pub fn get_logs(&self, task_id: &str) -> Result<Vec<TaskLogEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT task_id, timestamp, level, message FROM task_logs
             WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (task_id, timestamp, level, message) = row?;
            entries.push(TaskLogEntry {
                task_id,
                timestamp: parse_timestamp(&timestamp)?,
                level: level
                    .parse()
                    .map_err(|e: String| NightshiftError::StorageIo(e))?,
                message,
            });
        }
        Ok(entries)
    }

    /// Truncate both tables. Front-end clear-all hook; records are otherwise
    /// never deleted.
    pub fn clear_all(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM task_logs", [])?;
        conn.execute("DELETE FROM tasks", [])?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            // A panic while holding the lock leaves SQLite itself intact.
            poisoned.into_inner()
        })
    }
}

const TASK_COLUMNS: &str = "task_id, description, status, allowed_tools,
    allowed_directories, needs_git, system_prompt, estimated_tokens,
    estimated_time, timeout_seconds, process_id, result_path, token_usage,
    execution_time, error_message, created_at, updated_at, started_at,
    completed_at";

fn current_status(conn: &Connection, task_id: &str) -> Result<TaskStatus> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM tasks WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()?;
    match status {
        Some(raw) => raw
            .parse()
            .map_err(|e: String| NightshiftError::StorageIo(e)),
        None => Err(NightshiftError::NotFound(task_id.to_string())),
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| NightshiftError::StorageIo(format!("bad timestamp {raw}: {e}")))
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let tools_json: String = row.get(3)?;
    let dirs_json: String = row.get(4)?;
    let status_raw: String = row.get(2)?;
    let created_raw: String = row.get(15)?;
    let updated_raw: String = row.get(16)?;
    let started_raw: Option<String> = row.get(17)?;
    let completed_raw: Option<String> = row.get(18)?;

    let invalid = |msg: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            msg.into(),
        )
    };

    Ok(Task {
        task_id: row.get(0)?,
        description: row.get(1)?,
        status: status_raw.parse().map_err(invalid)?,
        allowed_tools: serde_json::from_str(&tools_json)
            .map_err(|e| invalid(e.to_string()))?,
        allowed_directories: serde_json::from_str(&dirs_json)
            .map_err(|e| invalid(e.to_string()))?,
        needs_git: row.get::<_, i64>(5)? != 0,
        system_prompt: row.get(6)?,
        estimated_tokens: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
        estimated_time: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
        timeout_seconds: row.get::<_, i64>(9)? as u64,
        process_id: row.get::<_, Option<i64>>(10)?.map(|v| v as u32),
        result_path: row.get(11)?,
        token_usage: row.get::<_, Option<i64>>(12)?.map(|v| v as u64),
        execution_time: row.get(13)?,
        error_message: row.get(14)?,
        created_at: parse_rfc3339(&created_raw).map_err(invalid)?,
        updated_at: parse_rfc3339(&updated_raw).map_err(invalid)?,
        started_at: started_raw
            .as_deref()
            .map(parse_rfc3339)
            .transpose()
            .map_err(invalid)?,
        completed_at: completed_raw
            .as_deref()
            .map(parse_rfc3339)
            .transpose()
            .map_err(invalid)?,
    })
}

fn parse_rfc3339(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp {raw}: {e}"))
}
