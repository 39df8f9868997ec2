//! SQLite-backed task journal.
//! One row per task, upserted on every state change, plus an append-only
//! event log. Lets a restarted daemon pick up where it left off.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use crate::error::{Result, SchedulerError};
use crate::notify::SchedulerEvent;
use crate::tasks::{TaskStatus, TaskView};

/// SQLite-backed persistence store for scheduler tasks and events.
pub struct SchedulerDb {
    conn: rusqlite::Connection,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = rusqlite::Connection::open(path)?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Throwaway database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: rusqlite::Connection::open_in_memory()?,
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS scheduler_tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL DEFAULT 'custom',
                priority TEXT NOT NULL DEFAULT 'normal',
                status TEXT NOT NULL DEFAULT 'pending',
                scheduled_time TEXT NOT NULL,
                created_time TEXT NOT NULL,
                last_run_time TEXT,
                next_run_time TEXT,
                recurring INTEGER NOT NULL DEFAULT 0,
                interval_minutes INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                retry_count INTEGER NOT NULL DEFAULT 0,
                run_count INTEGER NOT NULL DEFAULT 0,
                seq INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'   -- JSON object
            );

            CREATE TABLE IF NOT EXISTS scheduler_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                kind TEXT NOT NULL,               -- task_started, task_failed, ...
                payload TEXT NOT NULL,            -- JSON SchedulerEvent
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_scheduler_events_task ON scheduler_events(task_id);
            ",
        )?;
        Ok(())
    }

    // ─── Tasks ──────────────────────────────────────

    /// Insert or replace a task snapshot.
    pub fn save_task(&self, task: &TaskView) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO scheduler_tasks
             (id, name, description, kind, priority, status, scheduled_time, created_time,
              last_run_time, next_run_time, recurring, interval_minutes, max_retries,
              retry_count, run_count, seq, last_error, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            rusqlite::params![
                task.id,
                task.name,
                task.description,
                task.kind,
                task.priority.as_str(),
                task.status.as_str(),
                task.scheduled_time.to_rfc3339(),
                task.created_time.to_rfc3339(),
                task.last_run_time.map(|t| t.to_rfc3339()),
                task.next_run_time.map(|t| t.to_rfc3339()),
                task.recurring as i32,
                task.interval_minutes,
                task.max_retries,
                task.retry_count,
                task.run_count,
                task.seq as i64,
                task.last_error,
                serde_json::to_string(&task.metadata)?,
            ],
        )?;
        Ok(())
    }

    /// Load every task snapshot in submission order. Corrupt rows are
    /// skipped with a warning.
    pub fn load_tasks(&self) -> Result<Vec<TaskView>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, description, kind, priority, status, scheduled_time, created_time,
                    last_run_time, next_run_time, recurring, interval_minutes, max_retries,
                    retry_count, run_count, seq, last_error, metadata
             FROM scheduler_tasks ORDER BY seq",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(TaskRow {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                kind: row.get(3)?,
                priority: row.get(4)?,
                status: row.get(5)?,
                scheduled_time: row.get(6)?,
                created_time: row.get(7)?,
                last_run_time: row.get(8)?,
                next_run_time: row.get(9)?,
                recurring: row.get(10)?,
                interval_minutes: row.get(11)?,
                max_retries: row.get(12)?,
                retry_count: row.get(13)?,
                run_count: row.get(14)?,
                seq: row.get(15)?,
                last_error: row.get(16)?,
                metadata: row.get(17)?,
            })
        })?;

        let mut tasks = Vec::new();
        for row in rows {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    tracing::warn!("⚠️ Skipping unreadable task row: {e}");
                    continue;
                }
            };
            match row.into_view() {
                Ok(view) => tasks.push(view),
                Err(e) => tracing::warn!("⚠️ Skipping task record: {e}"),
            }
        }
        Ok(tasks)
    }

    /// Keep only the newest `keep` finished tasks. Returns rows deleted.
    pub fn prune_finished_tasks(&self, keep: usize) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM scheduler_tasks
             WHERE status IN ('completed', 'failed', 'cancelled')
               AND id NOT IN (
                   SELECT id FROM scheduler_tasks
                   WHERE status IN ('completed', 'failed', 'cancelled')
                   ORDER BY seq DESC LIMIT ?1
               )",
            [keep as i64],
        )?;
        Ok(n)
    }

    /// Delete a task snapshot.
    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM scheduler_tasks WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    // ─── Events ──────────────────────────────────────

    /// Append a lifecycle event stamped with `at`.
    pub fn record_event(&self, event: &SchedulerEvent, at: DateTime<Utc>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO scheduler_events (task_id, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                event.task_id(),
                event.kind(),
                serde_json::to_string(event)?,
                at.to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Keep only the newest `keep` events. Returns rows deleted.
    pub fn prune_events(&self, keep: usize) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM scheduler_events
             WHERE id NOT IN (SELECT id FROM scheduler_events ORDER BY id DESC LIMIT ?1)",
            [keep as i64],
        )?;
        Ok(n)
    }

    /// Timestamp of the newest event.
    pub fn last_event_time(&self) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT created_at FROM scheduler_events ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|s| parse_time(&s).ok()))
    }

    /// Most recent events, newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<SchedulerEvent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload FROM scheduler_events ORDER BY id DESC LIMIT ?1")?;
        let payloads = stmt
            .query_map([limit as i64], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(payloads
            .iter()
            .filter_map(|p| serde_json::from_str(p).ok())
            .collect())
    }
}

/// Raw column values before parsing.
struct TaskRow {
    id: String,
    name: String,
    description: String,
    kind: String,
    priority: String,
    status: String,
    scheduled_time: String,
    created_time: String,
    last_run_time: Option<String>,
    next_run_time: Option<String>,
    recurring: i64,
    interval_minutes: i64,
    max_retries: i64,
    retry_count: i64,
    run_count: i64,
    seq: i64,
    last_error: Option<String>,
    metadata: String,
}

impl TaskRow {
    fn into_view(self) -> Result<TaskView> {
        let corrupt = |reason: String| SchedulerError::CorruptRecord {
            id: self.id.clone(),
            reason,
        };
        let priority = self.priority.parse().map_err(corrupt)?;
        let status: TaskStatus = self.status.parse().map_err(corrupt)?;
        let scheduled_time = parse_time(&self.scheduled_time).map_err(corrupt)?;
        let created_time = parse_time(&self.created_time).map_err(corrupt)?;
        let last_run_time = parse_opt_time(self.last_run_time.as_deref()).map_err(corrupt)?;
        let next_run_time = parse_opt_time(self.next_run_time.as_deref()).map_err(corrupt)?;
        let metadata = serde_json::from_str(&self.metadata)
            .map_err(|e| corrupt(format!("metadata: {e}")))?;
        let count = |column: &str, value: i64| {
            u32::try_from(value).map_err(|_| corrupt(format!("{column} out of range: {value}")))
        };
        let interval_minutes = count("interval_minutes", self.interval_minutes)?;
        let max_retries = count("max_retries", self.max_retries)?;
        let retry_count = count("retry_count", self.retry_count)?;
        let run_count = count("run_count", self.run_count)?;
        let seq = u64::try_from(self.seq)
            .map_err(|_| corrupt(format!("seq out of range: {}", self.seq)))?;

        Ok(TaskView {
            id: self.id,
            name: self.name,
            description: self.description,
            priority,
            status,
            scheduled_time,
            created_time,
            last_run_time,
            next_run_time,
            recurring: self.recurring != 0,
            interval_minutes,
            max_retries,
            retry_count,
            metadata,
            kind: self.kind,
            seq,
            run_count,
            last_error: self.last_error,
        })
    }
}

fn parse_time(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{s}': {e}"))
}

fn parse_opt_time(s: Option<&str>) -> std::result::Result<Option<DateTime<Utc>>, String> {
    s.map(parse_time).transpose()
}
