//! Durable backing stores.
//!
//! A store is owned by the queue's writer thread and only ever written
//! from there, in acceptance order. Reads happen once, at startup, to
//! rebuild the in-memory pending set.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{Error, Result};
use crate::model::*;

/// Everything a store holds, as loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Non-terminal tasks, by id.
    pub tasks: Vec<PendingTask>,
    /// Dead-lettered tasks, by id.
    pub dead: Vec<PendingTask>,
    /// Recorded errors, oldest first.
    pub errors: Vec<TaskError>,
    /// Highest task id ever issued. Ids are never reused.
    pub last_task_id: i64,
    pub last_error_id: i64,
}

/// A backing store for accepted tasks.
///
/// Writes must be idempotent: the writer retries failed operations.
pub trait Store: Send {
    /// Load persisted state. Tasks left `running` by a crash come back `queued`.
    fn load(&mut self) -> Result<Snapshot>;

    fn insert_task(&mut self, task: &PendingTask) -> Result<()>;

    /// Persist a task's state, attempts and update time.
    fn update_task(&mut self, task: &PendingTask) -> Result<()>;

    /// Remove a task and its recorded errors.
    fn delete_task(&mut self, id: TaskId) -> Result<()>;

    fn insert_error(&mut self, error: &TaskError) -> Result<()>;

    fn delete_errors(&mut self, task_id: TaskId) -> Result<()>;

    /// Remove everything. Id sequences are kept.
    fn clear(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite store. WAL mode, AUTOINCREMENT ids so deleted ids stay retired.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&mut self) -> Result<()> {
        // WAL mode for concurrent readers
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS pending_tasks (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                tag             TEXT NOT NULL,
                data_id         TEXT,
                group_id        TEXT,
                manually_run    INTEGER NOT NULL DEFAULT 0,
                params          TEXT NOT NULL DEFAULT 'null',
                state           TEXT NOT NULL DEFAULT 'queued',
                attempts        INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tag_data ON pending_tasks(tag, data_id)
                WHERE data_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_group ON pending_tasks(group_id)
                WHERE group_id IS NOT NULL;

            CREATE TABLE IF NOT EXISTS task_errors (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id     INTEGER NOT NULL REFERENCES pending_tasks(id) ON DELETE CASCADE,
                message     TEXT,
                error_id    TEXT,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_errors_task ON task_errors(task_id);
            ",
        )?;

        Ok(())
    }

    fn last_id(&self, table: &str) -> Result<i64> {
        let seq: Option<i64> = self
            .conn
            .query_row(
                "SELECT seq FROM sqlite_sequence WHERE name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.unwrap_or(0))
    }
}

impl Store for SqliteStore {
    fn load(&mut self) -> Result<Snapshot> {
        self.conn.execute(
            "UPDATE pending_tasks SET state = 'queued' WHERE state = 'running'",
            [],
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT id, tag, data_id, group_id, manually_run, params, state, attempts, created_at, updated_at
             FROM pending_tasks ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok(row_to_task(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut snapshot = Snapshot::default();
        for row in rows {
            let task = row.map_err(|e| Error::Other(format!("failed to parse task: {e}")))?;
            match task.state {
                State::Dead => snapshot.dead.push(task),
                State::Completed => {}
                _ => snapshot.tasks.push(task),
            }
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, message, error_id, created_at FROM task_errors ORDER BY id ASC",
        )?;
        snapshot.errors = stmt
            .query_map([], |row| {
                Ok(TaskError {
                    id: row.get(0)?,
                    task_id: TaskId(row.get(1)?),
                    message: row.get(2)?,
                    error_id: row.get(3)?,
                    created_at: parse_time(&row.get::<_, String>(4)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        snapshot.last_task_id = self.last_id("pending_tasks")?;
        snapshot.last_error_id = self.last_id("task_errors")?;

        Ok(snapshot)
    }

    fn insert_task(&mut self, task: &PendingTask) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO pending_tasks (
                id, tag, data_id, group_id, manually_run, params, state, attempts,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                task.id.0,
                task.tag,
                task.data_id,
                task.group_id,
                task.manually_run,
                serde_json::to_string(&task.params).unwrap_or_else(|_| "null".to_string()),
                task.state.to_string(),
                task.attempts,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn update_task(&mut self, task: &PendingTask) -> Result<()> {
        self.conn.execute(
            "UPDATE pending_tasks SET state = ?1, attempts = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                task.state.to_string(),
                task.attempts,
                task.updated_at.to_rfc3339(),
                task.id.0,
            ],
        )?;
        Ok(())
    }

    fn delete_task(&mut self, id: TaskId) -> Result<()> {
        // Errors go with it via ON DELETE CASCADE.
        self.conn
            .execute("DELETE FROM pending_tasks WHERE id = ?1", params![id.0])?;
        Ok(())
    }

    fn insert_error(&mut self, error: &TaskError) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO task_errors (id, task_id, message, error_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                error.id,
                error.task_id.0,
                error.message,
                error.error_id,
                error.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn delete_errors(&mut self, task_id: TaskId) -> Result<()> {
        self.conn
            .execute("DELETE FROM task_errors WHERE task_id = ?1", params![task_id.0])?;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.conn
            .execute_batch("DELETE FROM task_errors; DELETE FROM pending_tasks;")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Store without durability. Clones share the same contents, so a test can
/// keep one clone to inspect what the writer applied.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryContents>>,
}

#[derive(Debug, Default)]
struct MemoryContents {
    tasks: BTreeMap<TaskId, PendingTask>,
    errors: Vec<TaskError>,
    last_task_id: i64,
    last_error_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks currently stored, by id.
    pub fn tasks(&self) -> Vec<PendingTask> {
        self.contents().tasks.values().cloned().collect()
    }

    pub fn errors(&self) -> Vec<TaskError> {
        self.contents().errors.clone()
    }

    fn contents(&self) -> std::sync::MutexGuard<'_, MemoryContents> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for MemoryStore {
    fn load(&mut self) -> Result<Snapshot> {
        let mut contents = self.contents();
        let mut snapshot = Snapshot {
            errors: contents.errors.clone(),
            last_task_id: contents.last_task_id,
            last_error_id: contents.last_error_id,
            ..Snapshot::default()
        };
        for task in contents.tasks.values_mut() {
            if task.state == State::Running {
                task.state = State::Queued;
            }
            match task.state {
                State::Dead => snapshot.dead.push(task.clone()),
                State::Completed => {}
                _ => snapshot.tasks.push(task.clone()),
            }
        }
        Ok(snapshot)
    }

    fn insert_task(&mut self, task: &PendingTask) -> Result<()> {
        let mut contents = self.contents();
        contents.last_task_id = contents.last_task_id.max(task.id.0);
        contents.tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn update_task(&mut self, task: &PendingTask) -> Result<()> {
        if let Some(stored) = self.contents().tasks.get_mut(&task.id) {
            stored.state = task.state;
            stored.attempts = task.attempts;
            stored.updated_at = task.updated_at;
        }
        Ok(())
    }

    fn delete_task(&mut self, id: TaskId) -> Result<()> {
        let mut contents = self.contents();
        contents.tasks.remove(&id);
        contents.errors.retain(|e| e.task_id != id);
        Ok(())
    }

    fn insert_error(&mut self, error: &TaskError) -> Result<()> {
        let mut contents = self.contents();
        contents.last_error_id = contents.last_error_id.max(error.id);
        contents.errors.retain(|e| e.id != error.id);
        contents.errors.push(error.clone());
        Ok(())
    }

    fn delete_errors(&mut self, task_id: TaskId) -> Result<()> {
        self.contents().errors.retain(|e| e.task_id != task_id);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        let mut contents = self.contents();
        contents.tasks.clear();
        contents.errors.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

fn row_to_task(row: &rusqlite::Row) -> std::result::Result<PendingTask, String> {
    let params_str: String = row.get(5).map_err(|e| e.to_string())?;
    let state_str: String = row.get(6).map_err(|e| e.to_string())?;
    let created_str: String = row.get(8).map_err(|e| e.to_string())?;
    let updated_str: String = row.get(9).map_err(|e| e.to_string())?;

    Ok(PendingTask {
        id: TaskId(row.get(0).map_err(|e| e.to_string())?),
        tag: row.get(1).map_err(|e| e.to_string())?,
        data_id: row.get(2).map_err(|e| e.to_string())?,
        group_id: row.get(3).map_err(|e| e.to_string())?,
        manually_run: row.get(4).map_err(|e| e.to_string())?,
        params: serde_json::from_str(&params_str).map_err(|e| format!("invalid params: {e}"))?,
        state: state_str.parse().map_err(|e: Error| e.to_string())?,
        attempts: row.get(7).map_err(|e| e.to_string())?,
        created_at: created_str
            .parse()
            .map_err(|_| "invalid created_at".to_string())?,
        updated_at: updated_str
            .parse()
            .map_err(|_| "invalid updated_at".to_string())?,
    })
}

fn parse_time(s: &str) -> DateTime<Utc> {
    s.parse().unwrap_or_else(|_| Utc::now())
}
