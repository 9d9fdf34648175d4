//! SQLite-backed store for the three entities the core touches:
//! prebuild events, VM tasks, and log chunks.
//!
//! The workflow engine owns events and tasks across activity boundaries;
//! within one prebuild invocation the supervisor is the only writer of task
//! status, and each log group has exactly one writer assigning its chunk
//! indices.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store mutex poisoned")]
    Poisoned,
}

/// Terminal and intermediate states of a VM task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmTaskStatus {
    /// Not yet picked up by a supervisor.
    Pending,
    /// The supervisor is executing it.
    Running,
    /// Clean exit.
    Success,
    /// The task itself failed.
    Error,
    /// A sibling task failed first and this one had not completed.
    Cancelled,
}

impl VmTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// One idempotent shell command of a prebuild event.
#[derive(Debug, Clone)]
pub struct VmTask {
    /// Task ID.
    pub id: i64,
    /// Stable ordinal position among sibling tasks.
    pub idx: i64,
    /// The shell command to run.
    pub command: String,
    /// Current status.
    pub status: VmTaskStatus,
    /// Log stream identity for this task's output.
    pub log_group_id: i64,
}

/// A prebuild event with its ordered tasks.
#[derive(Debug, Clone)]
pub struct PrebuildEvent {
    pub id: i64,
    /// Tasks ordered by `idx`.
    pub tasks: Vec<VmTask>,
}

/// SQLite store handle. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL keeps concurrent task-status writes from blocking log appends.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS prebuild_events (
                id INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS vm_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                prebuild_event_id INTEGER NOT NULL REFERENCES prebuild_events(id),
                idx INTEGER NOT NULL,
                command TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                log_group_id INTEGER NOT NULL,
                UNIQUE (prebuild_event_id, idx)
            );

            CREATE TABLE IF NOT EXISTS logs (
                log_group_id INTEGER NOT NULL,
                idx INTEGER NOT NULL,
                content BLOB NOT NULL,
                PRIMARY KEY (log_group_id, idx)
            );
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }

    /// Create a prebuild event with tasks in the given order. Log groups
    /// are allocated per task. Events are normally created by the workflow
    /// engine; this exists for seeding and tests.
    pub fn create_prebuild_event(&self, commands: &[&str]) -> Result<PrebuildEvent, StoreError> {
        let mut conn_guard = self.lock()?;
        let tx = conn_guard.transaction()?;

        tx.execute("INSERT INTO prebuild_events DEFAULT VALUES", [])?;
        let event_id = tx.last_insert_rowid();

        let mut tasks = Vec::with_capacity(commands.len());
        for (idx, command) in commands.iter().enumerate() {
            tx.execute(
                "INSERT INTO vm_tasks (prebuild_event_id, idx, command, status, log_group_id)
                 VALUES (?1, ?2, ?3, 'pending', 0)",
                params![event_id, idx as i64, command],
            )?;
            let task_id = tx.last_insert_rowid();
            // The task id doubles as its log group identity.
            tx.execute(
                "UPDATE vm_tasks SET log_group_id = ?1 WHERE id = ?1",
                params![task_id],
            )?;

            tasks.push(VmTask {
                id: task_id,
                idx: idx as i64,
                command: command.to_string(),
                status: VmTaskStatus::Pending,
                log_group_id: task_id,
            });
        }

        tx.commit()?;
        Ok(PrebuildEvent {
            id: event_id,
            tasks,
        })
    }

    /// Fetch a prebuild event and its ordered tasks, failing if absent.
    pub fn get_prebuild_event(&self, event_id: i64) -> Result<PrebuildEvent, StoreError> {
        let conn = self.lock()?;

        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM prebuild_events WHERE id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("prebuild event {event_id}")));
        }

        let mut stmt = conn.prepare(
            "SELECT id, idx, command, status, log_group_id
             FROM vm_tasks WHERE prebuild_event_id = ?1 ORDER BY idx",
        )?;

        let tasks = stmt
            .query_map(params![event_id], |row| {
                let status_str: String = row.get(3)?;
                Ok(VmTask {
                    id: row.get(0)?,
                    idx: row.get(1)?,
                    command: row.get(2)?,
                    status: VmTaskStatus::from_str(&status_str).unwrap_or(VmTaskStatus::Pending),
                    log_group_id: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PrebuildEvent {
            id: event_id,
            tasks,
        })
    }

    /// Get a single task by id.
    pub fn get_task(&self, task_id: i64) -> Result<VmTask, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, idx, command, status, log_group_id FROM vm_tasks WHERE id = ?1",
            params![task_id],
            |row| {
                let status_str: String = row.get(3)?;
                Ok(VmTask {
                    id: row.get(0)?,
                    idx: row.get(1)?,
                    command: row.get(2)?,
                    status: VmTaskStatus::from_str(&status_str).unwrap_or(VmTaskStatus::Pending),
                    log_group_id: row.get(4)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("vm task {task_id}")))
    }

    /// Persist a task status transition.
    pub fn update_task_status(
        &self,
        task_id: i64,
        status: VmTaskStatus,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE vm_tasks SET status = ?1 WHERE id = ?2",
            params![status.as_str(), task_id],
        )?;

        if updated == 0 {
            return Err(StoreError::NotFound(format!("vm task {task_id}")));
        }

        debug!(task_id, status = status.as_str(), "Task status persisted");
        Ok(())
    }

    /// Append one log chunk, assigning the next contiguous idx for the
    /// group. Returns the assigned idx.
    pub fn append_log_chunk(&self, log_group_id: i64, content: &[u8]) -> Result<i64, StoreError> {
        let mut conn_guard = self.lock()?;
        let tx = conn_guard.transaction()?;

        let idx: i64 = tx.query_row(
            "SELECT COALESCE(MAX(idx) + 1, 0) FROM logs WHERE log_group_id = ?1",
            params![log_group_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO logs (log_group_id, idx, content) VALUES (?1, ?2, ?3)",
            params![log_group_id, idx, content],
        )?;

        tx.commit()?;
        Ok(idx)
    }

    /// All chunks of a log group in idx order.
    pub fn log_chunks(&self, log_group_id: i64) -> Result<Vec<Vec<u8>>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT content FROM logs WHERE log_group_id = ?1 ORDER BY idx")?;

        let chunks = stmt
            .query_map(params![log_group_id], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks)
    }

    /// The persisted idx values of a log group, in write order.
    pub fn log_indices(&self, log_group_id: i64) -> Result<Vec<i64>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT idx FROM logs WHERE log_group_id = ?1 ORDER BY rowid")?;

        let indices = stmt
            .query_map(params![log_group_id], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(indices)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_roundtrip() {
        let store = Store::open_in_memory().unwrap();

        let event = store
            .create_prebuild_event(&["echo A", "echo B"])
            .unwrap();
        assert_eq!(event.tasks.len(), 2);
        assert_eq!(event.tasks[0].idx, 0);
        assert_eq!(event.tasks[1].idx, 1);

        let fetched = store.get_prebuild_event(event.id).unwrap();
        assert_eq!(fetched.tasks.len(), 2);
        assert_eq!(fetched.tasks[0].command, "echo A");
        assert_eq!(fetched.tasks[0].status, VmTaskStatus::Pending);
    }

    #[test]
    fn test_missing_event_fails() {
        let store = Store::open_in_memory().unwrap();
        let err = store.get_prebuild_event(9999).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_status_transitions() {
        let store = Store::open_in_memory().unwrap();
        let event = store.create_prebuild_event(&["true"]).unwrap();
        let task_id = event.tasks[0].id;

        store
            .update_task_status(task_id, VmTaskStatus::Running)
            .unwrap();
        assert_eq!(store.get_task(task_id).unwrap().status, VmTaskStatus::Running);

        store
            .update_task_status(task_id, VmTaskStatus::Success)
            .unwrap();
        assert_eq!(store.get_task(task_id).unwrap().status, VmTaskStatus::Success);
    }

    #[test]
    fn test_log_idx_contiguous() {
        let store = Store::open_in_memory().unwrap();

        assert_eq!(store.append_log_chunk(7, b"a").unwrap(), 0);
        assert_eq!(store.append_log_chunk(7, b"b").unwrap(), 1);
        // Other groups don't disturb the sequence.
        assert_eq!(store.append_log_chunk(8, b"x").unwrap(), 0);
        assert_eq!(store.append_log_chunk(7, b"c").unwrap(), 2);

        assert_eq!(store.log_indices(7).unwrap(), vec![0, 1, 2]);
        assert_eq!(
            store.log_chunks(7).unwrap(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }
}
