use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{Backlog, ResultBackend, Submission, TaskBroker, TaskResult, TaskState};
use crate::error::{ConductorError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A message waiting in a worker queue, as a worker sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub task_id: String,
    pub queue: String,
    pub task: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub enqueued_at: DateTime<Utc>,
}

/// Ledger row kept for every submission, independent of queue consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub task_id: String,
    pub job_id: String,
    pub queue: String,
    pub task: String,
}

/// SQLite-backed backlog, worker queues and result backend.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path`. Any failure here is
    /// reported as [`ConductorError::StoreUnavailable`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let unavailable = |reason: String| ConductorError::StoreUnavailable {
            path: path.clone(),
            reason,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| unavailable(e.to_string()))?;
            }
        }
        let conn = Connection::open(&path).map_err(|e| unavailable(e.to_string()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| unavailable(e.to_string()))?;
        let store = Self { conn };
        store.migrate().map_err(|e| unavailable(e.to_string()))?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS backlog (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              key TEXT NOT NULL,
              payload TEXT NOT NULL,
              pushed_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS queue_messages (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              queue TEXT NOT NULL,
              task_id TEXT NOT NULL UNIQUE,
              task TEXT NOT NULL,
              args_json TEXT NOT NULL,
              kwargs_json TEXT NOT NULL,
              enqueued_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS submissions (
              task_id TEXT PRIMARY KEY,
              job_id TEXT NOT NULL,
              queue TEXT NOT NULL,
              task TEXT NOT NULL,
              submitted_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_results (
              task_id TEXT PRIMARY KEY,
              state TEXT NOT NULL,
              result_json TEXT,
              error TEXT,
              traceback TEXT,
              date_done_ms INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_backlog_key_seq ON backlog(key, seq);
            CREATE INDEX IF NOT EXISTS idx_queue_messages_queue_seq ON queue_messages(queue, seq);
            CREATE INDEX IF NOT EXISTS idx_submissions_job ON submissions(job_id);
            "#,
        )?;
        Ok(())
    }

    /// Worker side: takes the oldest message off `queue`.
    pub fn claim_message(&mut self, queue: &str) -> Result<Option<QueueMessage>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = tx
            .query_row(
                "SELECT seq, task_id, task, args_json, kwargs_json, enqueued_at_ms
                 FROM queue_messages WHERE queue = ?1 ORDER BY seq LIMIT 1",
                params![queue],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((seq, task_id, task, args_json, kwargs_json, enqueued_at_ms)) = row else {
            return Ok(None);
        };
        tx.execute("DELETE FROM queue_messages WHERE seq = ?1", params![seq])?;
        tx.commit()?;

        Ok(Some(QueueMessage {
            task_id,
            queue: queue.to_string(),
            task,
            args: serde_json::from_str(&args_json)?,
            kwargs: serde_json::from_str(&kwargs_json)?,
            enqueued_at: from_ms(enqueued_at_ms).unwrap_or_else(Utc::now),
        }))
    }

    /// Worker side: reports the state of a task. Terminal states stamp `date_done`.
    pub fn record_result(
        &mut self,
        task_id: &str,
        state: TaskState,
        result: Option<&Value>,
        error: Option<&str>,
        traceback: Option<&str>,
    ) -> Result<()> {
        let result_json = result.map(serde_json::to_string).transpose()?;
        let date_done = state.is_terminal().then(now_ms);
        self.conn.execute(
            "INSERT INTO task_results(task_id, state, result_json, error, traceback, date_done_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(task_id) DO UPDATE SET
               state = excluded.state,
               result_json = excluded.result_json,
               error = excluded.error,
               traceback = excluded.traceback,
               date_done_ms = excluded.date_done_ms",
            params![task_id, state.as_str(), result_json, error, traceback, date_done],
        )?;
        Ok(())
    }

    /// Every submission made for `job_id`, oldest first.
    pub fn submissions_for(&self, job_id: &str) -> Result<Vec<SubmissionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, job_id, queue, task FROM submissions
             WHERE job_id = ?1 ORDER BY submitted_at_ms, rowid",
        )?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok(SubmissionRecord {
                task_id: row.get(0)?,
                job_id: row.get(1)?,
                queue: row.get(2)?,
                task: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

impl Backlog for SqliteStore {
    fn push_tail(&mut self, key: &str, payload: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO backlog(key, payload, pushed_at_ms) VALUES (?1, ?2, ?3)",
            params![key, payload, now_ms()],
        )?;
        Ok(())
    }

    fn pop_head(&mut self, key: &str) -> Result<Option<String>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let head = tx
            .query_row(
                "SELECT seq, payload FROM backlog WHERE key = ?1 ORDER BY seq LIMIT 1",
                params![key],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        if let Some((seq, _)) = &head {
            tx.execute("DELETE FROM backlog WHERE seq = ?1", params![seq])?;
        }
        tx.commit()?;
        Ok(head.map(|(_, payload)| payload))
    }

    fn backlog_len(&self, key: &str) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM backlog WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    fn clear_backlog(&mut self, key: &str) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM backlog WHERE key = ?1", params![key])?)
    }
}

impl TaskBroker for SqliteStore {
    fn queue_depth(&self, queue: &str) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM queue_messages WHERE queue = ?1",
            params![queue],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    fn submit(&mut self, queue: &str, submission: &Submission<'_>) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        let args_json = serde_json::to_string(submission.args)?;
        let kwargs_json = serde_json::to_string(submission.kwargs)?;
        let now = now_ms();

        let dispatch_err = |e: rusqlite::Error| ConductorError::Dispatch {
            queue: queue.to_string(),
            reason: e.to_string(),
        };
        let tx = self.conn.transaction().map_err(dispatch_err)?;
        tx.execute(
            "INSERT INTO queue_messages(queue, task_id, task, args_json, kwargs_json, enqueued_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![queue, task_id, submission.task, args_json, kwargs_json, now],
        )
        .map_err(dispatch_err)?;
        tx.execute(
            "INSERT INTO submissions(task_id, job_id, queue, task, submitted_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![task_id, submission.job_id, queue, submission.task, now],
        )
        .map_err(dispatch_err)?;
        tx.commit().map_err(dispatch_err)?;
        Ok(task_id)
    }
}

impl ResultBackend for SqliteStore {
    fn result_ids(&self, job_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.task_id FROM task_results r
             JOIN submissions s ON s.task_id = r.task_id
             WHERE s.job_id = ?1
             ORDER BY s.submitted_at_ms, s.rowid",
        )?;
        let ids = stmt.query_map(params![job_id], |row| row.get(0))?;
        Ok(ids.collect::<std::result::Result<Vec<String>, _>>()?)
    }

    fn fetch_result(&self, task_id: &str) -> Result<Option<TaskResult>> {
        let row = self
            .conn
            .query_row(
                "SELECT r.state, r.result_json, r.error, r.traceback, r.date_done_ms,
                        s.submitted_at_ms
                 FROM task_results r
                 LEFT JOIN submissions s ON s.task_id = r.task_id
                 WHERE r.task_id = ?1",
                params![task_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((state, result_json, error, traceback, date_done_ms, submitted_at_ms)) = row
        else {
            return Ok(None);
        };
        Ok(Some(TaskResult {
            task_id: task_id.to_string(),
            state: state.parse()?,
            result: result_json
                .as_deref()
                .map(|raw| serde_json::from_str::<Value>(raw))
                .transpose()?,
            error,
            traceback,
            date_done: date_done_ms.and_then(from_ms),
            submitted_at: submitted_at_ms.and_then(from_ms),
        }))
    }
}
