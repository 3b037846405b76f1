//! Durable plumbing shared by the dispatcher, conductor and collector.
//!
//! The traits describe the three contracts the core relies on: a per-job
//! [`Backlog`], the two worker queues behind a [`TaskBroker`], and the
//! [`ResultBackend`] workers report into. [`SqliteStore`] implements all of
//! them on one database file.

mod sqlite;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConductorError, Result};

pub use sqlite::{QueueMessage, SqliteStore, SubmissionRecord};

/// Durable FIFO of opaque entries, one per key.
pub trait Backlog {
    fn push_tail(&mut self, key: &str, payload: &str) -> Result<()>;

    /// Removes and returns the oldest entry. At most one caller wins each entry.
    fn pop_head(&mut self, key: &str) -> Result<Option<String>>;

    fn backlog_len(&self, key: &str) -> Result<usize>;

    /// Drops every entry under `key`, returning how many were removed.
    fn clear_backlog(&mut self, key: &str) -> Result<usize>;
}

/// A task handed to a worker queue.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub job_id: &'a str,
    pub task: &'a str,
    pub args: &'a [Value],
    pub kwargs: &'a Map<String, Value>,
}

/// Named worker queues the conductor submits to and observes.
pub trait TaskBroker {
    fn queue_depth(&self, queue: &str) -> Result<usize>;

    /// Enqueues the task and returns the id its result will be reported under.
    fn submit(&mut self, queue: &str, submission: &Submission<'_>) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
}

impl TaskState {
    /// Success and failure never change afterwards.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Retry => "RETRY",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TaskState::Pending),
            "STARTED" => Ok(TaskState::Started),
            "RETRY" => Ok(TaskState::Retry),
            "SUCCESS" => Ok(TaskState::Success),
            "FAILURE" => Ok(TaskState::Failure),
            other => Err(ConductorError::MalformedEntry(format!(
                "unknown task state `{other}`"
            ))),
        }
    }
}

/// What a worker reported for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub task_id: String,
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub traceback: Option<String>,
    pub date_done: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    /// Seconds between submission and completion, when both are known.
    pub fn duration_secs(&self) -> Option<f64> {
        let (start, end) = (self.submitted_at?, self.date_done?);
        Some((end - start).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

/// Where workers publish task outcomes.
pub trait ResultBackend {
    /// Ids of every reported result for tasks submitted under `job_id`.
    fn result_ids(&self, job_id: &str) -> Result<Vec<String>>;

    fn fetch_result(&self, task_id: &str) -> Result<Option<TaskResult>>;
}

impl<T: Backlog + ?Sized> Backlog for &mut T {
    fn push_tail(&mut self, key: &str, payload: &str) -> Result<()> {
        (**self).push_tail(key, payload)
    }

    fn pop_head(&mut self, key: &str) -> Result<Option<String>> {
        (**self).pop_head(key)
    }

    fn backlog_len(&self, key: &str) -> Result<usize> {
        (**self).backlog_len(key)
    }

    fn clear_backlog(&mut self, key: &str) -> Result<usize> {
        (**self).clear_backlog(key)
    }
}

impl<T: TaskBroker + ?Sized> TaskBroker for &mut T {
    fn queue_depth(&self, queue: &str) -> Result<usize> {
        (**self).queue_depth(queue)
    }

    fn submit(&mut self, queue: &str, submission: &Submission<'_>) -> Result<String> {
        (**self).submit(queue, submission)
    }
}

impl<T: ResultBackend + ?Sized> ResultBackend for &T {
    fn result_ids(&self, job_id: &str) -> Result<Vec<String>> {
        (**self).result_ids(job_id)
    }

    fn fetch_result(&self, task_id: &str) -> Result<Option<TaskResult>> {
        (**self).fetch_result(task_id)
    }
}

impl<T: ResultBackend + ?Sized> ResultBackend for &mut T {
    fn result_ids(&self, job_id: &str) -> Result<Vec<String>> {
        (**self).result_ids(job_id)
    }

    fn fetch_result(&self, task_id: &str) -> Result<Option<TaskResult>> {
        (**self).fetch_result(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn terminal_states() {
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Failure.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Started.is_terminal());
        assert!(!TaskState::Retry.is_terminal());
    }

    #[test]
    fn state_string_forms_agree() {
        for state in [
            TaskState::Pending,
            TaskState::Started,
            TaskState::Retry,
            TaskState::Success,
            TaskState::Failure,
        ] {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
            assert_eq!(
                serde_json::to_string(&state).unwrap(),
                format!("\"{}\"", state.as_str())
            );
        }
        assert!("REVOKED".parse::<TaskState>().is_err());
    }

    #[test]
    fn duration_needs_both_timestamps() {
        let now = Utc::now();
        let mut result = TaskResult {
            task_id: "t".into(),
            state: TaskState::Success,
            result: None,
            error: None,
            traceback: None,
            date_done: Some(now),
            submitted_at: None,
        };
        assert_eq!(result.duration_secs(), None);
        result.submitted_at = Some(now - Duration::milliseconds(1500));
        assert_eq!(result.duration_secs(), Some(1.5));
    }
}
