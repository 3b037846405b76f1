//! Append-only, human-readable record of job lifecycle events.
//!
//! One line per event:
//! `2025-12-11 14:03:22 | [Task-01] | ROUTED          | Routed to queue_metal (...)`.
//! Every write reopens the file in append mode, so the dispatcher, conductor
//! and collector processes can share one log.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{Local, NaiveDateTime};

use crate::error::{ConductorError, Result};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const SYSTEM_LABEL: &str = "SYSTEM";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    JobStarted,
    Pulled,
    Routed,
    Completed,
    Failed,
    JobCompleted,
    Decision,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::JobStarted => "JOB_STARTED",
            EventType::Pulled => "PULLED",
            EventType::Routed => "ROUTED",
            EventType::Completed => "COMPLETED",
            EventType::Failed => "FAILED",
            EventType::JobCompleted => "JOB_COMPLETED",
            EventType::Decision => "DECISION",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "JOB_STARTED" => EventType::JobStarted,
            "PULLED" => EventType::Pulled,
            "ROUTED" => EventType::Routed,
            "COMPLETED" => EventType::Completed,
            "FAILED" => EventType::Failed,
            "JOB_COMPLETED" => EventType::JobCompleted,
            "DECISION" => EventType::Decision,
            other => {
                return Err(ConductorError::MalformedEntry(format!(
                    "unknown event type `{other}`"
                )));
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: NaiveDateTime,
    pub task_id: Option<String>,
    pub event: EventType,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | [{}] | {:<15} | {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.task_id.as_deref().unwrap_or(SYSTEM_LABEL),
            self.event.as_str(),
            self.message
        )
    }
}

impl FromStr for LogEntry {
    type Err = ConductorError;

    fn from_str(line: &str) -> Result<Self> {
        let malformed = || ConductorError::MalformedEntry(format!("execution log line: {line}"));
        let mut parts = line.splitn(4, " | ");
        let (Some(ts), Some(label), Some(event), Some(message)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        let timestamp =
            NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).map_err(|_| malformed())?;
        let label = label
            .strip_prefix('[')
            .and_then(|l| l.strip_suffix(']'))
            .ok_or_else(malformed)?;
        Ok(LogEntry {
            timestamp,
            task_id: (label != SYSTEM_LABEL).then(|| label.to_string()),
            event: event.trim_end().parse()?,
            message: message.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionLog {
    path: PathBuf,
}

impl ExecutionLog {
    /// Creates the parent directory if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: EventType, task_id: Option<&str>, message: &str) -> Result<()> {
        let entry = LogEntry {
            timestamp: Local::now().naive_local(),
            task_id: task_id.map(str::to_string),
            event,
            message: message.replace('\n', " "),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{entry}")?;
        Ok(())
    }

    pub fn job_started(&self, job_id: &str, backlog_key: &str, task_count: usize) -> Result<()> {
        self.append(
            EventType::JobStarted,
            None,
            &format!("Job {job_id} started. {task_count} tasks in backlog: {backlog_key}"),
        )
    }

    pub fn task_pulled(&self, task_id: &str, backlog_key: &str) -> Result<()> {
        self.append(
            EventType::Pulled,
            Some(task_id),
            &format!("Pulled from {backlog_key}"),
        )
    }

    pub fn task_routed(&self, task_id: &str, queue: &str, reason: &str) -> Result<()> {
        let mut message = format!("Routed to {queue}");
        if !reason.is_empty() {
            message.push_str(&format!(" ({reason})"));
        }
        self.append(EventType::Routed, Some(task_id), &message)
    }

    pub fn task_completed(&self, task_id: &str, duration_secs: Option<f64>) -> Result<()> {
        let message = match duration_secs {
            Some(secs) => format!("Finished in {secs:.1}s"),
            None => "Finished".to_string(),
        };
        self.append(EventType::Completed, Some(task_id), &message)
    }

    pub fn task_failed(&self, task_id: &str, error: &str) -> Result<()> {
        self.append(EventType::Failed, Some(task_id), &format!("Error: {error}"))
    }

    pub fn job_completed(
        &self,
        job_id: &str,
        dispatched: usize,
        completed: usize,
        failed: usize,
    ) -> Result<()> {
        self.append(
            EventType::JobCompleted,
            None,
            &format!(
                "Job {job_id} finished. Success: {completed}/{dispatched}, Failed: {failed}"
            ),
        )
    }

    pub fn decision(&self, decision: &str) -> Result<()> {
        self.append(EventType::Decision, None, decision)
    }

    /// Parses every well-formed line; malformed lines are skipped.
    pub fn read_entries(&self) -> Result<Vec<LogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(contents
            .lines()
            .filter_map(|line| line.parse().ok())
            .collect())
    }

    pub fn tail(&self, n: usize) -> Result<Vec<LogEntry>> {
        let mut entries = self.read_entries()?;
        let skip = entries.len().saturating_sub(n);
        Ok(entries.split_off(skip))
    }
}
