//! Polls the result backend and appends terminal results to the job's
//! results file, keeping the work-order counters current.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{ConductorError, Result};
use crate::execution_log::ExecutionLog;
use crate::state_machine::{JobStatus, WorkOrder};
use crate::store::{ResultBackend, TaskResult, TaskState};

/// One line of `results.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: String,
    pub state: TaskState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
    #[serde(default)]
    pub date_done: Option<DateTime<Utc>>,
}

impl From<&TaskResult> for ResultRecord {
    fn from(result: &TaskResult) -> Self {
        Self {
            task_id: result.task_id.clone(),
            state: result.state,
            result: result.result.clone(),
            error: result.error.clone(),
            traceback: result.traceback.clone(),
            date_done: result.date_done,
        }
    }
}

/// Summary of one polling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectPass {
    pub new_records: usize,
    /// Terminal ids recorded so far, this pass included.
    pub observed: usize,
    pub failed: usize,
    pub dispatched: usize,
    pub done: bool,
}

pub struct ResultCollector<B: ResultBackend> {
    backend: B,
    work_order_path: PathBuf,
    work_order: WorkOrder,
    results_path: PathBuf,
    log: ExecutionLog,
    seen: HashSet<String>,
    failed: usize,
}

impl<B: ResultBackend> ResultCollector<B> {
    /// Loads the work order and rebuilds the recorded-id set from any
    /// existing results file.
    pub fn new(backend: B, work_order_path: &Path) -> Result<Self> {
        let work_order = WorkOrder::load(work_order_path)?;
        let paths = work_order.paths(work_order_path);
        if let Some(parent) = paths.results.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = ExecutionLog::open(&paths.execution_log)?;

        let mut collector = Self {
            backend,
            work_order_path: work_order_path.to_path_buf(),
            work_order,
            results_path: paths.results,
            log,
            seen: HashSet::new(),
            failed: 0,
        };
        collector.scan_results_file()?;
        Ok(collector)
    }

    pub fn observed(&self) -> usize {
        self.seen.len()
    }

    pub fn work_order(&self) -> &WorkOrder {
        &self.work_order
    }

    fn scan_results_file(&mut self) -> Result<()> {
        let file = match File::open(&self.results_path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ResultRecord>(&line) {
                Ok(record) => {
                    if self.seen.insert(record.task_id) && record.state == TaskState::Failure {
                        self.failed += 1;
                    }
                }
                Err(err) => debug!(error = %err, "ignoring unreadable results line"),
            }
        }
        info!(
            path = %self.results_path.display(),
            recorded = self.seen.len(),
            "resuming from existing results"
        );
        Ok(())
    }

    /// Records every newly terminal result once.
    pub fn poll_once(&mut self) -> Result<CollectPass> {
        let ids = self.backend.result_ids(&self.work_order.job_id)?;
        let mut new_records = Vec::new();
        for id in ids {
            if self.seen.contains(&id) {
                continue;
            }
            match self.backend.fetch_result(&id)? {
                Some(result) if result.state.is_terminal() => new_records.push(result),
                _ => {}
            }
        }

        if !new_records.is_empty() {
            self.append(&new_records)?;
        }

        // Counters may lag the results file after a crash; rewrite them on drift.
        let (observed, failed) = (self.seen.len(), self.failed);
        let current = WorkOrder::load(&self.work_order_path)?;
        self.work_order = if current.execution.tasks_completed == observed
            && current.execution.tasks_failed == failed
        {
            current
        } else {
            WorkOrder::update(&self.work_order_path, |wo| {
                wo.execution.tasks_completed = observed;
                wo.execution.tasks_failed = failed;
            })?
        };

        let dispatched = self.work_order.execution.tasks_dispatched;
        let done = if dispatched == 0 {
            self.work_order.status == JobStatus::Completed
        } else {
            observed >= dispatched
        };
        Ok(CollectPass {
            new_records: new_records.len(),
            observed,
            failed,
            dispatched,
            done,
        })
    }

    fn append(&mut self, results: &[TaskResult]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.results_path)?;
        for result in results {
            let line = serde_json::to_string(&ResultRecord::from(result))?;
            writeln!(file, "{line}")?;
            self.seen.insert(result.task_id.clone());

            if result.state == TaskState::Failure {
                self.failed += 1;
                let error = result.error.as_deref().unwrap_or("unknown error");
                self.log.task_failed(&result.task_id, error)?;
                warn!(task_id = %result.task_id, error, "task failed");
            } else {
                self.log
                    .task_completed(&result.task_id, result.duration_secs())?;
                debug!(task_id = %result.task_id, "task succeeded");
            }
        }
        file.flush()?;
        Ok(())
    }

    /// Polls every `interval` until the job is fully collected. `on_pass`
    /// sees every pass, including the last.
    pub async fn run<F>(&mut self, interval: Duration, mut on_pass: F) -> Result<CollectPass>
    where
        F: FnMut(&CollectPass),
    {
        loop {
            match self.poll_once() {
                Ok(pass) => {
                    on_pass(&pass);
                    if pass.done {
                        info!(
                            job_id = %self.work_order.job_id,
                            collected = pass.observed,
                            failed = pass.failed,
                            "all results collected"
                        );
                        return Ok(pass);
                    }
                }
                Err(err @ (ConductorError::Store(_) | ConductorError::Io(_))) => {
                    warn!(error = %err, "collector pass failed, retrying");
                }
                Err(err) => return Err(err),
            }
            sleep(interval).await;
        }
    }
}
