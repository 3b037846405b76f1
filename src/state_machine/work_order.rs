use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{ConductorError, Result};
use crate::routing::RoutingStrategy;

/// Lifecycle status of a job run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRef {
    /// Relative paths resolve against the work order's directory.
    pub path: PathBuf,
    #[serde(default)]
    pub count: usize,
}

fn default_results_path() -> PathBuf {
    PathBuf::from("results.jsonl")
}

fn default_logs_path() -> PathBuf {
    PathBuf::from("execution.log")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPaths {
    #[serde(default = "default_results_path")]
    pub results_path: PathBuf,
    #[serde(default = "default_logs_path")]
    pub logs_path: PathBuf,
}

impl Default for OutputPaths {
    fn default() -> Self {
        Self {
            results_path: default_results_path(),
            logs_path: default_logs_path(),
        }
    }
}

/// Progress counters. Dispatched is set by the dispatcher, completed and
/// failed by the result collector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCounters {
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks_dispatched: usize,
    #[serde(default)]
    pub tasks_completed: usize,
    #[serde(default)]
    pub tasks_failed: usize,
}

/// Persisted descriptor for one job run (`work_order.yaml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub job_id: String,
    pub name: String,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub status: JobStatus,
    pub manifest: ManifestRef,
    #[serde(default)]
    pub routing_strategy: RoutingStrategy,
    pub backlog_key: String,
    #[serde(default)]
    pub output: OutputPaths,
    #[serde(default)]
    pub execution: ExecutionCounters,
}

/// Absolute locations of every file belonging to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub work_order: PathBuf,
    pub manifest: PathBuf,
    pub results: PathBuf,
    pub execution_log: PathBuf,
}

impl WorkOrder {
    pub fn new(
        job_id: impl Into<String>,
        name: impl Into<String>,
        manifest: ManifestRef,
        routing_strategy: RoutingStrategy,
    ) -> Self {
        let job_id = job_id.into();
        Self {
            backlog_key: format!("job:{job_id}:backlog"),
            job_id,
            name: name.into(),
            created: Utc::now(),
            status: JobStatus::Pending,
            manifest,
            routing_strategy,
            output: OutputPaths::default(),
            execution: ExecutionCounters::default(),
        }
    }

    /// Reads and validates the whole document.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let invalid = |reason: String| ConductorError::InvalidWorkOrder {
            path: path.to_path_buf(),
            reason,
        };
        let order: WorkOrder =
            serde_yaml::from_str(&contents).map_err(|e| invalid(e.to_string()))?;
        if order.job_id.trim().is_empty() {
            return Err(invalid("job_id must not be empty".into()));
        }
        if order.backlog_key.trim().is_empty() {
            return Err(invalid("backlog_key must not be empty".into()));
        }
        Ok(order)
    }

    /// Replaces the file wholesale. The document is written to a sibling
    /// temporary file first and renamed into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        let tmp = sibling(path, ".tmp");
        std::fs::write(&tmp, yaml)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load, mutate, save under an exclusive advisory lock so concurrent
    /// writers each see the other's latest document.
    pub fn update<F>(path: &Path, mutate: F) -> Result<Self>
    where
        F: FnOnce(&mut WorkOrder),
    {
        let lock = lock_file(path)?;
        FileExt::lock_exclusive(&lock)?;
        let result = Self::load(path).and_then(|mut order| {
            mutate(&mut order);
            order.save(path).map(|()| order)
        });
        FileExt::unlock(&lock)?;
        result
    }

    pub fn paths(&self, work_order_path: &Path) -> JobPaths {
        let base = work_order_path.parent().unwrap_or_else(|| Path::new("."));
        JobPaths {
            work_order: work_order_path.to_path_buf(),
            manifest: base.join(&self.manifest.path),
            results: base.join(&self.output.results_path),
            execution_log: base.join(&self.output.logs_path),
        }
    }

    /// Completion percentage against dispatched tasks.
    pub fn progress_pct(&self) -> Option<f64> {
        let dispatched = self.execution.tasks_dispatched;
        if dispatched == 0 {
            return None;
        }
        Some(self.execution.tasks_completed as f64 / dispatched as f64 * 100.0)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "work_order.yaml".to_string());
    path.with_file_name(format!(".{name}{suffix}"))
}

fn lock_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(sibling(path, ".lock"))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WorkOrder {
        WorkOrder::new(
            "demo_01",
            "Demo - 3 tasks",
            ManifestRef {
                path: PathBuf::from("manifest.jsonl"),
                count: 3,
            },
            RoutingStrategy::HybridSupervisor,
        )
    }

    #[test]
    fn new_work_order_defaults() {
        let wo = sample();
        assert_eq!(wo.status, JobStatus::Pending);
        assert_eq!(wo.backlog_key, "job:demo_01:backlog");
        assert_eq!(wo.output.results_path, PathBuf::from("results.jsonl"));
        assert_eq!(wo.output.logs_path, PathBuf::from("execution.log"));
        assert_eq!(wo.execution, ExecutionCounters::default());
    }

    #[test]
    fn save_then_load_preserves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work_order.yaml");
        let mut wo = sample();
        wo.status = JobStatus::Running;
        wo.execution.started_at = Some(Utc::now());
        wo.execution.tasks_dispatched = 3;
        wo.save(&path).unwrap();

        let loaded = WorkOrder::load(&path).unwrap();
        assert_eq!(loaded, wo);
        assert!(!sibling(&path, ".tmp").exists());
    }

    #[test]
    fn load_minimal_document_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work_order.yaml");
        std::fs::write(
            &path,
            "job_id: j1\nname: minimal\nmanifest:\n  path: manifest.jsonl\nbacklog_key: job:j1:backlog\n",
        )
        .unwrap();
        let wo = WorkOrder::load(&path).unwrap();
        assert_eq!(wo.status, JobStatus::Pending);
        assert_eq!(wo.routing_strategy, RoutingStrategy::HybridSupervisor);
        assert_eq!(wo.manifest.count, 0);
    }

    #[test]
    fn load_rejects_missing_backlog_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work_order.yaml");
        std::fs::write(&path, "job_id: j1\nname: x\nmanifest:\n  path: m.jsonl\n").unwrap();
        let err = WorkOrder::load(&path).unwrap_err();
        assert!(matches!(err, ConductorError::InvalidWorkOrder { .. }));
        assert!(err.to_string().contains("backlog_key"));
    }

    #[test]
    fn load_rejects_unknown_status_and_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work_order.yaml");
        let base = "job_id: j1\nname: x\nmanifest:\n  path: m.jsonl\nbacklog_key: k\n";

        std::fs::write(&path, format!("{base}status: paused\n")).unwrap();
        assert!(matches!(
            WorkOrder::load(&path),
            Err(ConductorError::InvalidWorkOrder { .. })
        ));

        std::fs::write(&path, format!("{base}routing_strategy: round_robin\n")).unwrap();
        assert!(matches!(
            WorkOrder::load(&path),
            Err(ConductorError::InvalidWorkOrder { .. })
        ));
    }

    #[test]
    fn load_rejects_blank_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work_order.yaml");
        std::fs::write(
            &path,
            "job_id: ''\nname: x\nmanifest:\n  path: m.jsonl\nbacklog_key: k\n",
        )
        .unwrap();
        assert!(matches!(
            WorkOrder::load(&path),
            Err(ConductorError::InvalidWorkOrder { .. })
        ));
    }

    #[test]
    fn update_rewrites_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work_order.yaml");
        sample().save(&path).unwrap();

        WorkOrder::update(&path, |wo| wo.execution.tasks_dispatched = 7).unwrap();
        let updated = WorkOrder::update(&path, |wo| wo.status = JobStatus::Completed).unwrap();

        assert_eq!(updated.execution.tasks_dispatched, 7);
        let reloaded = WorkOrder::load(&path).unwrap();
        assert_eq!(reloaded.status, JobStatus::Completed);
        assert_eq!(reloaded.execution.tasks_dispatched, 7);
    }

    #[test]
    fn paths_resolve_against_work_order_dir() {
        let wo = sample();
        let paths = wo.paths(Path::new("/data/jobs/demo_01/work_order.yaml"));
        assert_eq!(paths.manifest, PathBuf::from("/data/jobs/demo_01/manifest.jsonl"));
        assert_eq!(paths.results, PathBuf::from("/data/jobs/demo_01/results.jsonl"));
        assert_eq!(
            paths.execution_log,
            PathBuf::from("/data/jobs/demo_01/execution.log")
        );
    }

    #[test]
    fn progress_percentage() {
        let mut wo = sample();
        assert_eq!(wo.progress_pct(), None);
        wo.execution.tasks_dispatched = 4;
        wo.execution.tasks_completed = 1;
        assert_eq!(wo.progress_pct(), Some(25.0));
    }
}
