//! Builds a job directory from a manifest: `<jobs_dir>/<job_id>/` holding a
//! copy of the manifest and a fresh `work_order.yaml`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::info;

use crate::error::{ConductorError, Result};
use crate::routing::RoutingStrategy;
use crate::state_machine::{ManifestRef, WorkOrder};

pub const WORK_ORDER_FILE: &str = "work_order.yaml";
pub const MANIFEST_FILE: &str = "manifest.jsonl";

/// `<name>_<YYYYmmdd_HHMMSS>`.
pub fn job_id(name: &str, at: DateTime<Local>) -> String {
    format!("{name}_{}", at.format("%Y%m%d_%H%M%S"))
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConductorError::Config(format!(
            "job name `{name}` must be alphanumeric with underscores"
        )));
    }
    Ok(())
}

/// Creates the job directory and returns the path of its work order.
pub fn create_job(
    jobs_dir: &Path,
    name: &str,
    manifest_src: &Path,
    strategy: RoutingStrategy,
) -> Result<PathBuf> {
    validate_name(name)?;
    let manifest = std::fs::read_to_string(manifest_src)?;
    let count = manifest.lines().filter(|l| !l.trim().is_empty()).count();

    let job_id = job_id(name, Local::now());
    let job_dir = jobs_dir.join(&job_id);
    if job_dir.exists() {
        return Err(ConductorError::Config(format!(
            "job directory {} already exists",
            job_dir.display()
        )));
    }
    std::fs::create_dir_all(&job_dir)?;
    std::fs::write(job_dir.join(MANIFEST_FILE), &manifest)?;

    let order = WorkOrder::new(
        &job_id,
        format!("{name} - {count} tasks"),
        ManifestRef {
            path: PathBuf::from(MANIFEST_FILE),
            count,
        },
        strategy,
    );
    let work_order_path = job_dir.join(WORK_ORDER_FILE);
    order.save(&work_order_path)?;

    info!(%job_id, count, %strategy, dir = %job_dir.display(), "job packaged");
    Ok(work_order_path)
}
