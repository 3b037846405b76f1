//! Manifest → backlog loader, plus the backlog flush used by operators.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{ConductorError, Result};
use crate::execution_log::ExecutionLog;
use crate::manifest::ManifestEntry;
use crate::routing::RoutingTable;
use crate::state_machine::{JobStatus, WorkOrder};
use crate::store::Backlog;

/// Outcome of one dispatch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Entries that parsed and passed validation.
    pub parsed: usize,
    /// Lines that were malformed or named an unknown task kind.
    pub skipped: usize,
    pub pushed: usize,
    pub dry_run: bool,
}

pub struct Dispatcher<'a, B: Backlog> {
    backlog: B,
    routing: &'a RoutingTable,
}

impl<'a, B: Backlog> Dispatcher<'a, B> {
    pub fn new(backlog: B, routing: &'a RoutingTable) -> Self {
        Self { backlog, routing }
    }

    /// Pushes every valid manifest entry onto the job's backlog in manifest
    /// order, then records the count in the work order.
    ///
    /// Running twice against the same manifest pushes every entry twice.
    pub fn dispatch(&mut self, work_order_path: &Path, dry_run: bool) -> Result<DispatchReport> {
        let order = WorkOrder::load(work_order_path)?;
        let paths = order.paths(work_order_path);

        let (entries, skipped) = self.read_manifest(&paths.manifest)?;
        let mut report = DispatchReport {
            parsed: entries.len(),
            skipped,
            pushed: 0,
            dry_run,
        };

        if dry_run {
            info!(
                job_id = %order.job_id,
                parsed = report.parsed,
                skipped = report.skipped,
                "dry run, backlog and work order untouched"
            );
            return Ok(report);
        }

        let log = ExecutionLog::open(&paths.execution_log)?;
        log.job_started(&order.job_id, &order.backlog_key, entries.len())?;

        for entry in &entries {
            self.backlog
                .push_tail(&order.backlog_key, &entry.to_payload()?)?;
            report.pushed += 1;
        }

        let pushed = report.pushed;
        WorkOrder::update(work_order_path, |wo| {
            wo.status = JobStatus::Pending;
            wo.execution.tasks_dispatched = pushed;
        })?;

        info!(
            job_id = %order.job_id,
            backlog_key = %order.backlog_key,
            pushed,
            skipped,
            "manifest dispatched"
        );
        Ok(report)
    }

    fn read_manifest(&self, path: &Path) -> Result<(Vec<ManifestEntry>, usize)> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        let mut skipped = 0;

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match self.check_entry(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) if err.is_recoverable() => {
                    warn!(line = index + 1, error = %err, "skipping manifest line");
                    skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }
        debug!(path = %path.display(), parsed = entries.len(), skipped, "manifest read");
        Ok((entries, skipped))
    }

    fn check_entry(&self, line: &str) -> Result<ManifestEntry> {
        let entry = ManifestEntry::parse(line)?;
        if !self.routing.contains(&entry.task) {
            return Err(ConductorError::UnknownTaskKind(entry.task));
        }
        Ok(entry)
    }
}

/// Empties the job's backlog. With `dry_run` only the current length is
/// reported. Returns the number of entries that were (or would be) removed.
pub fn flush_backlog<B: Backlog>(
    backlog: &mut B,
    work_order_path: &Path,
    dry_run: bool,
) -> Result<usize> {
    let order = WorkOrder::load(work_order_path)?;
    if dry_run {
        return backlog.backlog_len(&order.backlog_key);
    }
    let removed = backlog.clear_backlog(&order.backlog_key)?;
    let log = ExecutionLog::open(order.paths(work_order_path).execution_log)?;
    log.decision(&format!(
        "Backlog {} flushed by operator: {removed} entries removed",
        order.backlog_key
    ))?;
    warn!(backlog_key = %order.backlog_key, removed, "backlog flushed");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_log::EventType;
    use crate::routing::RoutingStrategy;
    use crate::state_machine::ManifestRef;
    use crate::store::SqliteStore;
    use std::path::PathBuf;

    const MANIFEST: &str = r#"{"task": "tasks.debug_task", "kwargs": {"i": 1}, "meta": {"id": "T-1"}}

{"task": "tasks.rag.process_batch", "args": ["chapter-2"], "meta": {"id": "T-2"}}
{not json at all
{"task": "tasks.unheard_of"}
{"task": "tasks.sleep_task", "kwargs": {"seconds": 1}, "meta": {"id": "T-3"}}
"#;

    fn job(manifest: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.jsonl"), manifest).unwrap();
        let path = dir.path().join("work_order.yaml");
        WorkOrder::new(
            "dispatch_test",
            "Dispatch test",
            ManifestRef {
                path: PathBuf::from("manifest.jsonl"),
                count: 6,
            },
            RoutingStrategy::HybridSupervisor,
        )
        .save(&path)
        .unwrap();
        (dir, path)
    }

    #[test]
    fn pushes_valid_entries_in_order_and_skips_the_rest() {
        let (_dir, path) = job(MANIFEST);
        let routing = RoutingTable::default();
        let mut store = SqliteStore::open_in_memory().unwrap();

        let report = Dispatcher::new(&mut store, &routing)
            .dispatch(&path, false)
            .unwrap();
        assert_eq!(
            report,
            DispatchReport {
                parsed: 3,
                skipped: 2,
                pushed: 3,
                dry_run: false
            }
        );

        let key = "job:dispatch_test:backlog";
        let labels: Vec<String> = std::iter::from_fn(|| store.pop_head(key).unwrap())
            .map(|raw| ManifestEntry::parse(&raw).unwrap().label())
            .collect();
        assert_eq!(labels, vec!["T-1", "T-2", "T-3"]);

        let order = WorkOrder::load(&path).unwrap();
        assert_eq!(order.status, JobStatus::Pending);
        assert_eq!(order.execution.tasks_dispatched, 3);
    }

    #[test]
    fn dry_run_touches_nothing() {
        let (dir, path) = job(MANIFEST);
        let before = std::fs::read_to_string(&path).unwrap();
        let routing = RoutingTable::default();
        let mut store = SqliteStore::open_in_memory().unwrap();

        let report = Dispatcher::new(&mut store, &routing)
            .dispatch(&path, true)
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.parsed, 3);
        assert_eq!(report.pushed, 0);
        assert_eq!(store.backlog_len("job:dispatch_test:backlog").unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
        assert!(!dir.path().join("execution.log").exists());
    }

    #[test]
    fn dispatching_twice_duplicates_the_backlog() {
        let (_dir, path) = job(MANIFEST);
        let routing = RoutingTable::default();
        let mut store = SqliteStore::open_in_memory().unwrap();

        Dispatcher::new(&mut store, &routing)
            .dispatch(&path, false)
            .unwrap();
        Dispatcher::new(&mut store, &routing)
            .dispatch(&path, false)
            .unwrap();

        assert_eq!(store.backlog_len("job:dispatch_test:backlog").unwrap(), 6);
        // The counter reflects the latest run, not the backlog length.
        let order = WorkOrder::load(&path).unwrap();
        assert_eq!(order.execution.tasks_dispatched, 3);
    }

    #[test]
    fn job_started_is_logged_before_pushing() {
        let (dir, path) = job(MANIFEST);
        let routing = RoutingTable::default();
        let mut store = SqliteStore::open_in_memory().unwrap();
        Dispatcher::new(&mut store, &routing)
            .dispatch(&path, false)
            .unwrap();

        let log = ExecutionLog::open(dir.path().join("execution.log")).unwrap();
        let entries = log.read_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, EventType::JobStarted);
        assert!(entries[0].message.contains("3 tasks"));
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let (dir, path) = job("");
        std::fs::remove_file(dir.path().join("manifest.jsonl")).unwrap();
        let routing = RoutingTable::default();
        let mut store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(
            Dispatcher::new(&mut store, &routing).dispatch(&path, false),
            Err(ConductorError::Io(_))
        ));
    }

    #[test]
    fn flush_reports_then_clears() {
        let (dir, path) = job(MANIFEST);
        let routing = RoutingTable::default();
        let mut store = SqliteStore::open_in_memory().unwrap();
        Dispatcher::new(&mut store, &routing)
            .dispatch(&path, false)
            .unwrap();

        assert_eq!(flush_backlog(&mut store, &path, true).unwrap(), 3);
        assert_eq!(store.backlog_len("job:dispatch_test:backlog").unwrap(), 3);

        assert_eq!(flush_backlog(&mut store, &path, false).unwrap(), 3);
        assert_eq!(store.backlog_len("job:dispatch_test:backlog").unwrap(), 0);

        let log = ExecutionLog::open(dir.path().join("execution.log")).unwrap();
        let last = log.tail(1).unwrap().remove(0);
        assert_eq!(last.event, EventType::Decision);
        assert!(last.message.contains("3 entries removed"));
    }
}
