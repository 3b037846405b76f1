use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::ConductorConfig;
use crate::error::{ConductorError, Result};
use crate::execution_log::ExecutionLog;
use crate::manifest::ManifestEntry;
use crate::rate_budget::{Clock, RateBudget, SystemClock};
use crate::routing::{Destination, RoutingStrategy, RoutingTable};
use crate::state_machine::{JobStatus, Phase, Step, WorkOrder};
use crate::store::{Backlog, Submission, TaskBroker};

/// Queue names, caps and pacing for one conductor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConductorSettings {
    pub metal_queue: String,
    pub metal_depth_cap: usize,
    pub cloud_queue: String,
    pub cloud_depth_cap: usize,
    pub backoff: Duration,
}

impl From<&ConductorConfig> for ConductorSettings {
    fn from(config: &ConductorConfig) -> Self {
        Self {
            metal_queue: config.metal.queue.clone(),
            metal_depth_cap: config.metal.depth_cap,
            cloud_queue: config.cloud.queue.clone(),
            cloud_depth_cap: config.cloud.depth_cap,
            backoff: config.backoff(),
        }
    }
}

impl ConductorSettings {
    fn queue(&self, destination: Destination) -> &str {
        match destination {
            Destination::Metal => &self.metal_queue,
            Destination::Cloud => &self.cloud_queue,
        }
    }
}

/// Why an entry went where it went.
#[derive(Debug, Clone, Copy)]
enum Reason {
    Forced(RoutingStrategy),
    MetalAvailable { depth: usize },
    CloudOverflow { metal_depth: usize },
}

/// Drains one job's backlog into the metal and cloud worker queues.
///
/// Metal is filled up to its depth cap first; overflow goes to cloud while
/// the cloud queue has room and the [`RateBudget`] holds a token. When
/// neither pool can take work the loop backs off and retries. The run ends
/// once the backlog is observed empty.
pub struct Conductor<S, C: Clock = SystemClock> {
    store: S,
    budget: RateBudget<C>,
    routing: RoutingTable,
    settings: ConductorSettings,
    work_order_path: PathBuf,
    work_order: WorkOrder,
    log: ExecutionLog,
    phase: Phase,
    waiting_announced: bool,
}

impl<S: Backlog + TaskBroker> Conductor<S, SystemClock> {
    pub fn from_config(store: S, config: &ConductorConfig, work_order_path: &Path) -> Result<Self> {
        let budget = RateBudget::new(config.cloud.bucket_capacity, config.cloud.refill_per_sec());
        Self::new(
            store,
            work_order_path,
            ConductorSettings::from(config),
            config.routing.clone(),
            budget,
        )
    }
}

impl<S: Backlog + TaskBroker, C: Clock> Conductor<S, C> {
    pub fn new(
        store: S,
        work_order_path: &Path,
        settings: ConductorSettings,
        routing: RoutingTable,
        budget: RateBudget<C>,
    ) -> Result<Self> {
        let work_order = WorkOrder::load(work_order_path)?;
        let log = ExecutionLog::open(work_order.paths(work_order_path).execution_log)?;
        Ok(Self {
            store,
            budget,
            routing,
            settings,
            work_order_path: work_order_path.to_path_buf(),
            work_order,
            log,
            phase: Phase::Idle,
            waiting_announced: false,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn work_order(&self) -> &WorkOrder {
        &self.work_order
    }

    pub fn budget(&self) -> &RateBudget<C> {
        &self.budget
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Marks the job running and records the strategy in the execution log.
    pub fn start(&mut self) -> Result<()> {
        self.work_order = WorkOrder::update(&self.work_order_path, |wo| {
            wo.status = JobStatus::Running;
            wo.execution.started_at = Some(Utc::now());
        })?;
        let strategy = self.work_order.routing_strategy;
        self.log
            .decision(&format!("Conductor started with strategy: {strategy}"))?;
        info!(
            job_id = %self.work_order.job_id,
            %strategy,
            backlog_key = %self.work_order.backlog_key,
            "conductor started"
        );
        Ok(())
    }

    /// One iteration of the control loop.
    pub fn step(&mut self) -> Result<Step> {
        if self.phase.is_terminal() {
            return Ok(Step::Completed);
        }
        self.budget.refill();

        let pending = self.store.backlog_len(&self.work_order.backlog_key)?;
        let step = if pending == 0 {
            self.finish()?;
            Step::Completed
        } else {
            match self.work_order.routing_strategy {
                strategy @ RoutingStrategy::ForceMetal => {
                    self.route_one(Destination::Metal, Reason::Forced(strategy))?
                }
                strategy @ RoutingStrategy::ForceCloud => {
                    self.route_one(Destination::Cloud, Reason::Forced(strategy))?
                }
                RoutingStrategy::HybridSupervisor => self.route_hybrid()?,
            }
        };

        let next = self.phase.next(&step);
        if next != self.phase {
            debug!(from = %self.phase, to = %next, "phase changed");
            self.phase = next;
        }
        if !matches!(step, Step::Waiting) {
            self.waiting_announced = false;
        }
        Ok(step)
    }

    /// Runs until the backlog is drained. Returns the final work order.
    pub async fn run(&mut self) -> Result<WorkOrder> {
        self.start()?;
        loop {
            match self.step() {
                Ok(Step::Completed) => return Ok(self.work_order.clone()),
                Ok(Step::Waiting) => sleep(self.settings.backoff).await,
                Ok(Step::Routed { .. } | Step::Dropped) => tokio::task::yield_now().await,
                Err(err @ (ConductorError::Store(_) | ConductorError::Io(_))) => {
                    error!(error = %err, "conductor iteration failed, backing off");
                    sleep(self.settings.backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn route_hybrid(&mut self) -> Result<Step> {
        let metal_depth = self.store.queue_depth(&self.settings.metal_queue)?;
        if metal_depth < self.settings.metal_depth_cap {
            return self.route_one(
                Destination::Metal,
                Reason::MetalAvailable { depth: metal_depth },
            );
        }

        let cloud_depth = self.store.queue_depth(&self.settings.cloud_queue)?;
        if cloud_depth < self.settings.cloud_depth_cap && self.budget.has_token() {
            return self.route_one(Destination::Cloud, Reason::CloudOverflow { metal_depth });
        }

        debug!(
            metal_depth,
            cloud_depth,
            tokens = self.budget.tokens(),
            "both pools saturated"
        );
        if !self.waiting_announced {
            self.log.decision(&format!(
                "Waiting: metal full ({metal_depth}/{}), cloud {cloud_depth}/{}, budget {:.2}/{:.1}, next token in {:.1}s",
                self.settings.metal_depth_cap,
                self.settings.cloud_depth_cap,
                self.budget.tokens(),
                self.budget.capacity(),
                self.budget.wait_time().as_secs_f64(),
            ))?;
            self.waiting_announced = true;
        }
        Ok(Step::Waiting)
    }

    /// Pops the head entry and submits it to `destination`. Entries that
    /// cannot be parsed, resolved or submitted are logged FAILED and dropped.
    fn route_one(&mut self, destination: Destination, reason: Reason) -> Result<Step> {
        let backlog_key = self.work_order.backlog_key.clone();
        let Some(raw) = self.store.pop_head(&backlog_key)? else {
            // Another consumer emptied the backlog between the length check and the pop.
            return Ok(Step::Waiting);
        };

        let entry = match ManifestEntry::parse(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "dropping malformed backlog entry");
                self.log.task_pulled("Unknown", &backlog_key)?;
                self.log
                    .task_failed("Unknown", &format!("dropped malformed entry: {err}"))?;
                return Ok(Step::Dropped);
            }
        };
        let label = entry.label();
        self.log.task_pulled(&label, &backlog_key)?;

        let queue = self.settings.queue(destination).to_string();
        let submitted = self
            .routing
            .resolve(&entry.task, destination)
            .and_then(|task| {
                let submission = Submission {
                    job_id: &self.work_order.job_id,
                    task,
                    args: &entry.args,
                    kwargs: &entry.kwargs,
                };
                self.store.submit(&queue, &submission)
            });

        match submitted {
            Ok(task_id) => {
                if matches!(reason, Reason::CloudOverflow { .. }) {
                    self.budget.consume();
                }
                let why = self.describe(reason);
                self.log
                    .task_routed(&label, &queue, &format!("{why}; task_id={task_id}"))?;
                info!(task = %label, %destination, %queue, %task_id, "routed");
                Ok(Step::Routed {
                    destination,
                    task_id,
                })
            }
            Err(err) if err.is_recoverable() => {
                warn!(task = %label, %queue, error = %err, "dropping entry");
                self.log.task_failed(&label, &err.to_string())?;
                Ok(Step::Dropped)
            }
            Err(err) => Err(err),
        }
    }

    fn describe(&self, reason: Reason) -> String {
        match reason {
            Reason::Forced(strategy) => format!("Strategy: {strategy}"),
            Reason::MetalAvailable { depth } => format!(
                "Hybrid: metal available, depth {depth}/{}",
                self.settings.metal_depth_cap
            ),
            Reason::CloudOverflow { metal_depth } => format!(
                "Hybrid: metal full ({metal_depth}/{}), budget {:.2}/{:.1} remaining",
                self.settings.metal_depth_cap,
                self.budget.tokens(),
                self.budget.capacity()
            ),
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.work_order = WorkOrder::update(&self.work_order_path, |wo| {
            wo.status = JobStatus::Completed;
            wo.execution.completed_at = Some(Utc::now());
        })?;
        let execution = &self.work_order.execution;
        self.log.decision("Backlog drained. Job complete.")?;
        self.log.job_completed(
            &self.work_order.job_id,
            execution.tasks_dispatched,
            execution.tasks_completed,
            execution.tasks_failed,
        )?;
        info!(
            job_id = %self.work_order.job_id,
            dispatched = execution.tasks_dispatched,
            "backlog drained, job complete"
        );
        Ok(())
    }
}
