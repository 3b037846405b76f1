//! Saída de terminal do jobconductor: relatório de status e barra de
//! progresso do coletor.
//!
//! Usa `console` para estilização com cores e `indicatif` para a barra de
//! progresso. O [`StatusReport`] reúne tudo o que o operador precisa para
//! diagnosticar um job parado sem abrir os arquivos à mão.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::collector::CollectPass;
use crate::config::ConductorConfig;
use crate::error::Result;
use crate::execution_log::{ExecutionLog, LogEntry};
use crate::routing::RoutingStrategy;
use crate::state_machine::{JobPaths, JobStatus, WorkOrder};
use crate::store::{Backlog, TaskBroker};

const RECENT_LOG_ENTRIES: usize = 5;

/// Fotografia do estado de um job: work order, backlog, filas e log recente.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub job_id: String,
    pub name: String,
    pub status: JobStatus,
    pub strategy: RoutingStrategy,
    pub dispatched: usize,
    pub backlog: usize,
    pub completed: usize,
    pub failed: usize,
    pub progress_pct: Option<f64>,
    pub metal_queue: (String, usize),
    pub cloud_queue: (String, usize),
    pub paths: JobPaths,
    pub recent: Vec<LogEntry>,
}

impl StatusReport {
    pub fn gather<S: Backlog + TaskBroker>(
        store: &S,
        work_order_path: &Path,
        config: &ConductorConfig,
    ) -> Result<Self> {
        let order = WorkOrder::load(work_order_path)?;
        let paths = order.paths(work_order_path);
        let recent = ExecutionLog::open(&paths.execution_log)?.tail(RECENT_LOG_ENTRIES)?;
        Ok(Self {
            backlog: store.backlog_len(&order.backlog_key)?,
            metal_queue: (
                config.metal.queue.clone(),
                store.queue_depth(&config.metal.queue)?,
            ),
            cloud_queue: (
                config.cloud.queue.clone(),
                store.queue_depth(&config.cloud.queue)?,
            ),
            progress_pct: order.progress_pct(),
            job_id: order.job_id,
            name: order.name,
            status: order.status,
            strategy: order.routing_strategy,
            dispatched: order.execution.tasks_dispatched,
            completed: order.execution.tasks_completed,
            failed: order.execution.tasks_failed,
            paths,
            recent,
        })
    }
}

/// Texto pronto para o terminal. Cores só aparecem quando a saída é um TTY.
impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bold = Style::new().bold();
        let dim = Style::new().dim();
        let status_style = match self.status {
            JobStatus::Completed => Style::new().green().bold(),
            JobStatus::Failed => Style::new().red().bold(),
            JobStatus::Running => Style::new().cyan().bold(),
            JobStatus::Pending => Style::new().yellow(),
        };

        writeln!(f, "{}", bold.apply_to(format!("─── Job {} ───", self.job_id)))?;
        writeln!(f, "  Name:        {}", self.name)?;
        writeln!(f, "  Status:      {}", status_style.apply_to(self.status))?;
        writeln!(f, "  Strategy:    {}", self.strategy)?;
        writeln!(f, "  Dispatched:  {}", self.dispatched)?;
        writeln!(f, "  Backlog:     {}", self.backlog)?;
        writeln!(f, "  Completed:   {}", self.completed)?;
        writeln!(f, "  Failed:      {}", self.failed)?;
        if let Some(pct) = self.progress_pct {
            writeln!(f, "  Progress:    {pct:.1}%")?;
        }
        writeln!(
            f,
            "  Queues:      {} = {}, {} = {}",
            self.metal_queue.0, self.metal_queue.1, self.cloud_queue.0, self.cloud_queue.1
        )?;
        writeln!(f, "  Work order:  {}", self.paths.work_order.display())?;
        writeln!(f, "  Results:     {}", self.paths.results.display())?;
        writeln!(f, "  Log:         {}", self.paths.execution_log.display())?;

        if !self.recent.is_empty() {
            writeln!(f)?;
            writeln!(f, "{}", bold.apply_to("Recent activity"))?;
            for entry in &self.recent {
                writeln!(f, "  {}", dim.apply_to(entry))?;
            }
        }
        Ok(())
    }
}

/// Barra de progresso do coletor: completados sobre despachados.
pub struct CollectProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
}

impl CollectProgress {
    pub fn start(job_id: &str) -> Self {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.set_message(format!("collecting {job_id}"));
        pb.enable_steady_tick(Duration::from_millis(120));
        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
        }
    }

    pub fn update(&self, pass: &CollectPass) {
        self.pb.set_length(pass.dispatched as u64);
        self.pb.set_position(pass.observed as u64);
        if pass.new_records > 0 {
            self.pb.set_message(format!("{} failed", pass.failed));
        }
    }

    /// Finaliza a barra e imprime o resumo colorido.
    pub fn finish(&self, pass: &CollectPass) {
        self.pb.finish_and_clear();
        let succeeded = pass.observed.saturating_sub(pass.failed);
        println!(
            "  {} {succeeded} succeeded, {} {} failed",
            self.green.apply_to("✓"),
            self.red.apply_to("✗"),
            pass.failed
        );
    }

    pub fn abandon(&self) {
        self.pb.abandon();
    }
}
