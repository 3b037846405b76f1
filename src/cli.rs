//! Interface de linha de comando do jobconductor baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (new, dispatch,
//! conduct, collect, status, flush) e flags globais (--config, --store,
//! --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use jobconductor::routing::RoutingStrategy;

/// Hybrid job conductor: drains a job backlog into a local worker pool and a
/// rate-limited cloud pool.
#[derive(Debug, Parser)]
#[command(name = "jobconductor", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração TOML (padrão: ./jobconductor.toml, se existir).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Banco SQLite do backlog e das filas; sobrepõe config e JOBCONDUCTOR_STORE.
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Estratégia de roteamento aceita pela CLI, mapeada para [`RoutingStrategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    /// Fill metal first, overflow to cloud within budget.
    #[value(name = "hybrid_supervisor")]
    HybridSupervisor,
    /// Every task goes to the metal pool.
    #[value(name = "force_metal")]
    ForceMetal,
    /// Every task goes to the cloud pool.
    #[value(name = "force_cloud")]
    ForceCloud,
}

impl From<StrategyArg> for RoutingStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::HybridSupervisor => RoutingStrategy::HybridSupervisor,
            StrategyArg::ForceMetal => RoutingStrategy::ForceMetal,
            StrategyArg::ForceCloud => RoutingStrategy::ForceCloud,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Package a manifest into a new job directory.
    New {
        /// Job name (letters, digits and underscores).
        name: String,

        /// Manifest file, one JSON task per line.
        #[arg(long)]
        manifest: PathBuf,

        #[arg(long, value_enum, default_value_t = StrategyArg::HybridSupervisor)]
        strategy: StrategyArg,

        /// Directory the job directory is created in.
        #[arg(long, default_value = "jobs")]
        jobs_dir: PathBuf,
    },

    /// Load the job's manifest into its backlog.
    Dispatch {
        work_order: PathBuf,

        /// Validate the manifest without touching the backlog or work order.
        #[arg(long)]
        dry_run: bool,
    },

    /// Drain the backlog into the worker queues until it is empty.
    Conduct { work_order: PathBuf },

    /// Record terminal task results until every dispatched task is accounted for.
    Collect {
        work_order: PathBuf,

        /// Seconds between polls.
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },

    /// Show work order counters, backlog and queue depths, and recent log lines.
    Status { work_order: PathBuf },

    /// Delete every pending entry from the job's backlog.
    Flush {
        work_order: PathBuf,

        /// Only report how many entries would be removed.
        #[arg(long)]
        dry_run: bool,

        /// Skip the confirmation prompt.
        #[arg(long, short)]
        force: bool,
    },
}
