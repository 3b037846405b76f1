mod cli;

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Command};
use jobconductor::collector::ResultCollector;
use jobconductor::conductor::Conductor;
use jobconductor::config::ConductorConfig;
use jobconductor::dispatcher::{Dispatcher, flush_backlog};
use jobconductor::package::create_job;
use jobconductor::store::SqliteStore;
use jobconductor::ui::{CollectProgress, StatusReport};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "jobconductor=debug"
    } else {
        "jobconductor=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(fmt::layer().with_writer(io::stderr))
        .init();
}

fn open_store(config: &ConductorConfig) -> Result<SqliteStore> {
    let store = SqliteStore::open(&config.store_path)?;
    info!(path = %config.store_path.display(), "store opened");
    Ok(store)
}

async fn run(cli: Cli) -> Result<()> {
    let mut config =
        ConductorConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    match cli.command {
        Command::New {
            name,
            manifest,
            strategy,
            jobs_dir,
        } => {
            let path = create_job(&jobs_dir, &name, &manifest, strategy.into())
                .with_context(|| format!("packaging job `{name}`"))?;
            println!("{}", path.display());
        }

        Command::Dispatch {
            work_order,
            dry_run,
        } => {
            let mut store = open_store(&config)?;
            let report = Dispatcher::new(&mut store, &config.routing)
                .dispatch(&work_order, dry_run)
                .with_context(|| format!("dispatching {}", work_order.display()))?;
            if report.dry_run {
                println!(
                    "Dry run: {} valid entries, {} skipped",
                    report.parsed, report.skipped
                );
            } else {
                println!(
                    "Dispatched {} entries ({} skipped)",
                    report.pushed, report.skipped
                );
            }
        }

        Command::Conduct { work_order } => {
            let store = open_store(&config)?;
            let mut conductor = Conductor::from_config(store, &config, &work_order)
                .with_context(|| format!("loading {}", work_order.display()))?;
            tokio::select! {
                result = conductor.run() => {
                    let order = result?;
                    println!(
                        "Job {} drained: {} dispatched",
                        order.job_id, order.execution.tasks_dispatched
                    );
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted, conductor stopping");
                }
            }
        }

        Command::Collect {
            work_order,
            interval,
        } => {
            let store = open_store(&config)?;
            let mut collector = ResultCollector::new(&store, &work_order)
                .with_context(|| format!("loading {}", work_order.display()))?;
            let progress = CollectProgress::start(&collector.work_order().job_id);
            tokio::select! {
                result = collector.run(Duration::from_secs(interval), |pass| progress.update(pass)) => {
                    progress.finish(&result?);
                }
                _ = tokio::signal::ctrl_c() => {
                    progress.abandon();
                    warn!("interrupted, collector stopping");
                }
            }
        }

        Command::Status { work_order } => {
            let store = open_store(&config)?;
            let report = StatusReport::gather(&store, &work_order, &config)
                .with_context(|| format!("reading {}", work_order.display()))?;
            print!("{report}");
        }

        Command::Flush {
            work_order,
            dry_run,
            force,
        } => {
            let mut store = open_store(&config)?;
            flush(&mut store, &work_order, dry_run, force)?;
        }
    }
    Ok(())
}

fn flush(store: &mut SqliteStore, work_order: &Path, dry_run: bool, force: bool) -> Result<()> {
    let pending = flush_backlog(store, work_order, true)?;
    println!("Backlog holds {pending} entries");
    if dry_run || pending == 0 {
        return Ok(());
    }
    if !force && !confirm(&format!("Delete all {pending} entries?"))? {
        println!("Aborted");
        return Ok(());
    }
    let removed = flush_backlog(store, work_order, false)?;
    println!("Removed {removed} entries");
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
