use clap::Parser;
use gsched::core::daemon::MockSlurmDaemon;
use gsched::core::priority::PriorityEngine;
use gsched::core::usage::UsageLedger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Slurmletd::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(args.verbose.tracing_level_filter().into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = gsched::config::load_config(args.config.as_ref())?;

    // CLI flags override the config file
    if let Some(jobs_dir) = args.jobs_dir {
        config.daemon.jobs_dir = jobs_dir;
    }
    if let Some(quantum) = args.quantum {
        config.daemon.quantum_sec = quantum;
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.daemon.max_concurrent = max_concurrent;
    }

    let ledger = match &config.scheduler.ledger_path {
        Some(path) => Arc::new(UsageLedger::with_path(path)),
        None => Arc::new(UsageLedger::in_memory()),
    };
    let check_interval = Duration::from_secs(config.daemon.check_interval_sec.max(1));
    let daemon = Arc::new(MockSlurmDaemon::new(
        config.daemon,
        PriorityEngine::new(config.priority),
        ledger,
    )?);

    tracing::info!(
        jobs_dir = %daemon.jobs_dir().display(),
        interval = ?check_interval,
        "mock-SLURM daemon started [priority-based, non-preemptive]"
    );

    let stop = Arc::new(Notify::new());
    let ticker = {
        let daemon = Arc::clone(&daemon);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop.notified() => break,
                }
                if let Err(e) = daemon.tick().await {
                    tracing::error!("tick failed: {:#}", e);
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("mock-SLURM daemon stopped");
    stop.notify_one();
    ticker.await?;

    Ok(())
}
