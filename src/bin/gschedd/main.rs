use clap::Parser;
use gsched::core::scheduler::GpuScheduler;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::GSchedd::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(args.verbose.tracing_level_filter().into())
        .from_env_lossy();
    let _guard = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "gschedd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    };

    let mut config = gsched::config::load_config(args.config.as_ref())?;

    // CLI flags override the config file
    if let Some(root) = args.root {
        config.scheduler.root_dir = root;
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.scheduler.max_concurrent = max_concurrent;
    }

    let scheduler = GpuScheduler::new(config.scheduler, config.priority)?;

    // Reconcile whatever a previous run left in running/ and to_run/.
    scheduler.recover().await?;

    if config.decay.interval_sec > 0 {
        let ledger = scheduler.ledger().clone();
        let factor = config.decay.factor;
        let interval = Duration::from_secs(config.decay.interval_sec);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // fires immediately; skip the first sweep
            loop {
                ticker.tick().await;
                tracing::info!(factor, "running fair-share decay sweep");
                ledger.decay(factor).await;
            }
        });
    }

    let loop_handle = tokio::spawn(scheduler.clone().run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested; no further admissions");
    scheduler.stop();
    loop_handle.await?;

    Ok(())
}
