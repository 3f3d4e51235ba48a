//! Pravah Edge Node
//!
//! Runs in one of three roles:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  primary (default)     supervises workers, runs the reaper      │
//! │    ├── worker 1        serves :PORT (SO_REUSEPORT)              │
//! │    ├── worker 2        serves :PORT                             │
//! │    └── worker N        serves :PORT                             │
//! │                                                                 │
//! │  standalone (--no-cluster)   serves and reaps in one process    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pravah::adapters::analytics::aggregate_worker_stats;
use pravah::cache::{CacheReaper, DurableTier};
use pravah::config::{Args, Command};
use pravah::proxy::EdgeServer;
use pravah::supervisor::{self, ProcessLauncher, ProcessSupervisor, ShutdownOutcome};
use pravah::{EdgeConfig, ServiceContext};

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = EdgeConfig::from_args(&args).context("invalid configuration")?;

    match args.command {
        Some(Command::Worker { id }) => run_worker(config, id).await,
        None if args.no_cluster => run_standalone(config).await,
        None => run_primary(config).await,
    }
}

// =============================================================================
// Roles
// =============================================================================

async fn run_primary(config: EdgeConfig) -> anyhow::Result<()> {
    info!("Starting Pravah primary");
    info!("  Listen: {}", config.server.addr());
    info!("  Workers: {}", config.supervisor.workers);
    info!("  Cache dir: {}", config.cache.dir.display());
    info!("  Redis: {}", if config.redis.is_some() { "enabled" } else { "disabled" });

    let durable = DurableTier::open(&config.cache.dir)
        .await
        .context("failed to open cache directory")?;
    let reaper = CacheReaper::new(durable);

    let launcher = ProcessLauncher::current_exe(EdgeConfig::worker_args())?;
    let mut primary = ProcessSupervisor::new(config.supervisor.clone(), Arc::new(launcher));
    primary.start().await.context("failed to start workers")?;

    let reaper_stop = CancellationToken::new();
    tokio::spawn(reaper.clone().run(config.cache.reap_interval, reaper_stop.clone()));

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            supervisor::termination_signal().await;
            info!("Termination signal received, shutting down");
            stop.cancel();
        });
    }
    primary.run(stop).await?;
    reaper_stop.cancel();

    let analytics = config.analytics_file.clone();
    let workers = config.supervisor.workers;
    let outcome = primary
        .shutdown(async move {
            reaper.sweep().await;
            if let Some(path) = analytics {
                if let Err(e) = aggregate_worker_stats(&path, workers).await {
                    warn!(error = %e, "Failed to aggregate analytics");
                }
            }
        })
        .await;

    match outcome {
        ShutdownOutcome::Clean => {
            info!("Primary shutdown complete");
            Ok(())
        }
        ShutdownOutcome::Forced => {
            warn!("Forced shutdown after timeout");
            std::process::exit(1);
        }
    }
}

async fn run_worker(config: EdgeConfig, id: usize) -> anyhow::Result<()> {
    info!(worker = id, pid = std::process::id(), "Starting worker");
    let ctx = ServiceContext::builder(config)
        .worker(id)
        .build()
        .await
        .context("failed to initialise worker")?;
    supervisor::worker::run(ctx).await?;
    Ok(())
}

async fn run_standalone(config: EdgeConfig) -> anyhow::Result<()> {
    info!("Starting Pravah in standalone mode on {}", config.server.addr());
    let reap_interval = config.cache.reap_interval;
    let ctx = ServiceContext::builder(config)
        .build()
        .await
        .context("failed to initialise edge node")?;

    let background = CancellationToken::new();
    ctx.start_background(background.clone()).await;
    let reaper = ctx.reaper();
    tokio::spawn(reaper.clone().run(reap_interval, background.clone()));

    let drain = CancellationToken::new();
    {
        let drain = drain.clone();
        tokio::spawn(async move {
            supervisor::termination_signal().await;
            info!("Termination signal received, draining");
            drain.cancel();
        });
    }

    let server = EdgeServer::bind(ctx.clone())?;
    server.serve(drain).await?;

    background.cancel();
    reaper.sweep().await;
    ctx.persist_stats().await;
    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "redis=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
