//! Work command - run the worker pool until a shutdown signal
//!
//! Usage:
//! ```bash
//! ant work
//! ant work --replicas 4 --concurrency 2
//! ```

use anyhow::{anyhow, Context, Result};
use clap::Args;
use tokio::signal;
use tracing::{error, info};

use ant_queue::config::{snake_case, MAX_CONCURRENCY};
use ant_queue::{EngineConfig, ShutdownCoordinator, WorkerPool};

use super::connect;
use crate::probe::ProbeWorker;

/// Arguments for the work command
#[derive(Args)]
pub struct WorkArgs {
    /// Instances per worker type (overrides APP_QUEUE_WORKERS_CONCURRENCY)
    #[arg(long)]
    replicas: Option<u32>,

    /// Jobs in flight per instance (overrides APP_QUEUE_JOB_CONCURRENCY)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Default queue for workers without their own (overrides APP_DEFAULT_QUEUE)
    #[arg(long)]
    queue: Option<String>,
}

/// Run the work command
pub async fn run(args: WorkArgs) -> Result<()> {
    let mut config = EngineConfig::from_env().context("Invalid queue configuration")?;
    if let Some(replicas) = args.replicas {
        config.worker.replicas = replicas;
    }
    if let Some(concurrency) = args.concurrency {
        config.worker.concurrency = concurrency.clamp(1, MAX_CONCURRENCY);
    }
    if let Some(queue) = args.queue {
        config.default_queue = snake_case(&queue);
    }

    info!(
        prefix = %config.prefix,
        default_queue = %config.default_queue,
        retry = %config.retry.strategy(),
        "Starting Ant workers"
    );

    let registry = connect(&config).await?;

    let mut pool = WorkerPool::from_config(registry.clone(), &config);
    pool.register::<ProbeWorker>();
    let mut fatal = pool
        .take_fatal_errors()
        .ok_or_else(|| anyhow!("fatal error channel already taken"))?;

    let started = pool.start().await?;
    info!(instances = started, "Workers started");

    tokio::select! {
        _ = shutdown_signal() => {}
        Some(lost) = fatal.recv() => {
            error!(worker = %lost.worker, error = %lost.error, "Backend connection lost, exiting");
            return Err(anyhow!("backend connection lost: {}", lost.error));
        }
    }

    if let Err(e) = ShutdownCoordinator::new(registry, config.drain_interval)
        .drain()
        .await
    {
        error!(error = %e, "Failed to drain queues");
    }
    pool.stop().await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
