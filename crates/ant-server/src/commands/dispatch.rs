//! Dispatch command - submit one job
//!
//! Usage:
//! ```bash
//! ant dispatch probe.echo '{"hello": "ant"}'
//! ant dispatch probe.fail '{}' --queue reports --attempts 5
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use ant_queue::{EngineConfig, JobDispatcher, JobOptions};

use super::connect;

/// Arguments for the dispatch command
#[derive(Args)]
pub struct DispatchArgs {
    /// Job name
    job: String,

    /// JSON payload
    #[arg(default_value = "{}")]
    payload: String,

    /// Target queue (default: APP_DEFAULT_QUEUE)
    #[arg(long)]
    queue: Option<String>,

    /// Delay before the job becomes ready, in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Maximum attempts (default: APP_QUEUE_RETRIES)
    #[arg(long)]
    attempts: Option<u32>,
}

/// Run the dispatch command
pub async fn run(args: DispatchArgs) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&args.payload)
        .with_context(|| format!("Invalid JSON: {}", args.payload))?;

    let config = EngineConfig::from_env().context("Invalid queue configuration")?;
    let registry = connect(&config).await?;

    let mut dispatcher = JobDispatcher::new(registry, config.jobs, config.retry);
    if let Some(queue) = &args.queue {
        dispatcher = dispatcher.select_queue(queue.as_str());
    }

    let mut options = JobOptions::new();
    if let Some(ms) = args.delay_ms {
        options = options.delay(Duration::from_millis(ms));
    }
    if let Some(attempts) = args.attempts {
        options = options.attempts(attempts);
    }

    let handle = dispatcher
        .enqueue(&args.job, &payload, options)
        .await
        .with_context(|| format!("Failed to dispatch job '{}'", args.job))?;

    println!(
        "{} Dispatched {} as job {} on queue {}",
        "✓".green().bold(),
        handle.name.green(),
        handle.id.to_string().bold(),
        handle.queue().name().cyan()
    );
    Ok(())
}
