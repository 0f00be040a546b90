//! Ant - worker process and operator CLI for Ant job queues
//!
//! # Usage
//!
//! ```bash
//! # Run the worker pool until SIGINT/SIGTERM
//! ant work
//!
//! # Submit a job to the default queue, or to a named one
//! ant dispatch probe.echo '{"hello": "ant"}'
//! ant dispatch probe.sleep '{"ms": 2000}' --queue reports --delay-ms 500
//!
//! # Inspect a queue
//! ant monitor --queue default --state failed
//! ```
//!
//! Engine settings come from `REDIS_*` and `APP_QUEUE_*` environment keys.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod probe;

use commands::{dispatch, monitor, work};

/// Ant job queue
///
/// Runs queue workers and inspects or feeds the queues they consume.
#[derive(Parser)]
#[command(name = "ant", version, about = "Ant job queue worker and operator CLI")]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker pool
    #[command(name = "work")]
    Work(work::WorkArgs),

    /// Submit a job
    #[command(name = "dispatch")]
    Dispatch(dispatch::DispatchArgs),

    /// Show job counts and jobs of a queue
    #[command(name = "monitor")]
    Monitor(monitor::MonitorArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Work(args) => work::run(args).await,
        Commands::Dispatch(args) => dispatch::run(args).await,
        Commands::Monitor(args) => monitor::run(args).await,
    }
}

/// Setup logging based on verbosity level; `RUST_LOG` wins when set
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = match verbosity {
        0 => "info",
        1 => "info,ant_queue=debug,ant_persist=debug",
        _ => "debug,ant_queue=trace,ant_persist=trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
