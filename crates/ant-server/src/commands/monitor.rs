//! Monitor command - show counts and jobs of one queue
//!
//! Usage:
//! ```bash
//! ant monitor
//! ant monitor --queue reports --state failed --limit 20
//! ant monitor --json
//! ```

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};

use ant_queue::{EngineConfig, Job, JobState, QueueSnapshot};

use super::connect;

/// Arguments for the monitor command
#[derive(Args)]
pub struct MonitorArgs {
    /// Queue to inspect (default: APP_DEFAULT_QUEUE)
    #[arg(long)]
    queue: Option<String>,

    /// Only list jobs in this state (waiting, delayed, active, completed, failed)
    #[arg(long)]
    state: Option<JobState>,

    /// Jobs listed per state
    #[arg(long, default_value_t = 10)]
    limit: usize,

    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

/// Run the monitor command
pub async fn run(args: MonitorArgs) -> Result<()> {
    let config = EngineConfig::from_env().context("Invalid queue configuration")?;
    let registry = connect(&config).await?;

    let queue = registry
        .resolve(args.queue.as_deref())
        .await
        .context("Unable to open queue")?;
    let states: Vec<JobState> = args.state.into_iter().collect();
    let snapshot = queue.snapshot(&states, args.limit).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_snapshot(&snapshot);
    }
    Ok(())
}

fn state_color(state: JobState) -> Color {
    match state {
        JobState::Waiting => Color::White,
        JobState::Delayed => Color::Yellow,
        JobState::Active => Color::Blue,
        JobState::Completed => Color::Green,
        JobState::Failed => Color::Red,
    }
}

fn print_snapshot(snapshot: &QueueSnapshot) {
    let paused = if snapshot.counts.paused {
        " (paused)".yellow().to_string()
    } else {
        String::new()
    };
    println!("{}{}", format!("Queue {}", snapshot.queue).bold().cyan(), paused);
    println!();

    let mut counts = Table::new();
    counts
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("State").fg(Color::Cyan),
            Cell::new("Jobs").fg(Color::Cyan),
        ]);
    for state in JobState::ALL {
        counts.add_row(vec![
            Cell::new(state).fg(state_color(state)),
            Cell::new(snapshot.counts.get(state)),
        ]);
    }
    println!("{counts}");

    for (state, jobs) in &snapshot.jobs {
        if jobs.is_empty() {
            continue;
        }
        println!();
        println!("{}", format!("{state} jobs").bold());
        println!("{}", jobs_table(jobs));
    }
}

fn jobs_table(jobs: &[Job]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Id").fg(Color::Cyan),
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Attempts").fg(Color::Cyan),
            Cell::new("Created").fg(Color::Cyan),
            Cell::new("Detail").fg(Color::Cyan),
        ]);

    for job in jobs {
        let detail = match (&job.failed_reason, &job.progress) {
            (Some(reason), _) => reason.clone(),
            (None, Some(progress)) => format!("progress {progress}"),
            (None, None) => String::new(),
        };
        table.add_row(vec![
            Cell::new(&job.id),
            Cell::new(&job.name).fg(Color::Green),
            Cell::new(format!("{}/{}", job.attempts_made, job.settings.attempts)),
            Cell::new(job.created_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(detail).fg(state_color(job.state)),
        ]);
    }
    table
}
