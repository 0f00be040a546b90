//! Stalled-job watchdog
//!
//! Reclaims jobs that were claimed active but whose lock expired, which
//! happens when the worker process crashed or hung mid-job. Only started when
//! retries are enabled.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::backend::{QueueError, StalledReport};
use crate::queue::Queue;
use crate::retry::RetryPolicy;

pub struct StalledWatchdog {
    queue: Queue,
    interval: Duration,
    max_stalled_count: u32,
}

impl StalledWatchdog {
    pub fn new(queue: Queue, policy: &RetryPolicy) -> Self {
        Self {
            queue,
            interval: policy.stalled_interval().max(Duration::from_millis(1)),
            max_stalled_count: policy.max_stalled_count(),
        }
    }

    /// One pass over the queue's active jobs.
    pub async fn sweep(&self) -> Result<StalledReport, QueueError> {
        let report = self.queue.recover_stalled(self.max_stalled_count).await?;
        if !report.requeued.is_empty() {
            warn!(
                queue = self.queue.name(),
                jobs = ?report.requeued,
                "Requeued stalled jobs"
            );
        }
        if !report.failed.is_empty() {
            error!(
                queue = self.queue.name(),
                jobs = ?report.failed,
                max_stalled_count = self.max_stalled_count,
                "Failed jobs that stalled too often"
            );
        }
        Ok(report)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(queue = self.queue.name(), interval_ms = self.interval.as_millis() as u64, "Stalled-job watchdog started");
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(queue = self.queue.name(), error = %e, "Stalled-job sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(queue = self.queue.name(), "Stalled-job watchdog stopped");
    }
}
