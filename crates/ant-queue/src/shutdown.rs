//! Graceful drain: stop intake on every queue, then wait for active jobs

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::backend::QueueError;
use crate::registry::QueueRegistry;

pub struct ShutdownCoordinator {
    registry: Arc<QueueRegistry>,
    poll_interval: Duration,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<QueueRegistry>, poll_interval: Duration) -> Self {
        Self {
            registry,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Pause every queue the process has referenced and resolve once none of
    /// them has an active job. Resolves immediately when no queue exists.
    ///
    /// Pausing is global to the queue namespace, so other processes consuming
    /// the same queues stop pulling too until the queues are resumed.
    pub async fn drain(&self) -> Result<(), QueueError> {
        let queues = self.registry.queues().await;
        if queues.is_empty() {
            return Ok(());
        }

        for queue in &queues {
            info!(queue = queue.name(), "Stopping queue");
            queue.pause().await?;
        }

        loop {
            let mut active = 0;
            for queue in &queues {
                active += queue.active_count().await?;
            }
            if active == 0 {
                break;
            }
            debug!(active, "Waiting for active jobs to finish");
            tokio::time::sleep(self.poll_interval).await;
        }

        info!(queues = queues.len(), "All queues drained");
        Ok(())
    }
}
