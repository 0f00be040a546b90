//! Worker capability: what the engine needs from application worker types

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, trace};

use crate::backend::QueueError;
use crate::job::Job;
use crate::queue::Queue;

/// Error a handler returns to fail a job
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Return value on success, failure reason otherwise
pub type HandlerResult = Result<serde_json::Value, HandlerError>;

/// Identity of a running worker instance, handed to every hook.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WorkerInfo {
    /// Worker type name
    pub worker: String,
    /// Replica id, contiguous from 1 within a worker type
    pub replica: u32,
    pub queue: String,
}

impl fmt::Display for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(#{}):{}", self.worker, self.replica, self.queue)
    }
}

/// Application worker type.
///
/// One value is constructed per replica. Lifecycle hooks are invoked
/// synchronously, exactly once per transition, by the runtime driving the
/// instance; the defaults only log.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Worker type name used in logs and [`WorkerInfo`]
    fn name(&self) -> &str;

    /// Queue to consume, `None` for the process-wide default queue
    fn queue_name(&self) -> Option<&str> {
        None
    }

    /// Jobs processed in parallel by one instance, `None` for the configured default
    fn concurrency(&self) -> Option<usize> {
        None
    }

    /// Called when the pool has built this instance, before its queue is opened
    fn on_created(&self, info: &WorkerInfo) {
        debug!(worker = %info, "Worker created");
    }

    /// Called once the instance's runtime is running
    fn on_booted(&self, _info: &WorkerInfo) {}

    /// Process one job. An `Err` (or a panic) fails the attempt.
    async fn handle(&self, job: &Job, ctx: &JobContext) -> HandlerResult;

    fn on_completed(&self, info: &WorkerInfo, job: &Job, return_value: &serde_json::Value) {
        debug!(
            worker = %info,
            job_id = %job.id,
            job_name = %job.name,
            "Job completed"
        );
        trace!(job_id = %job.id, return_value = %return_value, "Job return value");
    }

    fn on_progress(&self, info: &WorkerInfo, job: &Job, progress: &serde_json::Value) {
        trace!(worker = %info, job_id = %job.id, progress = %progress, "Job progress");
    }

    /// Fired for every failed attempt, retried or not
    fn on_failed(&self, info: &WorkerInfo, job: &Job, reason: &str) {
        error!(
            worker = %info,
            job_id = %job.id,
            job_name = %job.name,
            attempt = job.attempts_made + 1,
            reason = reason,
            "Job failed"
        );
    }

    /// Fired once when a failed job will not be retried
    fn on_failed_terminal(&self, _info: &WorkerInfo, _job: &Job, _reason: &str) {}

    fn on_drained(&self, info: &WorkerInfo) {
        info!(worker = %info, "Queue is empty");
    }

    fn on_error(&self, info: &WorkerInfo, error: &QueueError) {
        error!(worker = %info, error = %error, "Worker backend error");
    }
}

/// Handle given to a running handler.
pub struct JobContext {
    info: WorkerInfo,
    job: Job,
    queue: Queue,
    worker: Arc<dyn Worker>,
}

impl JobContext {
    pub(crate) fn new(info: WorkerInfo, job: Job, queue: Queue, worker: Arc<dyn Worker>) -> Self {
        Self {
            info,
            job,
            queue,
            worker,
        }
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Record progress on the job and fire the `progress` hook.
    /// The job's state does not change.
    pub async fn progress(&self, value: serde_json::Value) -> Result<(), QueueError> {
        self.queue.update_progress(&self.job.id, value.clone()).await?;
        self.worker.on_progress(&self.info, &self.job, &value);
        Ok(())
    }
}
