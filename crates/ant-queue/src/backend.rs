//! Queue Backend Trait

use crate::job::{Job, JobId, JobState, NewJob};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Backend connection failed: {0}")]
    Connection(String),
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("No queue selected and no default queue configured")]
    NoQueueConfigured,
    #[error("Invalid job: {0}")]
    InvalidJob(String),
    #[error("Invalid queue: {0}")]
    InvalidQueue(String),
}

impl QueueError {
    /// Connection failures are unrecoverable for the process.
    pub fn is_connection(&self) -> bool {
        matches!(self, QueueError::Connection(_))
    }
}

/// Job counts for one queue, keyed by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: bool,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Delayed => self.delayed,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }

    /// Jobs that still have work ahead of them.
    pub fn pending(&self) -> usize {
        self.waiting + self.delayed + self.active
    }
}

/// Outcome of one stalled-job sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalledReport {
    /// Moved back to waiting
    pub requeued: Vec<JobId>,
    /// Exceeded the stall limit and were failed
    pub failed: Vec<JobId>,
}

impl StalledReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

pub const STALLED_LIMIT_REASON: &str = "job stalled more than allowable limit";

/// Atomic, persistent, multi-consumer queue store.
///
/// Every method takes the fully namespaced queue key (`{prefix}:{name}`).
/// Implementations must guarantee that `pop` never hands the same job to two
/// callers. Transitions on a job that is no longer active (for example a job
/// the stalled sweep already reclaimed) are ignored and reported as `false`.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Prepare storage for a queue. Called once per queue handle.
    async fn open(&self, queue: &str) -> Result<(), QueueError>;

    /// Append a job as waiting, or delayed when it carries a delay
    async fn push(&self, queue: &str, job: NewJob) -> Result<JobId, QueueError>;

    /// Atomically claim the next ready job and lock it for `lock`.
    /// Returns `None` when nothing is ready or the queue is paused.
    async fn pop(&self, queue: &str, lock: Duration) -> Result<Option<Job>, QueueError>;

    /// Renew the lock of an active job. `false` if the job is no longer active.
    async fn extend_lock(&self, queue: &str, id: &JobId, lock: Duration)
        -> Result<bool, QueueError>;

    /// Move an active job to completed. `false` if the job was not active.
    async fn complete(
        &self,
        queue: &str,
        id: &JobId,
        return_value: serde_json::Value,
        remove: bool,
    ) -> Result<bool, QueueError>;

    /// Count the failed attempt and schedule the job again after `delay`
    async fn retry(
        &self,
        queue: &str,
        id: &JobId,
        reason: &str,
        delay: Duration,
    ) -> Result<bool, QueueError>;

    /// Count the failed attempt and move the job to its terminal failed state
    async fn fail(&self, queue: &str, id: &JobId, reason: &str, remove: bool)
        -> Result<bool, QueueError>;

    async fn update_progress(
        &self,
        queue: &str,
        id: &JobId,
        progress: serde_json::Value,
    ) -> Result<(), QueueError>;

    async fn pause(&self, queue: &str) -> Result<(), QueueError>;

    async fn resume(&self, queue: &str) -> Result<(), QueueError>;

    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError>;

    async fn count(&self, queue: &str, state: JobState) -> Result<usize, QueueError>;

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>, QueueError>;

    /// Up to `limit` jobs currently in `state`
    async fn jobs(&self, queue: &str, state: JobState, limit: usize)
        -> Result<Vec<Job>, QueueError>;

    /// Remove finished jobs in `state` that finished more than `grace` ago
    async fn clean(&self, queue: &str, grace: Duration, state: JobState)
        -> Result<usize, QueueError>;

    /// Reclaim active jobs whose lock expired
    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
    ) -> Result<StalledReport, QueueError>;

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        Ok(JobCounts {
            waiting: self.count(queue, JobState::Waiting).await?,
            delayed: self.count(queue, JobState::Delayed).await?,
            active: self.count(queue, JobState::Active).await?,
            completed: self.count(queue, JobState::Completed).await?,
            failed: self.count(queue, JobState::Failed).await?,
            paused: self.is_paused(queue).await?,
        })
    }
}
