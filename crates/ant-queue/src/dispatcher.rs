//! Job dispatch: build a job, merge options over the defaults, push it

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};

use crate::backend::QueueError;
use crate::job::{Job, JobId, JobOptions, JobSettings, JobState, NewJob, RepeatOptions};
use crate::queue::Queue;
use crate::registry::QueueRegistry;
use crate::retry::RetryPolicy;

/// Dispatcher-wide job defaults (env: APP_QUEUE_RETRIES,
/// APP_QUEUE_REMOVE_COMPLETED, APP_QUEUE_REMOVE_FAILED).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDefaults {
    pub attempts: u32,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            attempts: 3,
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }
}

/// Reference to a dispatched job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: JobId,
    pub name: String,
    queue: Queue,
}

impl JobHandle {
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Current stored job, `None` once it has been removed.
    pub async fn job(&self) -> Result<Option<Job>, QueueError> {
        self.queue.get_job(&self.id).await
    }

    pub async fn state(&self) -> Result<Option<JobState>, QueueError> {
        Ok(self.job().await?.map(|job| job.state))
    }
}

/// Submits jobs onto queues.
///
/// The target queue is explicit: a dispatcher returned by
/// [`select_queue`](Self::select_queue) is bound to that queue, otherwise the
/// registry's default queue is used. Selecting a queue never changes what
/// other dispatchers target.
#[derive(Clone)]
pub struct JobDispatcher {
    registry: Arc<QueueRegistry>,
    defaults: JobDefaults,
    retry: RetryPolicy,
    selected: Option<String>,
}

impl JobDispatcher {
    pub fn new(registry: Arc<QueueRegistry>, defaults: JobDefaults, retry: RetryPolicy) -> Self {
        Self {
            registry,
            defaults,
            retry,
            selected: None,
        }
    }

    /// A dispatcher bound to `name` for subsequent calls.
    pub fn select_queue(&self, name: impl Into<String>) -> Self {
        Self {
            selected: Some(name.into()),
            ..self.clone()
        }
    }

    pub fn selected_queue(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    /// Merge caller overrides over the dispatcher defaults.
    pub fn settings(&self, options: &JobOptions) -> JobSettings {
        JobSettings {
            attempts: options.attempts.unwrap_or(self.defaults.attempts),
            backoff: options.backoff.or_else(|| self.retry.default_backoff()),
            remove_on_complete: options
                .remove_on_complete
                .unwrap_or(self.defaults.remove_on_complete),
            remove_on_fail: options.remove_on_fail.unwrap_or(self.defaults.remove_on_fail),
            repeat: options.repeat,
        }
    }

    /// Enqueue with default options.
    pub async fn add<P: Serialize>(&self, name: &str, payload: &P) -> Result<JobHandle, QueueError> {
        self.enqueue(name, payload, JobOptions::default()).await
    }

    pub async fn enqueue<P: Serialize>(
        &self,
        name: &str,
        payload: &P,
        options: JobOptions,
    ) -> Result<JobHandle, QueueError> {
        if name.trim().is_empty() {
            return Err(QueueError::InvalidJob("job name must not be empty".into()));
        }
        let payload = serde_json::to_value(payload)?;
        let queue = self.registry.resolve(self.selected.as_deref()).await?;

        debug!(job = name, queue = queue.name(), "Dispatching job");
        trace!(job = name, payload = %payload, "Job data");

        let settings = self.settings(&options);
        // The first occurrence of a repeatable job waits one interval
        let delay = options.delay.or(settings.repeat.map(|r| r.every));

        let mut job = NewJob::new(name, payload).with_settings(settings);
        job.delay = delay;

        let id = queue.push(job).await?;
        Ok(JobHandle {
            id,
            name: name.to_string(),
            queue,
        })
    }

    /// Schedule a recurring submission of the same job.
    pub async fn repeat<P: Serialize>(
        &self,
        name: &str,
        payload: &P,
        repeat: RepeatOptions,
    ) -> Result<JobHandle, QueueError> {
        self.enqueue(name, payload, JobOptions::default().repeat(repeat))
            .await
    }

    pub async fn active_count(&self, queue: &str) -> Result<usize, QueueError> {
        self.registry.get(queue).await?.active_count().await
    }

    pub async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        self.registry.get(queue).await?.pause().await
    }

    pub async fn resume(&self, queue: &str) -> Result<(), QueueError> {
        self.registry.get(queue).await?.resume().await
    }
}
