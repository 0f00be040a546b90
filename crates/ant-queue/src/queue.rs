//! Named queue handle bound to a shared backend

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::backend::{JobCounts, QueueBackend, QueueError, StalledReport};
use crate::job::{Job, JobId, JobState, NewJob};

struct QueueInner {
    name: String,
    key: String,
    backend: Arc<dyn QueueBackend>,
}

/// Cheap-to-clone handle to one logical queue.
///
/// Handles are created by [`QueueRegistry`](crate::registry::QueueRegistry);
/// clones share identity, see [`Queue::same_handle`].
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("key", &self.inner.key)
            .finish()
    }
}

/// Monitoring view of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub queue: String,
    pub counts: JobCounts,
    pub jobs: Vec<(JobState, Vec<Job>)>,
}

impl Queue {
    /// Namespaced backend key for a queue.
    pub fn key_for(prefix: &str, name: &str) -> String {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}:{name}")
        }
    }

    /// Prepares backend storage and returns the handle.
    pub async fn open(
        name: &str,
        prefix: &str,
        backend: Arc<dyn QueueBackend>,
    ) -> Result<Self, QueueError> {
        let key = Self::key_for(prefix, name);
        backend.open(&key).await?;
        tracing::debug!(queue = name, key = %key, "Queue opened");
        Ok(Self {
            inner: Arc::new(QueueInner {
                name: name.to_string(),
                key,
                backend,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.inner.backend
    }

    /// True when both handles were produced by the same construction.
    pub fn same_handle(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn push(&self, job: NewJob) -> Result<JobId, QueueError> {
        self.inner.backend.push(&self.inner.key, job).await
    }

    pub async fn pop(&self, lock: Duration) -> Result<Option<Job>, QueueError> {
        self.inner.backend.pop(&self.inner.key, lock).await
    }

    pub async fn extend_lock(&self, id: &JobId, lock: Duration) -> Result<bool, QueueError> {
        self.inner.backend.extend_lock(&self.inner.key, id, lock).await
    }

    pub async fn complete(
        &self,
        id: &JobId,
        return_value: serde_json::Value,
        remove: bool,
    ) -> Result<bool, QueueError> {
        self.inner
            .backend
            .complete(&self.inner.key, id, return_value, remove)
            .await
    }

    pub async fn retry(&self, id: &JobId, reason: &str, delay: Duration) -> Result<bool, QueueError> {
        self.inner
            .backend
            .retry(&self.inner.key, id, reason, delay)
            .await
    }

    pub async fn fail(&self, id: &JobId, reason: &str, remove: bool) -> Result<bool, QueueError> {
        self.inner
            .backend
            .fail(&self.inner.key, id, reason, remove)
            .await
    }

    pub async fn update_progress(
        &self,
        id: &JobId,
        progress: serde_json::Value,
    ) -> Result<(), QueueError> {
        self.inner
            .backend
            .update_progress(&self.inner.key, id, progress)
            .await
    }

    pub async fn pause(&self) -> Result<(), QueueError> {
        self.inner.backend.pause(&self.inner.key).await
    }

    pub async fn resume(&self) -> Result<(), QueueError> {
        self.inner.backend.resume(&self.inner.key).await
    }

    pub async fn is_paused(&self) -> Result<bool, QueueError> {
        self.inner.backend.is_paused(&self.inner.key).await
    }

    pub async fn active_count(&self) -> Result<usize, QueueError> {
        self.inner
            .backend
            .count(&self.inner.key, JobState::Active)
            .await
    }

    pub async fn count(&self, state: JobState) -> Result<usize, QueueError> {
        self.inner.backend.count(&self.inner.key, state).await
    }

    pub async fn counts(&self) -> Result<JobCounts, QueueError> {
        self.inner.backend.counts(&self.inner.key).await
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>, QueueError> {
        self.inner.backend.get_job(&self.inner.key, id).await
    }

    pub async fn jobs(&self, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError> {
        self.inner.backend.jobs(&self.inner.key, state, limit).await
    }

    pub async fn clean(&self, grace: Duration, state: JobState) -> Result<usize, QueueError> {
        self.inner.backend.clean(&self.inner.key, grace, state).await
    }

    pub async fn recover_stalled(&self, max_stalled_count: u32) -> Result<StalledReport, QueueError> {
        self.inner
            .backend
            .recover_stalled(&self.inner.key, max_stalled_count)
            .await
    }

    /// Counts plus up to `limit` jobs for each requested state
    /// (all states when `states` is empty).
    pub async fn snapshot(
        &self,
        states: &[JobState],
        limit: usize,
    ) -> Result<QueueSnapshot, QueueError> {
        let states: &[JobState] = if states.is_empty() {
            &JobState::ALL
        } else {
            states
        };

        let mut jobs = Vec::with_capacity(states.len());
        for state in states {
            jobs.push((*state, self.jobs(*state, limit).await?));
        }

        Ok(QueueSnapshot {
            queue: self.inner.name.clone(),
            counts: self.counts().await?,
            jobs,
        })
    }
}
