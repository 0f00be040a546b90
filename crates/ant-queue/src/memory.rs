//! In-memory queue backend with delayed scheduling and job locks

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::backend::{QueueBackend, QueueError, StalledReport, STALLED_LIMIT_REASON};
use crate::job::{time_after, time_before, Job, JobId, JobState, NewJob};

/// Heap entry for delayed jobs - earliest run_at first, then insertion order
#[derive(Debug, Clone, Eq, PartialEq)]
struct PriorityEntry {
    run_at: DateTime<Utc>,
    seq: u64,
    id: JobId,
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order: earlier run_at = higher priority
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    jobs: HashMap<JobId, Job>,
    waiting: VecDeque<JobId>,
    delayed: BinaryHeap<PriorityEntry>,
    /// Active job -> lock expiry
    locks: HashMap<JobId, DateTime<Utc>>,
    paused: bool,
}

impl QueueState {
    fn insert(&mut self, new: NewJob, now: DateTime<Utc>) -> JobId {
        self.next_id += 1;
        let id = JobId::from(self.next_id);
        let job = Job::from_new(id.clone(), new, now);

        match job.state {
            JobState::Delayed => self.schedule(&job),
            _ => self.waiting.push_back(id.clone()),
        }
        self.jobs.insert(id.clone(), job);
        id
    }

    fn schedule(&mut self, job: &Job) {
        self.next_id += 1;
        self.delayed.push(PriorityEntry {
            run_at: job.run_at,
            seq: self.next_id,
            id: job.id.clone(),
        });
    }

    /// Move every delayed job whose time has come to the waiting list.
    fn promote(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.delayed.peek() {
            if entry.run_at > now {
                break;
            }
            let entry = match self.delayed.pop() {
                Some(entry) => entry,
                None => break,
            };
            if let Some(job) = self.jobs.get_mut(&entry.id) {
                // Skip entries left behind by a reschedule
                if job.state == JobState::Delayed && job.run_at == entry.run_at {
                    job.state = JobState::Waiting;
                    self.waiting.push_back(entry.id);
                }
            }
        }
    }

    /// Active job lookup; `None` means the transition should be ignored.
    fn release(&mut self, id: &JobId) -> Result<Option<&mut Job>, QueueError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if job.state != JobState::Active {
            tracing::debug!(job_id = %id, state = %job.state, "Ignoring transition on inactive job");
            return Ok(None);
        }
        self.locks.remove(id);
        Ok(Some(job))
    }
}

/// Process-local backend. Every operation runs under one lock, which makes
/// `pop` trivially atomic across worker instances sharing the backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn open(&self, queue: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn push(&self, queue: &str, job: NewJob) -> Result<JobId, QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        Ok(state.insert(job, Utc::now()))
    }

    async fn pop(&self, queue: &str, lock: Duration) -> Result<Option<Job>, QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        let now = Utc::now();

        state.promote(now);
        if state.paused {
            return Ok(None);
        }

        while let Some(id) = state.waiting.pop_front() {
            let claimed = match state.jobs.get_mut(&id) {
                Some(job) if job.state == JobState::Waiting => {
                    job.state = JobState::Active;
                    job.processed_at = Some(now);
                    job.clone()
                }
                _ => continue,
            };
            state.locks.insert(id, time_after(now, lock));

            if let Some(next) = NewJob::next_occurrence(&claimed) {
                let next_id = state.insert(next, now);
                tracing::debug!(job_id = %claimed.id, next_id = %next_id, "Scheduled next repeat occurrence");
            }
            return Ok(Some(claimed));
        }

        Ok(None)
    }

    async fn extend_lock(
        &self,
        queue: &str,
        id: &JobId,
        lock: Duration,
    ) -> Result<bool, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(false);
        };
        match state.locks.get_mut(id) {
            Some(expiry) => {
                *expiry = time_after(Utc::now(), lock);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete(
        &self,
        queue: &str,
        id: &JobId,
        return_value: serde_json::Value,
        remove: bool,
    ) -> Result<bool, QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        let Some(job) = state.release(id)? else {
            return Ok(false);
        };
        job.state = JobState::Completed;
        job.return_value = Some(return_value);
        job.finished_at = Some(Utc::now());
        if remove {
            state.jobs.remove(id);
        }
        Ok(true)
    }

    async fn retry(
        &self,
        queue: &str,
        id: &JobId,
        reason: &str,
        delay: Duration,
    ) -> Result<bool, QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        let Some(job) = state.release(id)? else {
            return Ok(false);
        };
        job.attempts_made += 1;
        job.failed_reason = Some(reason.to_string());

        if delay.is_zero() {
            job.state = JobState::Waiting;
            state.waiting.push_back(id.clone());
        } else {
            job.state = JobState::Delayed;
            job.run_at = time_after(Utc::now(), delay);
            let job = job.clone();
            state.schedule(&job);
        }
        Ok(true)
    }

    async fn fail(
        &self,
        queue: &str,
        id: &JobId,
        reason: &str,
        remove: bool,
    ) -> Result<bool, QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        let Some(job) = state.release(id)? else {
            return Ok(false);
        };
        job.attempts_made += 1;
        job.state = JobState::Failed;
        job.failed_reason = Some(reason.to_string());
        job.finished_at = Some(Utc::now());
        if remove {
            state.jobs.remove(id);
        }
        Ok(true)
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &JobId,
        progress: serde_json::Value,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let job = queues
            .get_mut(queue)
            .and_then(|state| state.jobs.get_mut(id))
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        job.progress = Some(progress);
        Ok(())
    }

    async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default().paused = true;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default().paused = false;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map_or(false, |state| state.paused))
    }

    async fn count(&self, queue: &str, state: JobState) -> Result<usize, QueueError> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map_or(0, |q| {
            q.jobs.values().filter(|job| job.state == state).count()
        }))
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>, QueueError> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).and_then(|q| q.jobs.get(id)).cloned())
    }

    async fn jobs(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let queues = self.queues.lock().await;
        let Some(q) = queues.get(queue) else {
            return Ok(Vec::new());
        };

        let mut jobs: Vec<Job> = match state {
            JobState::Waiting => q
                .waiting
                .iter()
                .filter_map(|id| q.jobs.get(id))
                .filter(|job| job.state == JobState::Waiting)
                .cloned()
                .collect(),
            _ => {
                let mut jobs: Vec<Job> = q
                    .jobs
                    .values()
                    .filter(|job| job.state == state)
                    .cloned()
                    .collect();
                jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                jobs
            }
        };
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        state: JobState,
    ) -> Result<usize, QueueError> {
        if !state.is_finished() {
            return Err(QueueError::Backend(format!(
                "only finished jobs can be cleaned, got {state}"
            )));
        }
        let mut queues = self.queues.lock().await;
        let Some(q) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let cutoff = time_before(Utc::now(), grace);
        let before = q.jobs.len();
        q.jobs.retain(|_, job| {
            !(job.state == state && job.finished_at.map_or(false, |at| at <= cutoff))
        });
        Ok(before - q.jobs.len())
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
    ) -> Result<StalledReport, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(q) = queues.get_mut(queue) else {
            return Ok(StalledReport::default());
        };

        let now = Utc::now();
        let expired: Vec<JobId> = q
            .locks
            .iter()
            .filter(|(_, expiry)| **expiry < now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut report = StalledReport::default();
        for id in expired {
            q.locks.remove(&id);
            let Some(job) = q.jobs.get_mut(&id) else {
                continue;
            };
            job.stalled_count += 1;

            if job.stalled_count > max_stalled_count {
                job.attempts_made += 1;
                job.state = JobState::Failed;
                job.failed_reason = Some(STALLED_LIMIT_REASON.to_string());
                job.finished_at = Some(now);
                report.failed.push(id);
            } else {
                job.state = JobState::Waiting;
                q.waiting.push_front(id.clone());
                report.requeued.push(id);
            }
        }

        Ok(report)
    }
}
