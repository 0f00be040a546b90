//! Per-instance execution loop
//!
//! A runtime pulls jobs for one worker instance, never holding more than
//! `concurrency` of them active at once, and drives each through
//! `active -> completed | failed -> (delayed | failed)`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, trace, warn};

use crate::backend::QueueError;
use crate::config::MAX_CONCURRENCY;
use crate::job::Job;
use crate::queue::Queue;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::worker::{JobContext, Worker, WorkerInfo};

/// Pause after a failed pull before trying again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Backend failure no worker can recover from.
#[derive(Debug)]
pub struct FatalError {
    pub worker: WorkerInfo,
    pub error: QueueError,
}

/// Loop tuning shared by every instance of a pool.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub lock_duration: Duration,
}

pub struct WorkerRuntime {
    worker: Arc<dyn Worker>,
    info: WorkerInfo,
    queue: Queue,
    retry: RetryPolicy,
    settings: RuntimeSettings,
    fatal_tx: Option<mpsc::UnboundedSender<FatalError>>,
}

impl WorkerRuntime {
    pub fn new(
        worker: Arc<dyn Worker>,
        info: WorkerInfo,
        queue: Queue,
        retry: RetryPolicy,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            worker,
            info,
            queue,
            retry,
            settings: RuntimeSettings {
                concurrency: settings.concurrency.clamp(1, MAX_CONCURRENCY),
                ..settings
            },
            fatal_tx: None,
        }
    }

    /// Forward connection failures to a process-wide channel.
    pub fn with_fatal_channel(mut self, tx: mpsc::UnboundedSender<FatalError>) -> Self {
        self.fatal_tx = Some(tx);
        self
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    /// Runs until `shutdown` flips to `true` (or its sender is dropped), then
    /// waits for every in-flight job on this instance to finish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let concurrency = self.settings.concurrency;
        let slots = Arc::new(Semaphore::new(concurrency));
        // Armed at start and after every claimed job; fires `drained` once
        let mut drain_armed = true;

        info!(worker = %self.info, concurrency, "Worker runtime started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match self.queue.pop(self.settings.lock_duration).await {
                Ok(Some(job)) => {
                    drain_armed = true;
                    let runtime = Arc::clone(&self);
                    tokio::spawn(async move {
                        runtime.process(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if drain_armed && slots.available_permits() == concurrency {
                        drain_armed = false;
                        self.worker.on_drained(&self.info);
                    }
                    if sleep_or_shutdown(self.settings.poll_interval, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    self.report_error(e);
                    if sleep_or_shutdown(ERROR_BACKOFF, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        // Every slot back means nothing is in flight
        let _ = slots.acquire_many(concurrency as u32).await;
        info!(worker = %self.info, "Worker runtime stopped");
    }

    async fn process(&self, job: Job) {
        if job.is_malformed() {
            warn!(worker = %self.info, job_id = %job.id, "Skipping job without a name");
            self.complete(&job, serde_json::Value::Null).await;
            return;
        }

        debug!(
            worker = %self.info,
            job_id = %job.id,
            job_name = %job.name,
            "Handling job"
        );
        trace!(job_id = %job.id, payload = %job.payload, "Job payload");

        let ctx = JobContext::new(
            self.info.clone(),
            job.clone(),
            self.queue.clone(),
            Arc::clone(&self.worker),
        );

        let handler = AssertUnwindSafe(self.worker.handle(&job, &ctx)).catch_unwind();
        tokio::pin!(handler);

        let renew_every = (self.settings.lock_duration / 2).max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);

        let outcome = loop {
            tokio::select! {
                outcome = &mut handler => break outcome,
                _ = renew.tick() => {
                    match self.queue.extend_lock(&job.id, self.settings.lock_duration).await {
                        Ok(true) => {}
                        Ok(false) => warn!(worker = %self.info, job_id = %job.id, "Lost lock on active job"),
                        Err(e) => self.report_error(e),
                    }
                }
            }
        };

        match outcome {
            Ok(Ok(value)) => self.complete(&job, value).await,
            Ok(Err(e)) => self.failed(&job, e.to_string()).await,
            Err(panic) => self.failed(&job, panic_reason(panic)).await,
        }
    }

    async fn complete(&self, job: &Job, value: serde_json::Value) {
        match self
            .queue
            .complete(&job.id, value.clone(), job.settings.remove_on_complete)
            .await
        {
            Ok(true) => self.worker.on_completed(&self.info, job, &value),
            Ok(false) => self.lost_claim(job, "completed"),
            Err(e) => self.report_error(e),
        }
    }

    /// Fires `on_failed` for the attempt, plus `on_failed_terminal` when the
    /// job will not run again. Nothing fires if another consumer has since
    /// reclaimed the job.
    async fn failed(&self, job: &Job, reason: String) {
        let attempt = job.attempts_made + 1;
        let decision = self
            .retry
            .decide(attempt, job.settings.attempts, job.settings.backoff.as_ref());

        match decision {
            RetryDecision::Retry { delay } => {
                debug!(
                    worker = %self.info,
                    job_id = %job.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Job failed, scheduling retry with backoff"
                );
                match self.queue.retry(&job.id, &reason, delay).await {
                    Ok(true) => self.worker.on_failed(&self.info, job, &reason),
                    Ok(false) => self.lost_claim(job, "failed"),
                    Err(e) => self.report_error(e),
                }
            }
            RetryDecision::Fail => {
                match self
                    .queue
                    .fail(&job.id, &reason, job.settings.remove_on_fail)
                    .await
                {
                    Ok(true) => {
                        self.worker.on_failed(&self.info, job, &reason);
                        self.worker.on_failed_terminal(&self.info, job, &reason);
                    }
                    Ok(false) => self.lost_claim(job, "failed"),
                    Err(e) => self.report_error(e),
                }
            }
        }
    }

    fn lost_claim(&self, job: &Job, outcome: &str) {
        warn!(
            worker = %self.info,
            job_id = %job.id,
            outcome,
            "Job was reclaimed before it finished, dropping result"
        );
    }

    fn report_error(&self, error: QueueError) {
        self.worker.on_error(&self.info, &error);
        if error.is_connection() {
            if let Some(tx) = &self.fatal_tx {
                let _ = tx.send(FatalError {
                    worker: self.info.clone(),
                    error,
                });
            }
        }
    }
}

/// Sleeps for `duration`; `true` if shutdown was requested meanwhile.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

fn panic_reason(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {msg}")
    } else {
        "handler panicked".to_string()
    }
}
