//! End-to-end tests for ant-queue: dispatcher, worker pool and drain

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ant_queue::backend::{JobCounts, QueueBackend, QueueError, StalledReport};
use ant_queue::job::{Backoff, Job, JobId, JobOptions, JobState, NewJob};
use ant_queue::memory::MemoryBackend;
use ant_queue::pool::{WorkerConfig, WorkerPool};
use ant_queue::registry::QueueRegistry;
use ant_queue::retry::RetryPolicy;
use ant_queue::shutdown::ShutdownCoordinator;
use ant_queue::worker::{HandlerResult, JobContext, Worker, WorkerInfo};
use ant_queue::{JobDefaults, JobDispatcher};
use async_trait::async_trait;
use serde_json::json;

/// Counts hook invocations across every replica of a worker type
#[derive(Debug, Default)]
struct Recorder {
    handled: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    terminal: AtomicUsize,
    drained: AtomicUsize,
    progress: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Recorder {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    AlwaysFail,
    Slow(Duration),
    ReportProgress,
    /// Lets the stalled sweep reclaim the job while its first run is still going
    ReclaimFirstRun,
}

struct TestWorker {
    recorder: Arc<Recorder>,
    behaviour: Behaviour,
    queue: Option<&'static str>,
    concurrency: Option<usize>,
}

#[async_trait]
impl Worker for TestWorker {
    fn name(&self) -> &str {
        "TestWorker"
    }

    fn queue_name(&self) -> Option<&str> {
        self.queue
    }

    fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    async fn handle(&self, job: &Job, ctx: &JobContext) -> HandlerResult {
        self.recorder.handled.fetch_add(1, Ordering::SeqCst);
        let running = self.recorder.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.max_running.fetch_max(running, Ordering::SeqCst);

        let result: HandlerResult = match self.behaviour {
            Behaviour::Succeed => Ok(json!({ "echo": job.payload })),
            Behaviour::AlwaysFail => Err(format!("attempt {} failed", job.attempts_made + 1).into()),
            Behaviour::Slow(duration) => {
                tokio::time::sleep(duration).await;
                Ok(json!("slow"))
            }
            Behaviour::ReportProgress => {
                ctx.progress(json!(50)).await?;
                ctx.progress(json!(100)).await?;
                Ok(json!(null))
            }
            Behaviour::ReclaimFirstRun => {
                if job.stalled_count == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    ctx.queue().recover_stalled(10).await?;
                }
                Ok(json!("done"))
            }
        };

        self.recorder.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn on_completed(&self, _: &WorkerInfo, _: &Job, _: &serde_json::Value) {
        self.recorder.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_progress(&self, _: &WorkerInfo, _: &Job, _: &serde_json::Value) {
        self.recorder.progress.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failed(&self, _: &WorkerInfo, _: &Job, _: &str) {
        self.recorder.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failed_terminal(&self, _: &WorkerInfo, _: &Job, _: &str) {
        self.recorder.terminal.fetch_add(1, Ordering::SeqCst);
    }

    fn on_drained(&self, _: &WorkerInfo) {
        self.recorder.drained.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    registry: Arc<QueueRegistry>,
    dispatcher: JobDispatcher,
    pool: WorkerPool,
    recorder: Arc<Recorder>,
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(5),
        ..WorkerConfig::default()
    }
}

fn harness(retry: RetryPolicy, behaviour: Behaviour, concurrency: Option<usize>) -> Harness {
    harness_with(fast_config(), retry, behaviour, concurrency)
}

fn harness_with(
    config: WorkerConfig,
    retry: RetryPolicy,
    behaviour: Behaviour,
    concurrency: Option<usize>,
) -> Harness {
    let registry = Arc::new(QueueRegistry::new(Arc::new(MemoryBackend::new()), "ant"));
    registry.set_default("default");

    let recorder = Arc::new(Recorder::default());

    let mut pool = WorkerPool::new(registry.clone(), config, retry);
    let shared = recorder.clone();
    pool.register_factory(move || TestWorker {
        recorder: shared.clone(),
        behaviour,
        queue: None,
        concurrency,
    });

    Harness {
        dispatcher: JobDispatcher::new(registry.clone(), JobDefaults::default(), retry),
        registry,
        pool,
        recorder,
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

async fn wait_for_state(harness: &Harness, id: &JobId, state: JobState) -> Job {
    let queue = harness.registry.get("default").await.unwrap();
    for _ in 0..400 {
        if let Some(job) = queue.get_job(id).await.unwrap() {
            if job.state == state {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {id} never reached {state}");
}

/// Memory backend that counts `open` calls and makes them slow enough for
/// concurrent first references to overlap
#[derive(Default)]
struct CountingBackend {
    inner: MemoryBackend,
    opens: AtomicUsize,
}

#[async_trait]
impl QueueBackend for CountingBackend {
    async fn open(&self, queue: &str) -> Result<(), QueueError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.open(queue).await
    }

    async fn push(&self, queue: &str, job: NewJob) -> Result<JobId, QueueError> {
        self.inner.push(queue, job).await
    }

    async fn pop(&self, queue: &str, lock: Duration) -> Result<Option<Job>, QueueError> {
        self.inner.pop(queue, lock).await
    }

    async fn extend_lock(&self, queue: &str, id: &JobId, lock: Duration) -> Result<bool, QueueError> {
        self.inner.extend_lock(queue, id, lock).await
    }

    async fn complete(
        &self,
        queue: &str,
        id: &JobId,
        return_value: serde_json::Value,
        remove: bool,
    ) -> Result<bool, QueueError> {
        self.inner.complete(queue, id, return_value, remove).await
    }

    async fn retry(&self, queue: &str, id: &JobId, reason: &str, delay: Duration) -> Result<bool, QueueError> {
        self.inner.retry(queue, id, reason, delay).await
    }

    async fn fail(&self, queue: &str, id: &JobId, reason: &str, remove: bool) -> Result<bool, QueueError> {
        self.inner.fail(queue, id, reason, remove).await
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &JobId,
        progress: serde_json::Value,
    ) -> Result<(), QueueError> {
        self.inner.update_progress(queue, id, progress).await
    }

    async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        self.inner.pause(queue).await
    }

    async fn resume(&self, queue: &str) -> Result<(), QueueError> {
        self.inner.resume(queue).await
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, QueueError> {
        self.inner.is_paused(queue).await
    }

    async fn count(&self, queue: &str, state: JobState) -> Result<usize, QueueError> {
        self.inner.count(queue, state).await
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>, QueueError> {
        self.inner.get_job(queue, id).await
    }

    async fn jobs(&self, queue: &str, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError> {
        self.inner.jobs(queue, state, limit).await
    }

    async fn clean(&self, queue: &str, grace: Duration, state: JobState) -> Result<usize, QueueError> {
        self.inner.clean(queue, grace, state).await
    }

    async fn recover_stalled(&self, queue: &str, max_stalled_count: u32) -> Result<StalledReport, QueueError> {
        self.inner.recover_stalled(queue, max_stalled_count).await
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        self.inner.counts(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_first_references_share_one_queue() {
        let backend = Arc::new(CountingBackend::default());
        let registry = Arc::new(QueueRegistry::new(backend.clone(), "ant"));

        let lookups = (0..10).map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get("mail").await.unwrap() })
        });
        let queues: Vec<_> = futures::future::join_all(lookups)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(backend.opens.load(Ordering::SeqCst), 1);
        assert!(queues.iter().all(|q| q.same_handle(&queues[0])));
    }

    #[tokio::test]
    async fn test_jobs_complete_with_return_value() {
        let mut h = harness(RetryPolicy::disabled(), Behaviour::Succeed, None);
        h.pool.start().await.unwrap();

        let handle = h.dispatcher.add("greet", &json!({"to": "ant"})).await.unwrap();
        let job = wait_for_state(&h, &handle.id, JobState::Completed).await;

        assert_eq!(job.return_value, Some(json!({"echo": {"to": "ant"}})));
        let recorder = h.recorder.clone();
        wait_until(|| Recorder::get(&recorder.completed) == 1).await;
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_per_instance() {
        let mut h = harness(
            RetryPolicy::disabled(),
            Behaviour::Slow(Duration::from_millis(20)),
            Some(3),
        );
        for n in 0..10 {
            h.dispatcher.add("work", &json!(n)).await.unwrap();
        }
        h.pool.start().await.unwrap();

        let recorder = h.recorder.clone();
        wait_until(|| Recorder::get(&recorder.completed) == 10).await;

        let max = Recorder::get(&h.recorder.max_running);
        assert!(max <= 3, "saw {max} jobs running at once");
        assert!(max >= 2);
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_retries_until_attempts_exhausted() {
        let mut h = harness(
            RetryPolicy::fixed(Duration::from_millis(2)),
            Behaviour::AlwaysFail,
            None,
        );
        h.pool.start().await.unwrap();

        let handle = h
            .dispatcher
            .enqueue("flaky", &json!(null), JobOptions::new().attempts(3))
            .await
            .unwrap();
        let job = wait_for_state(&h, &handle.id, JobState::Failed).await;

        assert_eq!(job.attempts_made, 3);
        assert_eq!(job.failed_reason.as_deref(), Some("attempt 3 failed"));
        let recorder = h.recorder.clone();
        wait_until(|| Recorder::get(&recorder.terminal) == 1).await;
        assert_eq!(Recorder::get(&h.recorder.failed), 3);
        assert_eq!(Recorder::get(&h.recorder.completed), 0);
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_no_strategy_fails_on_first_error() {
        let mut h = harness(RetryPolicy::disabled(), Behaviour::AlwaysFail, None);
        h.pool.start().await.unwrap();

        // A per-job backoff does not turn retries on
        let handle = h
            .dispatcher
            .enqueue(
                "flaky",
                &json!(null),
                JobOptions::new()
                    .attempts(5)
                    .backoff(Backoff::fixed(Duration::from_millis(1))),
            )
            .await
            .unwrap();
        let job = wait_for_state(&h, &handle.id, JobState::Failed).await;

        assert_eq!(job.attempts_made, 1);
        let recorder = h.recorder.clone();
        wait_until(|| Recorder::get(&recorder.terminal) == 1).await;
        assert_eq!(Recorder::get(&h.recorder.handled), 1);
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_drain_waits_for_running_handler() {
        let mut h = harness(
            RetryPolicy::disabled(),
            Behaviour::Slow(Duration::from_millis(80)),
            None,
        );
        h.pool.start().await.unwrap();
        let handle = h.dispatcher.add("slow", &json!(null)).await.unwrap();

        let recorder = h.recorder.clone();
        wait_until(|| Recorder::get(&recorder.running) == 1).await;

        ShutdownCoordinator::new(h.registry.clone(), Duration::from_millis(5))
            .drain()
            .await
            .unwrap();

        assert_eq!(handle.state().await.unwrap(), Some(JobState::Completed));
        wait_until(|| Recorder::get(&recorder.completed) == 1).await;

        // Paused queues hand out nothing new
        let late = h.dispatcher.add("late", &json!(null)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(late.state().await.unwrap(), Some(JobState::Waiting));
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_drained_fires_once_per_empty_transition() {
        let mut h = harness(RetryPolicy::disabled(), Behaviour::Succeed, None);
        for n in 0..3 {
            h.dispatcher.add("work", &json!(n)).await.unwrap();
        }
        h.pool.start().await.unwrap();

        let recorder = h.recorder.clone();
        wait_until(|| Recorder::get(&recorder.drained) == 1).await;
        assert_eq!(Recorder::get(&h.recorder.completed), 3);

        // Idle polling does not fire it again
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(Recorder::get(&h.recorder.drained), 1);

        h.dispatcher.add("work", &json!(4)).await.unwrap();
        wait_until(|| Recorder::get(&recorder.drained) == 2).await;
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_progress_reaches_hook_and_job() {
        let mut h = harness(RetryPolicy::disabled(), Behaviour::ReportProgress, None);
        h.pool.start().await.unwrap();

        let handle = h.dispatcher.add("report", &json!(null)).await.unwrap();
        let job = wait_for_state(&h, &handle.id, JobState::Completed).await;

        assert_eq!(job.progress, Some(json!(100)));
        assert_eq!(Recorder::get(&h.recorder.progress), 2);
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_worker_without_queue_uses_default() {
        let mut h = harness(RetryPolicy::disabled(), Behaviour::Succeed, None);
        assert_eq!(h.pool.start().await.unwrap(), 1);
        assert_eq!(h.pool.instances()[0].queue, "default");
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_reclaimed_job_fires_completed_once() {
        let config = WorkerConfig {
            lock_duration: Duration::ZERO,
            ..fast_config()
        };
        let mut h = harness_with(config, RetryPolicy::disabled(), Behaviour::ReclaimFirstRun, None);
        h.pool.start().await.unwrap();

        let handle = h.dispatcher.add("reclaimed", &json!(null)).await.unwrap();
        let job = wait_for_state(&h, &handle.id, JobState::Completed).await;

        assert_eq!(job.stalled_count, 1);
        assert_eq!(Recorder::get(&h.recorder.handled), 2);
        let recorder = h.recorder.clone();
        wait_until(|| Recorder::get(&recorder.completed) == 1).await;

        // The first run's late result must not fire a second event
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(Recorder::get(&h.recorder.completed), 1);
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_no_watchdog_without_retries() {
        let mut h = harness(RetryPolicy::disabled(), Behaviour::Succeed, None);
        let handle = h.dispatcher.add("crashed", &json!(null)).await.unwrap();

        // Claimed by a consumer that died without reporting back
        let queue = h.registry.get("default").await.unwrap();
        queue.pop(Duration::ZERO).await.unwrap().unwrap();

        h.pool.start().await.unwrap();
        assert!(h.pool.watched_queues().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state().await.unwrap(), Some(JobState::Active));
        assert_eq!(Recorder::get(&h.recorder.handled), 0);
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_watchdog_runs_once_per_queue_and_recovers_crashed_job() {
        let config = WorkerConfig {
            replicas: 2,
            ..fast_config()
        };
        let retry = RetryPolicy::fixed(Duration::from_millis(2))
            .with_stalled_interval(Duration::from_millis(5));
        let mut h = harness_with(config, retry, Behaviour::Succeed, None);
        let handle = h.dispatcher.add("crashed", &json!(null)).await.unwrap();

        let queue = h.registry.get("default").await.unwrap();
        queue.pop(Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(h.pool.start().await.unwrap(), 2);
        assert_eq!(h.pool.watched_queues(), ["default"]);

        let job = wait_for_state(&h, &handle.id, JobState::Completed).await;
        assert_eq!(job.stalled_count, 1);
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_remove_on_complete_through_runtime() {
        let mut h = harness(RetryPolicy::disabled(), Behaviour::Succeed, None);
        h.pool.start().await.unwrap();

        let kept = h.dispatcher.add("keep", &json!(1)).await.unwrap();
        let dropped = h
            .dispatcher
            .enqueue("drop", &json!(2), JobOptions::new().remove_on_complete(true))
            .await
            .unwrap();

        let recorder = h.recorder.clone();
        wait_until(|| Recorder::get(&recorder.completed) == 2).await;

        assert_eq!(kept.state().await.unwrap(), Some(JobState::Completed));
        assert_eq!(dropped.state().await.unwrap(), None);
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_remove_on_fail_through_runtime() {
        let mut h = harness(RetryPolicy::disabled(), Behaviour::AlwaysFail, None);
        h.pool.start().await.unwrap();

        let kept = h.dispatcher.add("keep", &json!(1)).await.unwrap();
        let dropped = h
            .dispatcher
            .enqueue("drop", &json!(2), JobOptions::new().remove_on_fail(true))
            .await
            .unwrap();

        let recorder = h.recorder.clone();
        wait_until(|| Recorder::get(&recorder.terminal) == 2).await;

        assert_eq!(kept.state().await.unwrap(), Some(JobState::Failed));
        assert_eq!(dropped.state().await.unwrap(), None);
        h.pool.stop().await;
    }

    #[tokio::test]
    async fn test_purge_failed_on_start() {
        let config = WorkerConfig {
            purge_failed_on_start: true,
            purge_grace: Duration::ZERO,
            ..fast_config()
        };
        let mut h = harness_with(config, RetryPolicy::disabled(), Behaviour::Succeed, None);

        let queue = h.registry.get("default").await.unwrap();
        let failed = queue.push(NewJob::new("old", json!(null))).await.unwrap();
        queue.pop(Duration::from_secs(30)).await.unwrap().unwrap();
        queue.fail(&failed, "gone", false).await.unwrap();
        let completed = queue.push(NewJob::new("done", json!(null))).await.unwrap();
        queue.pop(Duration::from_secs(30)).await.unwrap().unwrap();
        queue.complete(&completed, json!(null), false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;

        h.pool.start().await.unwrap();

        assert!(queue.get_job(&failed).await.unwrap().is_none());
        assert!(queue.get_job(&completed).await.unwrap().is_some());
        h.pool.stop().await;
    }
}
