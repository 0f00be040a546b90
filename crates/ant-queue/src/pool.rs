//! Worker pool: registers worker types and starts their replicas

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backend::QueueError;
use crate::config::EngineConfig;
use crate::job::JobState;
use crate::registry::QueueRegistry;
use crate::retry::RetryPolicy;
use crate::runtime::{FatalError, RuntimeSettings, WorkerRuntime};
use crate::stalled::StalledWatchdog;
use crate::worker::{Worker, WorkerInfo};

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Jobs in flight per instance (env: APP_QUEUE_JOB_CONCURRENCY)
    pub concurrency: usize,
    /// Instances per worker type (env: APP_QUEUE_WORKERS_CONCURRENCY)
    pub replicas: u32,
    pub poll_interval: Duration,
    pub lock_duration: Duration,
    /// Drop old failed jobs when an instance starts (env: APP_QUEUE_REMOVE_FAILED_ON_START)
    pub purge_failed_on_start: bool,
    /// Failed jobs younger than this survive the on-start purge
    pub purge_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            replicas: 1,
            poll_interval: Duration::from_millis(100),
            lock_duration: Duration::from_secs(30),
            purge_failed_on_start: false,
            purge_grace: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No workers configured")]
    NoWorkersConfigured,
    #[error("Worker pool already started")]
    AlreadyStarted,
    #[error(transparent)]
    Queue(#[from] QueueError),
}

type WorkerFactory = Box<dyn Fn() -> Arc<dyn Worker> + Send + Sync>;

/// Starts `replicas` instances of every registered worker type.
pub struct WorkerPool {
    registry: Arc<QueueRegistry>,
    config: WorkerConfig,
    retry: RetryPolicy,
    factories: Vec<WorkerFactory>,
    shutdown_tx: watch::Sender<bool>,
    fatal_tx: mpsc::UnboundedSender<FatalError>,
    fatal_rx: Option<mpsc::UnboundedReceiver<FatalError>>,
    handles: Vec<JoinHandle<()>>,
    instances: Vec<WorkerInfo>,
    watched: HashSet<String>,
    purged: HashSet<String>,
    started: bool,
}

impl WorkerPool {
    pub fn new(registry: Arc<QueueRegistry>, config: WorkerConfig, retry: RetryPolicy) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            config,
            retry,
            factories: Vec::new(),
            shutdown_tx,
            fatal_tx,
            fatal_rx: Some(fatal_rx),
            handles: Vec::new(),
            instances: Vec::new(),
            watched: HashSet::new(),
            purged: HashSet::new(),
            started: false,
        }
    }

    pub fn from_config(registry: Arc<QueueRegistry>, config: &EngineConfig) -> Self {
        Self::new(registry, config.worker, config.retry)
    }

    /// Register a worker type built with `Default`.
    pub fn register<W: Worker + Default + 'static>(&mut self) -> &mut Self {
        self.register_factory(W::default)
    }

    /// Register a worker type with a custom constructor, called once per replica
    /// (useful for workers with injected dependencies).
    pub fn register_factory<W, F>(&mut self, factory: F) -> &mut Self
    where
        W: Worker + 'static,
        F: Fn() -> W + Send + Sync + 'static,
    {
        self.factories
            .push(Box::new(move || Arc::new(factory()) as Arc<dyn Worker>));
        self
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    /// Running instances, in start order.
    pub fn instances(&self) -> &[WorkerInfo] {
        &self.instances
    }

    /// Queues with a running stalled-job watchdog, sorted by name.
    pub fn watched_queues(&self) -> Vec<&str> {
        let mut queues: Vec<&str> = self.watched.iter().map(String::as_str).collect();
        queues.sort_unstable();
        queues
    }

    /// Receiver for connection failures reported by any instance; `None`
    /// once taken.
    pub fn take_fatal_errors(&mut self) -> Option<mpsc::UnboundedReceiver<FatalError>> {
        self.fatal_rx.take()
    }

    /// Start every replica of every registered worker type.
    ///
    /// An instance that fails to start is logged and skipped; its siblings
    /// still start. Returns how many instances are running.
    pub async fn start(&mut self) -> Result<usize, PoolError> {
        if self.factories.is_empty() {
            return Err(PoolError::NoWorkersConfigured);
        }
        if self.started {
            return Err(PoolError::AlreadyStarted);
        }
        self.started = true;

        let replicas = self.config.replicas.max(1);
        let mut last_error = None;

        for index in 0..self.factories.len() {
            for replica in 1..=replicas {
                let worker = (self.factories[index])();
                match self.start_instance(worker, replica).await {
                    Ok(info) => {
                        info!(worker = %info, "Worker ready");
                        self.instances.push(info);
                    }
                    Err(e) => {
                        error!(replica, error = %e, "Failed to start worker instance");
                        last_error = Some(e);
                    }
                }
            }
        }

        match (self.instances.len(), last_error) {
            (0, Some(e)) => Err(PoolError::Queue(e)),
            (count, _) => Ok(count),
        }
    }

    async fn start_instance(
        &mut self,
        worker: Arc<dyn Worker>,
        replica: u32,
    ) -> Result<WorkerInfo, QueueError> {
        let queue_name = match worker.queue_name() {
            Some(name) => name.to_string(),
            None => self
                .registry
                .default_queue()
                .ok_or(QueueError::NoQueueConfigured)?,
        };

        let info = WorkerInfo {
            worker: worker.name().to_string(),
            replica,
            queue: queue_name.clone(),
        };
        info!(worker = %info, "Preparing worker");
        worker.on_created(&info);

        let queue = self.registry.get(&queue_name).await?;

        if self.config.purge_failed_on_start && self.purged.insert(queue_name.clone()) {
            let removed = queue.clean(self.config.purge_grace, JobState::Failed).await?;
            if removed > 0 {
                warn!(queue = %queue_name, removed, "Purged failed jobs on start");
            }
        }

        if self.retry.is_enabled() && self.watched.insert(queue_name.clone()) {
            let watchdog = StalledWatchdog::new(queue.clone(), &self.retry);
            self.handles
                .push(tokio::spawn(watchdog.run(self.shutdown_tx.subscribe())));
        }

        let settings = RuntimeSettings {
            concurrency: worker.concurrency().unwrap_or(self.config.concurrency),
            poll_interval: self.config.poll_interval,
            lock_duration: self.config.lock_duration,
        };
        let runtime = WorkerRuntime::new(worker.clone(), info.clone(), queue, self.retry, settings)
            .with_fatal_channel(self.fatal_tx.clone());

        self.handles
            .push(tokio::spawn(Arc::new(runtime).run(self.shutdown_tx.subscribe())));
        worker.on_booted(&info);

        Ok(info)
    }

    /// Signal every instance to stop pulling and wait for in-flight jobs.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        info!(instances = self.instances.len(), "Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::memory::MemoryBackend;
    use crate::worker::{HandlerResult, JobContext};
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Default)]
    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        fn name(&self) -> &str {
            "Echo"
        }

        async fn handle(&self, job: &Job, _ctx: &JobContext) -> HandlerResult {
            Ok(job.payload.clone())
        }
    }

    #[derive(Default)]
    struct Pinned;

    #[async_trait]
    impl Worker for Pinned {
        fn name(&self) -> &str {
            "Pinned"
        }

        fn queue_name(&self) -> Option<&str> {
            Some("reports")
        }

        async fn handle(&self, _job: &Job, _ctx: &JobContext) -> HandlerResult {
            Ok(json!(null))
        }
    }

    #[derive(Default)]
    struct Lifecycle {
        created: std::sync::Mutex<Vec<u32>>,
        booted: std::sync::Mutex<Vec<u32>>,
    }

    struct Tracked(Arc<Lifecycle>);

    #[async_trait]
    impl Worker for Tracked {
        fn name(&self) -> &str {
            "Tracked"
        }

        fn queue_name(&self) -> Option<&str> {
            Some("tracked")
        }

        fn on_created(&self, info: &WorkerInfo) {
            self.0.created.lock().unwrap().push(info.replica);
        }

        fn on_booted(&self, info: &WorkerInfo) {
            self.0.booted.lock().unwrap().push(info.replica);
        }

        async fn handle(&self, _job: &Job, _ctx: &JobContext) -> HandlerResult {
            Ok(json!(null))
        }
    }

    fn registry() -> Arc<QueueRegistry> {
        Arc::new(QueueRegistry::new(Arc::new(MemoryBackend::new()), "ant"))
    }

    #[tokio::test]
    async fn test_start_without_workers() {
        let mut pool = WorkerPool::new(registry(), WorkerConfig::default(), RetryPolicy::disabled());
        assert!(matches!(pool.start().await, Err(PoolError::NoWorkersConfigured)));
    }

    #[tokio::test]
    async fn test_replicas_numbered_from_one() {
        let registry = registry();
        registry.set_default("default");
        let config = WorkerConfig {
            replicas: 3,
            ..WorkerConfig::default()
        };

        let mut pool = WorkerPool::new(registry, config, RetryPolicy::disabled());
        pool.register::<Echo>().register::<Pinned>();
        assert_eq!(pool.start().await.unwrap(), 6);

        let echo: Vec<String> = pool
            .instances()
            .iter()
            .filter(|i| i.worker == "Echo")
            .map(|i| i.to_string())
            .collect();
        assert_eq!(echo, ["Echo(#1):default", "Echo(#2):default", "Echo(#3):default"]);
        assert!(pool
            .instances()
            .iter()
            .filter(|i| i.worker == "Pinned")
            .all(|i| i.queue == "reports"));

        assert!(matches!(pool.start().await, Err(PoolError::AlreadyStarted)));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_failing_instance_does_not_block_siblings() {
        // No default queue: Echo cannot start, Pinned can
        let mut pool = WorkerPool::new(registry(), WorkerConfig::default(), RetryPolicy::disabled());
        pool.register::<Echo>().register::<Pinned>();
        assert_eq!(pool.start().await.unwrap(), 1);
        assert_eq!(pool.instances()[0].worker, "Pinned");
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_instance_hooks_fire_per_replica() {
        let lifecycle = Arc::new(Lifecycle::default());
        let config = WorkerConfig {
            replicas: 2,
            ..WorkerConfig::default()
        };
        let mut pool = WorkerPool::new(registry(), config, RetryPolicy::disabled());
        let shared = lifecycle.clone();
        pool.register_factory(move || Tracked(shared.clone()));

        assert_eq!(pool.start().await.unwrap(), 2);
        assert_eq!(*lifecycle.created.lock().unwrap(), [1, 2]);
        assert_eq!(*lifecycle.booted.lock().unwrap(), [1, 2]);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_all_instances_failing_is_an_error() {
        let mut pool = WorkerPool::new(registry(), WorkerConfig::default(), RetryPolicy::disabled());
        pool.register::<Echo>();
        assert!(matches!(
            pool.start().await,
            Err(PoolError::Queue(QueueError::NoQueueConfigured))
        ));
    }
}
