//! # Ant Queue
//!
//! Background job queue and worker orchestration for Ant services.
//!
//! Features:
//! - Named queues, constructed once per process and shared
//! - Job dispatch with per-job attempts, backoff, delay and repeat
//! - Worker pool with replicas and per-instance concurrency
//! - Opt-in retries (fixed or exponential) and stalled-job recovery
//! - Graceful drain on shutdown
//! - Pluggable storage backend, in-memory one included

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod job;
pub mod memory;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod shutdown;
pub mod stalled;
pub mod worker;

pub use backend::{JobCounts, QueueBackend, QueueError, StalledReport};
pub use config::{ConfigError, ConnectionConfig, EngineConfig};
pub use dispatcher::{JobDefaults, JobDispatcher, JobHandle};
pub use job::{Backoff, BackoffKind, Job, JobId, JobOptions, JobSettings, JobState, NewJob, RepeatOptions};
pub use memory::MemoryBackend;
pub use pool::{PoolError, WorkerConfig, WorkerPool};
pub use queue::{Queue, QueueSnapshot};
pub use registry::{QueueOptions, QueueRegistry};
pub use retry::{RetryDecision, RetryPolicy, RetryStrategy};
pub use runtime::FatalError;
pub use shutdown::ShutdownCoordinator;
pub use worker::{HandlerError, HandlerResult, JobContext, Worker, WorkerInfo};
