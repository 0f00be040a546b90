//! Engine configuration, read from `APP_QUEUE_*` / `REDIS_*` environment keys

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::dispatcher::JobDefaults;
use crate::pool::WorkerConfig;
use crate::retry::{RetryPolicy, RetryStrategy};

/// Upper bound on jobs in flight per worker instance
pub const MAX_CONCURRENCY: usize = 10_000;

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },
}

/// Backend connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Full URL (env: REDIS_URL), wins over the individual parts
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 6379,
            password: None,
        }
    }
}

impl ConnectionConfig {
    /// `host:port` for log lines; never includes the password.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Full engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub connection: ConnectionConfig,
    /// Key namespace shared by every queue (env: APP_QUEUE_GROUP)
    pub prefix: String,
    /// Process-wide default queue (env: APP_DEFAULT_QUEUE)
    pub default_queue: String,
    pub worker: WorkerConfig,
    pub jobs: JobDefaults,
    pub retry: RetryPolicy,
    /// Active-count poll period while draining (env: APP_QUEUE_DRAIN_INTERVAL)
    pub drain_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            prefix: "ant".to_string(),
            default_queue: "default".to_string(),
            worker: WorkerConfig::default(),
            jobs: JobDefaults::default(),
            retry: RetryPolicy::disabled(),
            drain_interval: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let flag = |key: &str| get(key).map_or(false, |v| v == "true");

        let defaults = Self::default();

        let connection = ConnectionConfig {
            url: get("REDIS_URL"),
            host: get("REDIS_HOST").unwrap_or(defaults.connection.host),
            port: parse_or(&get, "REDIS_PORT", defaults.connection.port)?,
            password: get("REDIS_PASSWORD"),
        };

        let strategy: RetryStrategy = parse_or(&get, "APP_QUEUE_RETRY_STRATEGY", RetryStrategy::None)?;
        let retry = RetryPolicy::new(
            strategy,
            Duration::from_millis(parse_or(&get, "APP_QUEUE_RETRY_DELAY", 1000u64)?),
        )
        .with_stalled_interval(Duration::from_millis(parse_or(
            &get,
            "APP_QUEUE_STALLED_INTERVAL",
            1000u64,
        )?))
        .with_max_stalled_count(parse_or(&get, "APP_QUEUE_MAX_STALLED_COUNT", 10u32)?);

        let worker = WorkerConfig {
            concurrency: parse_or(&get, "APP_QUEUE_JOB_CONCURRENCY", defaults.worker.concurrency)?
                .clamp(1, MAX_CONCURRENCY),
            replicas: parse_or(&get, "APP_QUEUE_WORKERS_CONCURRENCY", defaults.worker.replicas)?,
            poll_interval: Duration::from_millis(parse_or(&get, "APP_QUEUE_POLL_INTERVAL", 100u64)?),
            lock_duration: Duration::from_millis(parse_or(
                &get,
                "APP_QUEUE_LOCK_DURATION",
                30_000u64,
            )?),
            purge_failed_on_start: flag("APP_QUEUE_REMOVE_FAILED_ON_START"),
            purge_grace: defaults.worker.purge_grace,
        };

        let jobs = JobDefaults {
            attempts: parse_or(&get, "APP_QUEUE_RETRIES", defaults.jobs.attempts)?,
            remove_on_complete: flag("APP_QUEUE_REMOVE_COMPLETED"),
            remove_on_fail: flag("APP_QUEUE_REMOVE_FAILED"),
        };

        Ok(Self {
            connection,
            prefix: snake_case(&get("APP_QUEUE_GROUP").unwrap_or(defaults.prefix)),
            default_queue: snake_case(&get("APP_DEFAULT_QUEUE").unwrap_or(defaults.default_queue)),
            worker,
            jobs,
            retry,
            drain_interval: Duration::from_millis(parse_or(&get, "APP_QUEUE_DRAIN_INTERVAL", 100u64)?),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

/// Normalises queue names and prefixes: `EmailQueue` and `email-queue` both
/// become `email_queue`.
pub fn snake_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut prev: Option<char> = None;

    for c in input.trim().chars() {
        if c.is_uppercase() {
            if matches!(prev, Some(p) if p.is_lowercase() || p.is_ascii_digit()) {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else if c == '-' || c.is_whitespace() {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
        } else {
            out.push(c);
        }
        prev = Some(c);
    }

    out.trim_end_matches('_').to_string()
}
