//! Subcommands

pub mod dispatch;
pub mod monitor;
pub mod work;

use std::sync::Arc;

use ant_persist::RedisBackend;
use ant_queue::{EngineConfig, QueueRegistry};
use anyhow::{Context, Result};
use tracing::error;

/// Connect to the configured Redis server and build the process registry.
pub async fn connect(config: &EngineConfig) -> Result<Arc<QueueRegistry>> {
    let backend = RedisBackend::connect(&config.connection)
        .await
        .map_err(|e| {
            error!(address = %config.connection.address(), error = %e, "Unable to connect to Redis");
            e
        })
        .context("Redis connection failed")?;

    Ok(Arc::new(QueueRegistry::from_config(Arc::new(backend), config)))
}
