//! # Ant Persistence
//!
//! Durable storage backends for `ant-queue`.
//!
//! Supports:
//! - Redis (feature `redis`, on by default)

use ant_queue::config::ConnectionConfig;

#[cfg(feature = "redis")]
pub mod redis_queue;

#[cfg(feature = "redis")]
pub use redis_queue::RedisBackend;

/// Connection URL for a backend server. An explicit URL wins; otherwise one
/// is assembled from host, port and the (percent-encoded) password.
pub fn connection_url(config: &ConnectionConfig) -> String {
    if let Some(url) = &config.url {
        return url.clone();
    }
    match &config.password {
        Some(password) => format!(
            "redis://:{}@{}:{}/",
            urlencoding::encode(password),
            config.host,
            config.port
        ),
        None => format!("redis://{}:{}/", config.host, config.port),
    }
}
