//! Queue registry: logical name -> live queue handle

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, OnceCell};

use crate::backend::{QueueBackend, QueueError};
use crate::config::EngineConfig;
use crate::queue::Queue;

/// Per-queue overrides for [`QueueRegistry::get_with`].
#[derive(Clone, Default)]
pub struct QueueOptions {
    /// Key namespace, defaults to the registry prefix
    pub prefix: Option<String>,
    /// Dedicated backend connection, defaults to the shared one
    pub backend: Option<Arc<dyn QueueBackend>>,
}

/// Owns every queue handle of the process.
///
/// Handles are built lazily on first reference and memoized for the process
/// lifetime. Concurrent first references to the same name share a single
/// construction.
pub struct QueueRegistry {
    backend: Arc<dyn QueueBackend>,
    prefix: String,
    default_queue: RwLock<Option<String>>,
    queues: Mutex<HashMap<String, Arc<OnceCell<Queue>>>>,
}

impl QueueRegistry {
    pub fn new(backend: Arc<dyn QueueBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            default_queue: RwLock::new(None),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with the configured prefix and default queue.
    pub fn from_config(backend: Arc<dyn QueueBackend>, config: &EngineConfig) -> Self {
        let registry = Self::new(backend, config.prefix.clone());
        registry.set_default(config.default_queue.clone());
        registry
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Records the process-wide default queue name.
    pub fn set_default(&self, name: impl Into<String>) {
        let mut default = self
            .default_queue
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *default = Some(name.into());
    }

    pub fn default_queue(&self) -> Option<String> {
        self.default_queue
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Returns the handle for `name`, constructing it on first use.
    pub async fn get(&self, name: &str) -> Result<Queue, QueueError> {
        self.get_with(name, QueueOptions::default()).await
    }

    /// Like [`get`](Self::get); `options` only apply if this call ends up
    /// constructing the handle.
    pub async fn get_with(&self, name: &str, options: QueueOptions) -> Result<Queue, QueueError> {
        if name.trim().is_empty() {
            return Err(QueueError::InvalidQueue("queue name must not be empty".into()));
        }

        let cell = {
            let mut queues = self.queues.lock().await;
            queues.entry(name.to_string()).or_default().clone()
        };

        let queue = cell
            .get_or_try_init(|| async {
                let prefix = options.prefix.as_deref().unwrap_or(&self.prefix);
                let backend = options
                    .backend
                    .clone()
                    .unwrap_or_else(|| self.backend.clone());
                Queue::open(name, prefix, backend).await
            })
            .await?;

        Ok(queue.clone())
    }

    /// Handle for an explicit queue, falling back to the default queue.
    pub async fn resolve(&self, name: Option<&str>) -> Result<Queue, QueueError> {
        match name {
            Some(name) => self.get(name).await,
            None => {
                let default = self.default_queue().ok_or(QueueError::NoQueueConfigured)?;
                self.get(&default).await
            }
        }
    }

    /// Every handle constructed so far.
    pub async fn queues(&self) -> Vec<Queue> {
        let queues = self.queues.lock().await;
        let mut handles: Vec<Queue> = queues.values().filter_map(|cell| cell.get().cloned()).collect();
        handles.sort_by(|a, b| a.name().cmp(b.name()));
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn registry() -> QueueRegistry {
        QueueRegistry::new(Arc::new(MemoryBackend::new()), "ant")
    }

    #[tokio::test]
    async fn test_get_memoizes() {
        let registry = registry();
        let a = registry.get("mail").await.unwrap();
        let b = registry.get("mail").await.unwrap();
        assert!(a.same_handle(&b));
        assert_eq!(a.key(), "ant:mail");
        assert_eq!(registry.queues().await.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_without_default_fails() {
        let registry = registry();
        let err = registry.resolve(None).await.unwrap_err();
        assert!(matches!(err, QueueError::NoQueueConfigured));

        registry.set_default("default");
        let queue = registry.resolve(None).await.unwrap();
        assert_eq!(queue.name(), "default");
    }

    #[tokio::test]
    async fn test_custom_prefix_applies_on_first_construction() {
        let registry = registry();
        let queue = registry
            .get_with(
                "reports",
                QueueOptions {
                    prefix: Some("billing".into()),
                    backend: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(queue.key(), "billing:reports");

        let again = registry.get("reports").await.unwrap();
        assert_eq!(again.key(), "billing:reports");
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let err = registry().get("  ").await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidQueue(_)));
    }
}
