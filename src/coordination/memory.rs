//! In-memory coordination store.
//!
//! A single [`InMemoryCoordinator`] shared by several engines in one process
//! behaves like one etcd cluster shared by several replicas: lock keys are
//! created at most once and signal puts are broadcast to every watcher.
//!
//! Not suitable for multi-process deployments.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};

use super::{
    CoordinationError, DistributedLock, LockKey, SignalEvent, SignalKind, SignalStore,
    SignalStream, WATCH_CHANNEL_BUFFER,
};
use crate::core::types::InstanceId;

const EVENT_BUFFER: usize = 256;

fn poison_err<T>(_: PoisonError<T>) -> CoordinationError {
    CoordinationError::LockPoisoned
}

/// Process-local key-value store with prefix watches.
#[derive(Debug)]
pub struct InMemoryCoordinator {
    kv: Mutex<BTreeMap<String, String>>,
    events: broadcast::Sender<SignalEvent>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            kv: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    /// A lock handle for one replica, storing keys under `namespace`.
    pub fn lock(
        self: &Arc<Self>,
        namespace: impl Into<String>,
        instance: InstanceId,
    ) -> InMemoryLock {
        InMemoryLock {
            store: Arc::clone(self),
            namespace: namespace.into(),
            instance,
        }
    }

    /// Value stored at `key`.
    pub fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        Ok(self.kv.lock().map_err(poison_err)?.get(key).cloned())
    }

    /// Keys currently stored under `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CoordinationError> {
        let kv = self.kv.lock().map_err(poison_err)?;
        Ok(kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), CoordinationError> {
        self.kv
            .lock()
            .map_err(poison_err)?
            .insert(key.to_string(), value.to_string());
        self.publish(key, SignalKind::Put);
        Ok(())
    }

    fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, CoordinationError> {
        let mut kv = self.kv.lock().map_err(poison_err)?;
        if kv.contains_key(key) {
            return Ok(false);
        }
        kv.insert(key.to_string(), value.to_string());
        drop(kv);
        self.publish(key, SignalKind::Put);
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool, CoordinationError> {
        let removed = self.kv.lock().map_err(poison_err)?.remove(key).is_some();
        if removed {
            self.publish(key, SignalKind::Delete);
        }
        Ok(removed)
    }

    fn publish(&self, key: &str, kind: SignalKind) {
        // No subscribers is fine.
        let _ = self.events.send(SignalEvent {
            key: key.to_string(),
            kind,
        });
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalStore for InMemoryCoordinator {
    async fn put_signal(&self, key: &str, value: &str) -> Result<(), CoordinationError> {
        self.put(key, value)
    }

    async fn delete_signal(&self, key: &str) -> Result<(), CoordinationError> {
        self.delete(key).map(|_| ())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<SignalStream, CoordinationError> {
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_BUFFER);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if !event.key.starts_with(&prefix) {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(prefix = %prefix, skipped, "watcher lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}

/// One replica's view of the in-memory lock space.
#[derive(Debug, Clone)]
pub struct InMemoryLock {
    store: Arc<InMemoryCoordinator>,
    namespace: String,
    instance: InstanceId,
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(&self, key: &LockKey) -> Result<bool, CoordinationError> {
        self.store
            .put_if_absent(&key.path(&self.namespace), self.instance.as_str())
    }

    async fn release(&self, key: &LockKey) -> Result<(), CoordinationError> {
        let path = key.path(&self.namespace);
        let holder = self.store.get(&path)?;
        if holder.as_deref() == Some(self.instance.as_str()) {
            self.store.delete(&path)?;
        }
        Ok(())
    }
}
