//! etcd-backed coordination.
//!
//! Lock keys are created in a transaction guarded by `version(key) == 0`
//! and attached to a lease, so a replica that dies between acquire and
//! release leaves nothing behind past the lease TTL.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, PutOptions, Txn, TxnOp, WatchOptions,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

use super::{
    CoordinationError, DistributedLock, LockKey, SignalEvent, SignalKind, SignalStore,
    SignalStream, WATCH_CHANNEL_BUFFER,
};
use crate::core::types::InstanceId;

fn unavailable(e: etcd_client::Error) -> CoordinationError {
    CoordinationError::Unavailable(e.to_string())
}

/// Connection to an etcd cluster.
#[derive(Clone)]
pub struct EtcdCoordinator {
    client: Client,
}

impl EtcdCoordinator {
    /// Connect to the given endpoints.
    pub async fn connect(endpoints: &[String]) -> Result<Self, CoordinationError> {
        let client = Client::connect(endpoints, None).await.map_err(unavailable)?;
        Ok(Self { client })
    }

    /// A lock handle storing keys under `namespace` with leases of `ttl`.
    pub fn lock(
        &self,
        namespace: impl Into<String>,
        instance: InstanceId,
        ttl: Duration,
    ) -> EtcdLock {
        EtcdLock {
            client: self.client.clone(),
            namespace: namespace.into(),
            instance,
            ttl_secs: ttl.as_secs().max(1) as i64,
            leases: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SignalStore for EtcdCoordinator {
    async fn put_signal(&self, key: &str, value: &str) -> Result<(), CoordinationError> {
        let mut kv = self.client.kv_client();
        kv.put(key, value, None).await.map_err(unavailable)?;
        Ok(())
    }

    async fn delete_signal(&self, key: &str) -> Result<(), CoordinationError> {
        let mut kv = self.client.kv_client();
        kv.delete(key, None).await.map_err(unavailable)?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<SignalStream, CoordinationError> {
        let mut watch = self.client.watch_client();
        let (watcher, mut stream) = watch
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_BUFFER);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            // Dropping the watcher cancels the watch.
            let _watcher = watcher;
            loop {
                let response = match stream.message().await {
                    Ok(Some(response)) => response,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(prefix = %prefix, error = %e, "etcd watch stream failed");
                        break;
                    }
                };
                if response.canceled() {
                    tracing::warn!(prefix = %prefix, "etcd watch canceled by server");
                    break;
                }
                for event in response.events() {
                    let Some(kv) = event.kv() else { continue };
                    let Ok(key) = kv.key_str() else { continue };
                    let kind = match event.event_type() {
                        EventType::Put => SignalKind::Put,
                        EventType::Delete => SignalKind::Delete,
                    };
                    let signal = SignalEvent {
                        key: key.to_string(),
                        kind,
                    };
                    if tx.send(signal).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// One replica's handle on the etcd lock space.
pub struct EtcdLock {
    client: Client,
    namespace: String,
    instance: InstanceId,
    ttl_secs: i64,
    leases: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl DistributedLock for EtcdLock {
    async fn try_acquire(&self, key: &LockKey) -> Result<bool, CoordinationError> {
        let path = key.path(&self.namespace);
        let mut lease = self.client.lease_client();
        let lease_id = lease
            .grant(self.ttl_secs, None)
            .await
            .map_err(unavailable)?
            .id();

        let txn = Txn::new()
            .when(vec![Compare::version(path.clone(), CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                path.clone(),
                self.instance.as_str(),
                Some(PutOptions::new().with_lease(lease_id)),
            )]);
        let mut kv = self.client.kv_client();
        let response = kv.txn(txn).await.map_err(unavailable)?;

        if response.succeeded() {
            self.leases.lock().await.insert(path, lease_id);
            Ok(true)
        } else {
            if let Err(e) = lease.revoke(lease_id).await {
                tracing::debug!(key = %key, error = %e, "failed to revoke unused lease");
            }
            Ok(false)
        }
    }

    async fn release(&self, key: &LockKey) -> Result<(), CoordinationError> {
        let path = key.path(&self.namespace);
        let Some(lease_id) = self.leases.lock().await.remove(&path) else {
            return Ok(());
        };
        // Revoking the lease deletes the key attached to it.
        let mut lease = self.client.lease_client();
        lease.revoke(lease_id).await.map_err(unavailable)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), CoordinationError> {
        let held: Vec<(String, i64)> = self.leases.lock().await.drain().collect();
        let mut lease = self.client.lease_client();
        for (path, lease_id) in held {
            if let Err(e) = lease.revoke(lease_id).await {
                tracing::warn!(key = %path, error = %e, "failed to revoke lock lease on close");
            }
        }
        Ok(())
    }
}
