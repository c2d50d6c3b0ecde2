//! Cross-replica coordination.
//!
//! Two concerns share one key-value store:
//! - [`DistributedLock`]: per-trigger-instant execution exclusion, so only
//!   one replica runs a job for a given scheduled instant.
//! - [`SignalStore`]: schedule-change propagation. The service writes a key
//!   under the signal prefix, every replica's watch loop sees the put and
//!   reconciles its engine.
//!
//! [`InMemoryCoordinator`] backs both for single-process deployments and
//! tests; the etcd backend is behind the `etcd` feature.

mod memory;
#[cfg(feature = "etcd")]
mod etcd;

pub use memory::{InMemoryCoordinator, InMemoryLock};
#[cfg(feature = "etcd")]
pub use etcd::{EtcdCoordinator, EtcdLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Default key namespace for execution locks.
pub const DEFAULT_LOCK_NAMESPACE: &str = "/devops/pipeline/dlock/crond";

/// Default key prefix for schedule-change signals.
pub const DEFAULT_SIGNAL_PREFIX: &str = "/devops/pipeline/crond";

/// Buffer size of the channel a watch forwards events into.
pub(crate) const WATCH_CHANNEL_BUFFER: usize = 64;

/// Errors from the coordination store.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The store could not be reached or rejected the request.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something unusable.
    #[error("coordination store error: {0}")]
    Backend(String),

    /// Local coordination state is unusable.
    #[error("coordination state poisoned")]
    LockPoisoned,
}

/// Lock key for one job at one scheduled instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    job: String,
    instant: i64,
}

impl LockKey {
    /// Key for `job` firing at `trigger_at`, at second resolution.
    pub fn new(job: impl Into<String>, trigger_at: DateTime<Utc>) -> Self {
        Self {
            job: job.into(),
            instant: trigger_at.timestamp(),
        }
    }

    /// The job (entry) name.
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Unix seconds of the scheduled instant.
    pub fn instant(&self) -> i64 {
        self.instant
    }

    /// Full store path under `namespace`.
    pub fn path(&self, namespace: &str) -> String {
        format!(
            "{}/{}/{}",
            namespace.trim_end_matches('/'),
            self.job,
            self.instant
        )
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job, self.instant)
    }
}

/// Per-instant execution exclusion across replicas.
///
/// Acquisition is a conditional create: it succeeds only if the key does not
/// exist. A key is never reused, since it embeds the trigger instant.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take the key. `Ok(false)` means another replica holds it.
    async fn try_acquire(&self, key: &LockKey) -> Result<bool, CoordinationError>;

    /// Release a key previously acquired by this replica.
    async fn release(&self, key: &LockKey) -> Result<(), CoordinationError>;

    /// Release backend resources held by this lock handle.
    async fn close(&self) -> Result<(), CoordinationError> {
        Ok(())
    }
}

/// Kind of change observed on a watched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Put,
    Delete,
}

/// One change observed under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEvent {
    pub key: String,
    pub kind: SignalKind,
}

/// Stream of signal events. Closes when the underlying watch ends.
pub type SignalStream = mpsc::Receiver<SignalEvent>;

/// Key-value operations needed to publish and observe schedule changes.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Write `value` at `key`.
    async fn put_signal(&self, key: &str, value: &str) -> Result<(), CoordinationError>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete_signal(&self, key: &str) -> Result<(), CoordinationError>;

    /// Subscribe to changes of every key starting with `prefix`.
    async fn watch_prefix(&self, prefix: &str) -> Result<SignalStream, CoordinationError>;
}

/// Keys of the schedule-change protocol under one prefix.
#[derive(Debug, Clone)]
pub struct SignalKeys {
    prefix: String,
}

/// A decoded signal key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Rebuild the entry of this definition from the store.
    Add(String),
    /// Drop the entry of this definition.
    Delete(String),
    /// Rebuild the whole engine.
    Reload,
}

impl SignalKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Prefix the watch loop subscribes to.
    pub fn watch_prefix(&self) -> String {
        format!("{}/", self.prefix)
    }

    pub fn add_key(&self, id: impl fmt::Display) -> String {
        format!("{}/add/{}", self.prefix, id)
    }

    pub fn delete_key(&self, id: impl fmt::Display) -> String {
        format!("{}/delete/{}", self.prefix, id)
    }

    /// A fresh reload key. Each request gets its own key so concurrent
    /// requests are not collapsed by the store.
    pub fn reload_key(&self) -> String {
        format!("{}/reload/{}", self.prefix, uuid::Uuid::new_v4())
    }

    /// Decode a watched key. Keys outside the protocol yield `None`.
    pub fn parse(&self, key: &str) -> Option<Signal> {
        let rest = key.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        let (kind, suffix) = match rest.split_once('/') {
            Some((kind, suffix)) => (kind, suffix),
            None => (rest, ""),
        };
        match kind {
            "add" if !suffix.is_empty() => Some(Signal::Add(suffix.to_string())),
            "delete" if !suffix.is_empty() => Some(Signal::Delete(suffix.to_string())),
            "reload" => Some(Signal::Reload),
            _ => None,
        }
    }
}

impl Default for SignalKeys {
    fn default() -> Self {
        Self::new(DEFAULT_SIGNAL_PREFIX)
    }
}
