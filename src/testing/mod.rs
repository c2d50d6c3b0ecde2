//! Testing utilities for users of the pipecron library.
//!
//! This module provides in-process stand-ins for the collaborators the
//! scheduler talks to:
//!
//! - [`RecordingHandler`]: An event handler that keeps every event
//! - [`RecordingTrigger`]: A pipeline trigger that records requests
//! - [`FakeImageCleaner`]: An image cleaner with per-cluster failure injection
//! - [`FailingLock`]: A distributed lock whose backend is always unavailable
//! - [`FlakyStorage`]: A storage wrapper that fails selected record deletions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::coordination::{CoordinationError, DistributedLock, LockKey};
use crate::core::definition::{CronDefinition, CronIdentity};
use crate::core::types::CronId;
use crate::daemon::{CleanerError, ImageCleaner, PipelineRef, PipelineTrigger, TriggerError, TriggerRequest};
use crate::events::{Event, EventHandler};
use crate::storage::{
    BuildCacheRecord, CronExtraPatch, CronPage, CronQuery, Storage, StorageError,
};

/// An event handler that records every event it receives.
///
/// # Example
///
/// ```
/// use pipecron::events::{Event, EventBus};
/// use pipecron::testing::RecordingHandler;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() {
/// let bus = EventBus::new();
/// let recorder = Arc::new(RecordingHandler::new());
/// bus.register(recorder.clone()).await;
/// bus.emit(Event::reloaded(3)).await;
/// assert_eq!(recorder.events().await.len(), 1);
/// # }
/// ```
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far, in order.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Forget recorded events.
    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// A lock whose coordination store is never reachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingLock;

#[async_trait]
impl DistributedLock for FailingLock {
    async fn try_acquire(&self, _key: &LockKey) -> Result<bool, CoordinationError> {
        Err(CoordinationError::Unavailable("coordination store offline".into()))
    }

    async fn release(&self, _key: &LockKey) -> Result<(), CoordinationError> {
        Err(CoordinationError::Unavailable("coordination store offline".into()))
    }
}

#[derive(Default)]
struct TriggerState {
    requests: Vec<TriggerRequest>,
    executed: Vec<(CronId, DateTime<Utc>)>,
    attempts: usize,
    failures_remaining: usize,
}

/// A pipeline trigger that records requests instead of creating pipelines.
///
/// Recorded requests count as executed instants for
/// [`PipelineTrigger::cron_triggered_instants`], so a compensation round
/// sees what earlier fires produced.
#[derive(Default)]
pub struct RecordingTrigger {
    state: Mutex<TriggerState>,
    next_id: AtomicU64,
}

impl RecordingTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a pipeline for `cron_id` at `at` already exists.
    pub async fn mark_executed(&self, cron_id: CronId, at: DateTime<Utc>) {
        self.state.lock().await.executed.push((cron_id, at));
    }

    /// Reject the next `n` requests.
    pub async fn fail_next(&self, n: usize) {
        self.state.lock().await.failures_remaining = n;
    }

    /// Accepted requests, in arrival order.
    pub async fn requests(&self) -> Vec<TriggerRequest> {
        self.state.lock().await.requests.clone()
    }

    /// Number of create calls, accepted or not.
    pub async fn attempts(&self) -> usize {
        self.state.lock().await.attempts
    }
}

#[async_trait]
impl PipelineTrigger for RecordingTrigger {
    async fn create_pipeline(&self, request: TriggerRequest) -> Result<PipelineRef, TriggerError> {
        let mut state = self.state.lock().await;
        state.attempts += 1;
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(TriggerError::Rejected("intentional test failure".into()));
        }
        state.requests.push(request);
        Ok(PipelineRef {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    async fn cron_triggered_instants(
        &self,
        cron_id: CronId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, TriggerError> {
        let state = self.state.lock().await;
        let requested = state
            .requests
            .iter()
            .map(|r| (r.cron_id, r.trigger_at));
        let marked = state.executed.iter().copied();
        Ok(requested
            .chain(marked)
            .filter(|(id, at)| *id == cron_id && *at >= start && *at <= end)
            .map(|(_, at)| at)
            .collect())
    }
}

/// An image cleaner that deletes nothing but reports as if it did.
#[derive(Default)]
pub struct FakeImageCleaner {
    failing_clusters: HashSet<String>,
    refused: HashSet<String>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeImageCleaner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every batch for `cluster`.
    pub fn failing_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.failing_clusters.insert(cluster.into());
        self
    }

    /// Never report `image` as deleted.
    pub fn refusing(mut self, image: impl Into<String>) -> Self {
        self.refused.insert(image.into());
        self
    }

    /// Batches requested so far, as `(cluster, names)`.
    pub async fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl ImageCleaner for FakeImageCleaner {
    async fn delete_images(
        &self,
        cluster: &str,
        names: &[String],
    ) -> Result<Vec<String>, CleanerError> {
        self.calls
            .lock()
            .await
            .push((cluster.to_string(), names.to_vec()));
        if self.failing_clusters.contains(cluster) {
            return Err(CleanerError {
                cluster: cluster.to_string(),
                message: "registry unreachable".to_string(),
            });
        }
        Ok(names
            .iter()
            .filter(|name| !self.refused.contains(*name))
            .cloned()
            .collect())
    }
}

/// Wraps a storage and injects faults into it.
///
/// Deletion of chosen build-cache records fails, and definitions can be
/// stopped behind the reader's back as soon as they are read, the way an
/// admin stopping a cron races a running fire.
pub struct FlakyStorage<S: Storage> {
    inner: Arc<S>,
    undeletable: HashSet<String>,
    stop_after_read: bool,
}

impl<S: Storage> FlakyStorage<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            undeletable: HashSet::new(),
            stop_after_read: false,
        }
    }

    /// Fail every deletion of the record named `name`.
    pub fn undeletable(mut self, name: impl Into<String>) -> Self {
        self.undeletable.insert(name.into());
        self
    }

    /// Disable every definition in the inner store right after it is read.
    pub fn stop_after_read(mut self) -> Self {
        self.stop_after_read = true;
        self
    }

    async fn stop_read(&self, defs: &[CronDefinition]) -> Result<(), StorageError> {
        if !self.stop_after_read {
            return Ok(());
        }
        for def in defs {
            let mut stopped = def.clone();
            stopped.enabled = false;
            self.inner.update_cron(stopped).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<S: Storage> Storage for FlakyStorage<S> {
    async fn create_cron(&self, def: CronDefinition) -> Result<CronDefinition, StorageError> {
        self.inner.create_cron(def).await
    }

    async fn get_cron(&self, id: CronId) -> Result<CronDefinition, StorageError> {
        let def = self.inner.get_cron(id).await?;
        self.stop_read(std::slice::from_ref(&def)).await?;
        Ok(def)
    }

    async fn update_cron(&self, def: CronDefinition) -> Result<(), StorageError> {
        self.inner.update_cron(def).await
    }

    async fn patch_cron_extra(
        &self,
        id: CronId,
        patch: &CronExtraPatch,
    ) -> Result<(), StorageError> {
        self.inner.patch_cron_extra(id, patch).await
    }

    async fn delete_cron(&self, id: CronId) -> Result<(), StorageError> {
        self.inner.delete_cron(id).await
    }

    async fn find_cron(
        &self,
        identity: &CronIdentity,
    ) -> Result<Option<CronDefinition>, StorageError> {
        self.inner.find_cron(identity).await
    }

    async fn list_enabled_crons(&self) -> Result<Vec<CronDefinition>, StorageError> {
        let defs = self.inner.list_enabled_crons().await?;
        self.stop_read(&defs).await?;
        Ok(defs)
    }

    async fn page_crons(&self, query: &CronQuery) -> Result<CronPage, StorageError> {
        self.inner.page_crons(query).await
    }

    async fn save_build_cache(&self, record: BuildCacheRecord) -> Result<(), StorageError> {
        self.inner.save_build_cache(record).await
    }

    async fn list_expired_build_caches(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BuildCacheRecord>, StorageError> {
        self.inner.list_expired_build_caches(cutoff).await
    }

    async fn delete_build_cache(&self, cluster_name: &str, name: &str) -> Result<(), StorageError> {
        if self.undeletable.contains(name) {
            return Err(StorageError::Other(format!("cannot delete {}", name)));
        }
        self.inner.delete_build_cache(cluster_name, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use chrono::Duration;

    #[tokio::test]
    async fn test_recording_trigger_reports_requested_instants() {
        let trigger = RecordingTrigger::new();
        let def = CronDefinition::new("s", "a.yml", "0 * * * * *");
        let now = Utc::now();

        trigger
            .create_pipeline(TriggerRequest::for_cron(&def, now))
            .await
            .unwrap();
        trigger.mark_executed(def.id, now - Duration::hours(1)).await;
        trigger.mark_executed(CronId::new(99), now).await;

        let instants = trigger
            .cron_triggered_instants(def.id, now - Duration::hours(2), now)
            .await
            .unwrap();
        assert_eq!(instants.len(), 2);
    }

    #[tokio::test]
    async fn test_recording_trigger_failure_injection() {
        let trigger = RecordingTrigger::new();
        let def = CronDefinition::new("s", "a.yml", "0 * * * * *");
        trigger.fail_next(1).await;

        assert!(trigger.create_pipeline(TriggerRequest::for_cron(&def, Utc::now())).await.is_err());
        assert!(trigger.create_pipeline(TriggerRequest::for_cron(&def, Utc::now())).await.is_ok());
        assert_eq!(trigger.attempts().await, 2);
        assert_eq!(trigger.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_fake_cleaner_refuses_and_fails() {
        let cleaner = FakeImageCleaner::new().failing_cluster("down").refusing("pinned");
        let names = vec!["pinned".to_string(), "stale".to_string()];

        assert_eq!(cleaner.delete_images("up", &names).await.unwrap(), vec!["stale".to_string()]);
        assert!(cleaner.delete_images("down", &names).await.is_err());
        assert_eq!(cleaner.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_flaky_storage_fails_selected_deletes() {
        let storage = FlakyStorage::new(Arc::new(InMemoryStorage::new())).undeletable("stuck");
        storage.save_build_cache(BuildCacheRecord::new("c1", "stuck")).await.unwrap();
        storage.save_build_cache(BuildCacheRecord::new("c1", "free")).await.unwrap();

        assert!(storage.delete_build_cache("c1", "stuck").await.is_err());
        assert!(storage.delete_build_cache("c1", "free").await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_lock_is_unavailable() {
        let key = LockKey::new("cron-1", Utc::now());
        assert!(matches!(
            FailingLock.try_acquire(&key).await,
            Err(CoordinationError::Unavailable(_))
        ));
    }
}
