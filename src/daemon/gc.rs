//! Build-cache garbage collection.
//!
//! Images not pulled within the expiry are deleted cluster by cluster; the
//! store record of each deleted image is removed afterwards. A failing
//! cluster or record never stops the rest of the round.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::events::{Event, EventBus};
use crate::storage::{BuildCacheRecord, Storage, StorageError};

/// Name of the engine entry running the GC.
pub const GC_ENTRY_NAME: &str = "build-cache-gc";

/// Errors returned by an [`ImageCleaner`].
#[derive(Debug, Error)]
#[error("image cleanup failed in cluster {cluster}: {message}")]
pub struct CleanerError {
    pub cluster: String,
    pub message: String,
}

/// Deletes cached images from a cluster's registry.
#[async_trait]
pub trait ImageCleaner: Send + Sync {
    /// Delete `names` in `cluster`; returns the names actually deleted.
    async fn delete_images(
        &self,
        cluster: &str,
        names: &[String],
    ) -> Result<Vec<String>, CleanerError>;
}

/// Cleaner that deletes nothing and only logs.
#[derive(Debug, Default)]
pub struct DryRunCleaner;

#[async_trait]
impl ImageCleaner for DryRunCleaner {
    async fn delete_images(
        &self,
        cluster: &str,
        names: &[String],
    ) -> Result<Vec<String>, CleanerError> {
        tracing::info!(cluster = %cluster, count = names.len(), "dry run, images kept");
        Ok(Vec::new())
    }
}

/// Outcome for one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterOutcome {
    pub cluster: String,
    pub requested: usize,
    pub deleted: Vec<String>,
    /// Batch deletion error, if the cleaner failed.
    pub error: Option<String>,
    /// Images deleted whose store record could not be removed.
    pub record_failures: Vec<String>,
}

/// Outcome of one GC round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub clusters: Vec<ClusterOutcome>,
}

impl GcReport {
    /// Number of records removed from the store.
    pub fn removed(&self) -> usize {
        self.clusters
            .iter()
            .map(|c| c.deleted.len() - c.record_failures.len())
            .sum()
    }
}

/// Periodic build-cache GC.
pub struct BuildCacheGc<S: Storage> {
    storage: Arc<S>,
    cleaner: Arc<dyn ImageCleaner>,
    expire_in: Duration,
    events: Option<Arc<EventBus>>,
}

impl<S: Storage> Clone for BuildCacheGc<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            cleaner: Arc::clone(&self.cleaner),
            expire_in: self.expire_in,
            events: self.events.clone(),
        }
    }
}

impl<S: Storage> BuildCacheGc<S> {
    pub fn new(storage: Arc<S>, cleaner: Arc<dyn ImageCleaner>, expire_in: Duration) -> Self {
        Self {
            storage,
            cleaner,
            expire_in,
            events: None,
        }
    }

    /// Report outcomes to `events`.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.emit(event).await;
        }
    }

    /// Run one round relative to the current time.
    pub async fn run_once(&self) -> Result<GcReport, StorageError> {
        self.run_at(Utc::now()).await
    }

    /// Run one round treating `now` as the current time.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<GcReport, StorageError> {
        let expire = chrono::Duration::from_std(self.expire_in)
            .map_err(|e| StorageError::Other(format!("invalid expiry: {}", e)))?;
        let cutoff = now - expire;

        let expired = self.storage.list_expired_build_caches(cutoff).await?;
        let mut by_cluster: BTreeMap<String, Vec<BuildCacheRecord>> = BTreeMap::new();
        for record in expired {
            by_cluster
                .entry(record.cluster_name.clone())
                .or_default()
                .push(record);
        }

        let mut report = GcReport::default();
        for (cluster, records) in by_cluster {
            report.clusters.push(self.collect_cluster(cluster, records).await);
        }

        tracing::info!(
            clusters = report.clusters.len(),
            removed = report.removed(),
            cutoff = %cutoff,
            "build-cache gc finished"
        );
        Ok(report)
    }

    async fn collect_cluster(&self, cluster: String, records: Vec<BuildCacheRecord>) -> ClusterOutcome {
        let names: Vec<String> = records.into_iter().map(|r| r.name).collect();
        let mut outcome = ClusterOutcome {
            cluster: cluster.clone(),
            requested: names.len(),
            ..ClusterOutcome::default()
        };

        let deleted = match self.cleaner.delete_images(&cluster, &names).await {
            Ok(deleted) => deleted,
            Err(e) => {
                tracing::error!(cluster = %cluster, error = %e, "[alert] failed to delete build-cache images");
                self.emit(Event::gc_batch_failed(&cluster, e.to_string())).await;
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };
        self.emit(Event::gc_batch_deleted(&cluster, deleted.len())).await;

        for name in &deleted {
            if let Err(e) = self.storage.delete_build_cache(&cluster, name).await {
                tracing::error!(cluster = %cluster, image = %name, error = %e, "[alert] failed to remove build-cache record");
                self.emit(Event::gc_record_remove_failed(&cluster, name, e.to_string()))
                    .await;
                outcome.record_failures.push(name.clone());
            }
        }
        outcome.deleted = deleted;
        outcome
    }
}
