//! Storage abstraction for cron definitions and build-cache records.
//!
//! This module provides a trait-based storage abstraction with
//! pluggable backends (in-memory, SQLite).

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::definition::{Compensator, CronDefinition, CronExtra, CronIdentity};
use crate::core::types::CronId;
use std::collections::BTreeMap;

/// Default page size of [`CronQuery`].
pub const DEFAULT_PAGE_SIZE: u64 = 20;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Bookkeeping the daemon writes into a definition's extra data.
///
/// Applied against the stored row, so fields changed concurrently by the
/// admin service (expression, enable flag, yml) are left as they are.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CronExtraPatch {
    /// New compensation progress.
    pub last_compensate_at: Option<DateTime<Utc>>,
    /// Compensator to store when the row has none.
    pub default_compensator: Option<Compensator>,
    /// Normal labels to store when the row lacks them.
    pub default_labels: BTreeMap<String, String>,
}

impl CronExtraPatch {
    /// Record compensation progress up to `at`.
    pub fn compensated_until(at: DateTime<Utc>) -> Self {
        Self {
            last_compensate_at: Some(at),
            default_compensator: Some(Compensator::default()),
            ..Default::default()
        }
    }

    /// Store `key=value` unless the label is already set.
    pub fn default_label(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            default_labels: BTreeMap::from([(key.into(), value.into())]),
            ..Default::default()
        }
    }

    /// Apply the patch to `extra`.
    pub fn apply(&self, extra: &mut CronExtra) {
        if let Some(at) = self.last_compensate_at {
            extra.last_compensate_at = Some(at);
        }
        if extra.compensator.is_none() {
            extra.compensator = self.default_compensator;
        }
        for (key, value) in &self.default_labels {
            extra
                .normal_labels
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

/// Filter and page selection for listing definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronQuery {
    pub sources: Vec<String>,
    pub yml_names: Vec<String>,
    pub enabled: Option<bool>,
    pub pipeline_definition_ids: Vec<String>,
    pub cluster_name: Option<String>,
    /// 1-based page number.
    pub page_no: u64,
    pub page_size: u64,
    /// Ignore paging and return every match.
    pub get_all: bool,
}

impl Default for CronQuery {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            yml_names: Vec::new(),
            enabled: None,
            pipeline_definition_ids: Vec::new(),
            cluster_name: None,
            page_no: 1,
            page_size: DEFAULT_PAGE_SIZE,
            get_all: false,
        }
    }
}

impl CronQuery {
    /// Whether `def` passes every filter (paging aside).
    pub fn matches(&self, def: &CronDefinition) -> bool {
        (self.sources.is_empty() || self.sources.contains(&def.pipeline_source))
            && (self.yml_names.is_empty() || self.yml_names.contains(&def.pipeline_yml_name))
            && self.enabled.is_none_or(|enabled| def.enabled == enabled)
            && (self.pipeline_definition_ids.is_empty()
                || self
                    .pipeline_definition_ids
                    .contains(&def.pipeline_definition_id))
            && self
                .cluster_name
                .as_ref()
                .is_none_or(|cluster| def.extra.cluster_name == *cluster)
    }

    /// Rows to skip before the requested page.
    pub fn offset(&self) -> u64 {
        self.page_no.saturating_sub(1).saturating_mul(self.page_size)
    }
}

/// One page of definitions plus the total match count.
#[derive(Debug, Clone, Serialize)]
pub struct CronPage {
    pub total: u64,
    pub data: Vec<CronDefinition>,
}

/// A cached build image tracked for garbage collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCacheRecord {
    pub cluster_name: String,
    pub name: String,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BuildCacheRecord {
    pub fn new(cluster_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            name: name.into(),
            last_pull_at: None,
            created_at: Utc::now(),
        }
    }

    /// Set the last pull time.
    pub fn with_last_pull_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_pull_at = Some(at);
        self
    }

    /// Set the creation time.
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Whether the record was last used strictly before `cutoff`.
    ///
    /// A record never pulled counts from its creation time.
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_pull_at.unwrap_or(self.created_at) < cutoff
    }
}

/// Storage trait for the definition store and build-cache records.
#[async_trait]
pub trait Storage: Send + Sync {
    // Cron definitions

    /// Insert a definition; the store assigns the id and returns the row.
    async fn create_cron(&self, def: CronDefinition) -> Result<CronDefinition, StorageError>;

    /// Get a definition by id.
    async fn get_cron(&self, id: CronId) -> Result<CronDefinition, StorageError>;

    /// Overwrite an existing definition.
    async fn update_cron(&self, def: CronDefinition) -> Result<(), StorageError>;

    /// Apply `patch` to the extra data of the stored definition, leaving
    /// every other column untouched.
    async fn patch_cron_extra(&self, id: CronId, patch: &CronExtraPatch)
    -> Result<(), StorageError>;

    /// Delete a definition by id.
    async fn delete_cron(&self, id: CronId) -> Result<(), StorageError>;

    /// Find the definition identified by `identity`, if any.
    async fn find_cron(
        &self,
        identity: &CronIdentity,
    ) -> Result<Option<CronDefinition>, StorageError>;

    /// Every enabled definition with a non-empty expression, by id.
    async fn list_enabled_crons(&self) -> Result<Vec<CronDefinition>, StorageError>;

    /// Filtered page of definitions, newest id first.
    async fn page_crons(&self, query: &CronQuery) -> Result<CronPage, StorageError>;

    // Build-cache records

    /// Insert or replace the record for `(cluster_name, name)`.
    async fn save_build_cache(&self, record: BuildCacheRecord) -> Result<(), StorageError>;

    /// Records last used strictly before `cutoff`.
    async fn list_expired_build_caches(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BuildCacheRecord>, StorageError>;

    /// Delete the record for `(cluster_name, name)`.
    async fn delete_build_cache(&self, cluster_name: &str, name: &str)
    -> Result<(), StorageError>;
}
