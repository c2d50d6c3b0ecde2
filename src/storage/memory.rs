//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{BuildCacheRecord, CronExtraPatch, CronPage, CronQuery, Storage, StorageError};
use crate::core::definition::{CronDefinition, CronIdentity};
use crate::core::types::CronId;

struct Crons {
    next_id: u64,
    rows: BTreeMap<CronId, CronDefinition>,
}

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    crons: RwLock<Crons>,
    build_caches: RwLock<HashMap<(String, String), BuildCacheRecord>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            crons: RwLock::new(Crons {
                next_id: 1,
                rows: BTreeMap::new(),
            }),
            build_caches: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_cron(&self, mut def: CronDefinition) -> Result<CronDefinition, StorageError> {
        let mut crons = self.crons.write().map_err(|_| StorageError::LockPoisoned)?;
        def.id = CronId::new(crons.next_id);
        crons.next_id += 1;
        crons.rows.insert(def.id, def.clone());
        Ok(def)
    }

    async fn get_cron(&self, id: CronId) -> Result<CronDefinition, StorageError> {
        let crons = self.crons.read().map_err(|_| StorageError::LockPoisoned)?;
        crons
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("cron: {}", id)))
    }

    async fn update_cron(&self, def: CronDefinition) -> Result<(), StorageError> {
        let mut crons = self.crons.write().map_err(|_| StorageError::LockPoisoned)?;
        match crons.rows.get_mut(&def.id) {
            Some(row) => {
                *row = def;
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("cron: {}", def.id))),
        }
    }

    async fn patch_cron_extra(
        &self,
        id: CronId,
        patch: &CronExtraPatch,
    ) -> Result<(), StorageError> {
        let mut crons = self.crons.write().map_err(|_| StorageError::LockPoisoned)?;
        let row = crons
            .rows
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("cron: {}", id)))?;
        patch.apply(&mut row.extra);
        Ok(())
    }

    async fn delete_cron(&self, id: CronId) -> Result<(), StorageError> {
        let mut crons = self.crons.write().map_err(|_| StorageError::LockPoisoned)?;
        crons
            .rows
            .remove(&id)
            .ok_or_else(|| StorageError::NotFound(format!("cron: {}", id)))?;
        Ok(())
    }

    async fn find_cron(
        &self,
        identity: &CronIdentity,
    ) -> Result<Option<CronDefinition>, StorageError> {
        let crons = self.crons.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(crons.rows.values().find(|def| identity.matches(def)).cloned())
    }

    async fn list_enabled_crons(&self) -> Result<Vec<CronDefinition>, StorageError> {
        let crons = self.crons.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(crons
            .rows
            .values()
            .filter(|def| def.is_schedulable())
            .cloned()
            .collect())
    }

    async fn page_crons(&self, query: &CronQuery) -> Result<CronPage, StorageError> {
        let crons = self.crons.read().map_err(|_| StorageError::LockPoisoned)?;
        let matched: Vec<&CronDefinition> = crons
            .rows
            .values()
            .rev()
            .filter(|def| query.matches(def))
            .collect();
        let total = matched.len() as u64;

        let data = if query.get_all {
            matched.into_iter().cloned().collect()
        } else {
            matched
                .into_iter()
                .skip(usize::try_from(query.offset()).unwrap_or(usize::MAX))
                .take(usize::try_from(query.page_size).unwrap_or(usize::MAX))
                .cloned()
                .collect()
        };

        Ok(CronPage { total, data })
    }

    async fn save_build_cache(&self, record: BuildCacheRecord) -> Result<(), StorageError> {
        let mut caches = self
            .build_caches
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        caches.insert(
            (record.cluster_name.clone(), record.name.clone()),
            record,
        );
        Ok(())
    }

    async fn list_expired_build_caches(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BuildCacheRecord>, StorageError> {
        let caches = self
            .build_caches
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut expired: Vec<BuildCacheRecord> = caches
            .values()
            .filter(|record| record.is_expired(cutoff))
            .cloned()
            .collect();
        expired.sort_by(|a, b| {
            (a.cluster_name.as_str(), a.name.as_str()).cmp(&(b.cluster_name.as_str(), b.name.as_str()))
        });
        Ok(expired)
    }

    async fn delete_build_cache(
        &self,
        cluster_name: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        let mut caches = self
            .build_caches
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        caches
            .remove(&(cluster_name.to_string(), name.to_string()))
            .ok_or_else(|| StorageError::NotFound(format!("build cache: {}/{}", cluster_name, name)))?;
        Ok(())
    }
}
