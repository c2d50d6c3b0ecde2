//! Administrative operations on cron definitions.
//!
//! Every mutation is persisted first and then announced to the replicas
//! through a crond signal. A signal that cannot be published is returned as
//! an error; the row is already saved and the next full reload picks it up.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::core::definition::{Compensator, CronDefinition, CronIdentity, EXTRA_VERSION_V2, labels};
use crate::core::schedule::Schedule;
use crate::core::types::CronId;
use crate::daemon::{Crond, CrondError};
use crate::storage::{CronPage, CronQuery, DEFAULT_PAGE_SIZE, Storage, StorageError};

/// Errors returned by [`CronService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request is malformed.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The addressed definition does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The change was saved but could not be announced.
    #[error("crond error: {0}")]
    Crond(#[from] CrondError),
}

/// Request to create (or upsert) a definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CreateCronRequest {
    pub pipeline_source: String,
    pub pipeline_yml_name: String,
    pub pipeline_yml: String,
    /// Falls back to the `cron` field of the pipeline yml.
    pub cron_expr: String,
    pub enable: bool,
    pub cluster_name: String,
    pub filter_labels: BTreeMap<String, String>,
    pub normal_labels: BTreeMap<String, String>,
    pub envs: BTreeMap<String, String>,
    pub config_manage_namespaces: Vec<String>,
    pub incoming_secrets: BTreeMap<String, String>,
    pub cron_start_from: Option<DateTime<Utc>>,
    pub pipeline_definition_id: String,
    pub application_id: Option<u64>,
    pub branch: Option<String>,
    /// Caller identity; becomes the run-as user if none is labelled.
    pub user_id: Option<String>,
    pub owner_user_id: Option<String>,
}

impl Default for CreateCronRequest {
    fn default() -> Self {
        Self {
            pipeline_source: String::new(),
            pipeline_yml_name: String::new(),
            pipeline_yml: String::new(),
            cron_expr: String::new(),
            enable: true,
            cluster_name: String::new(),
            filter_labels: BTreeMap::new(),
            normal_labels: BTreeMap::new(),
            envs: BTreeMap::new(),
            config_manage_namespaces: Vec::new(),
            incoming_secrets: BTreeMap::new(),
            cron_start_from: None,
            pipeline_definition_id: String::new(),
            application_id: None,
            branch: None,
            user_id: None,
            owner_user_id: None,
        }
    }
}

/// Request to update an existing definition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateCronRequest {
    pub cron_expr: String,
    pub pipeline_yml: String,
    /// Merged into the existing namespaces.
    pub config_manage_namespaces: Vec<String>,
    pub incoming_secrets: BTreeMap<String, String>,
    /// Replaces the definition id when non-empty.
    pub pipeline_definition_id: String,
}

/// Paging request as received from callers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PagingRequest {
    pub sources: Vec<String>,
    pub yml_names: Vec<String>,
    pub enabled: Option<bool>,
    pub pipeline_definition_ids: Vec<String>,
    pub cluster_name: Option<String>,
    pub page_no: i64,
    pub page_size: i64,
    pub get_all: bool,
}

impl PagingRequest {
    fn into_query(self) -> Result<CronQuery, ServiceError> {
        if self.page_no < 0 {
            return Err(ServiceError::InvalidParameter(format!(
                "page_no must not be negative: {}",
                self.page_no
            )));
        }
        if self.page_size < 0 {
            return Err(ServiceError::InvalidParameter(format!(
                "page_size must not be negative: {}",
                self.page_size
            )));
        }
        Ok(CronQuery {
            sources: self.sources,
            yml_names: self.yml_names,
            enabled: self.enabled,
            pipeline_definition_ids: self.pipeline_definition_ids,
            cluster_name: self.cluster_name.filter(|c| !c.is_empty()),
            page_no: if self.page_no == 0 { 1 } else { self.page_no as u64 },
            page_size: if self.page_size == 0 {
                DEFAULT_PAGE_SIZE
            } else {
                self.page_size as u64
            },
            get_all: self.get_all,
        })
    }
}

/// Fields of the pipeline yml the service reads.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PipelineYmlSpec {
    cron: String,
    cron_compensator: Option<Compensator>,
}

fn parse_pipeline_yml(yml: &str) -> Result<PipelineYmlSpec, ServiceError> {
    serde_yaml::from_str::<Option<PipelineYmlSpec>>(yml)
        .map(Option::unwrap_or_default)
        .map_err(|e| ServiceError::InvalidParameter(format!("invalid pipeline yml: {}", e)))
}

fn validate_expr(expr: &str) -> Result<(), ServiceError> {
    if expr.trim().is_empty() {
        return Ok(());
    }
    Schedule::new(expr)
        .map(|_| ())
        .map_err(|e| ServiceError::InvalidParameter(e.to_string()))
}

fn not_found(id: CronId) -> impl FnOnce(StorageError) -> ServiceError {
    move |e| match e {
        StorageError::NotFound(_) => ServiceError::NotFound(format!("cron {}", id)),
        other => ServiceError::Storage(other),
    }
}

/// Create/update/delete/get/paging/start/stop over the definition store.
pub struct CronService<S: Storage> {
    storage: Arc<S>,
    crond: Crond<S>,
}

impl<S: Storage> Clone for CronService<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            crond: self.crond.clone(),
        }
    }
}

impl<S: Storage + 'static> CronService<S> {
    pub fn new(storage: Arc<S>, crond: Crond<S>) -> Self {
        Self { storage, crond }
    }

    /// The daemon changes are announced to.
    pub fn crond(&self) -> &Crond<S> {
        &self.crond
    }

    /// Create a definition, or update the one with the same identity.
    ///
    /// An existing row keeps its enabled flag. An empty expression saves
    /// the definition disabled.
    pub async fn create(&self, req: CreateCronRequest) -> Result<CronDefinition, ServiceError> {
        if req.pipeline_source.trim().is_empty() {
            return Err(ServiceError::InvalidParameter("missing pipeline_source".into()));
        }
        if req.pipeline_yml_name.trim().is_empty() {
            return Err(ServiceError::InvalidParameter("missing pipeline_yml_name".into()));
        }
        if req.pipeline_yml.trim().is_empty() {
            return Err(ServiceError::InvalidParameter("missing pipeline_yml".into()));
        }

        let spec = parse_pipeline_yml(&req.pipeline_yml)?;
        let cron_expr = if req.cron_expr.trim().is_empty() {
            spec.cron
        } else {
            req.cron_expr
        };
        validate_expr(&cron_expr)?;

        let mut normal_labels = req.normal_labels;
        let mut filter_labels = req.filter_labels;
        if let Some(user) = req.user_id.filter(|u| !u.is_empty()) {
            normal_labels.entry(labels::USER_ID.to_string()).or_insert(user);
        }
        if let Some(owner) = req.owner_user_id.filter(|u| !u.is_empty()) {
            filter_labels.entry(labels::OWNER_USER_ID.to_string()).or_insert(owner);
        }
        if let Some(owner) = filter_labels.get(labels::OWNER_USER_ID) {
            normal_labels.insert(labels::OWNER_USER_ID.to_string(), owner.clone());
        }

        let mut def = CronDefinition::new(req.pipeline_source, req.pipeline_yml_name, cron_expr);
        def.enabled = req.enable && !def.cron_expr.trim().is_empty();
        def.application_id = req.application_id;
        def.branch = req.branch;
        def.pipeline_definition_id = req.pipeline_definition_id;
        def.extra.pipeline_yml = req.pipeline_yml;
        def.extra.cluster_name = req.cluster_name;
        def.extra.filter_labels = filter_labels;
        def.extra.normal_labels = normal_labels;
        def.extra.envs = req.envs;
        def.extra.config_manage_namespaces = req.config_manage_namespaces;
        def.extra.incoming_secrets = req.incoming_secrets;
        def.extra.cron_start_from = req.cron_start_from;
        def.extra.version = EXTRA_VERSION_V2.to_string();
        def.extra.compensator = spec.cron_compensator;

        let def = self.upsert(def).await?;
        if def.is_schedulable() {
            self.crond.add_into_crond(&def).await?;
        }
        Ok(def)
    }

    async fn upsert(&self, mut def: CronDefinition) -> Result<CronDefinition, ServiceError> {
        let schedulable = !def.cron_expr.trim().is_empty();
        match self.find_existing(&def).await? {
            Some(existing) => {
                def.id = existing.id;
                def.created_at = existing.created_at;
                def.enabled = schedulable && existing.enabled;
                def.updated_at = Utc::now();
                self.storage.update_cron(def.clone()).await?;
                tracing::info!(cron_id = %def.id, "cron definition updated in place");
                Ok(def)
            }
            None => {
                let def = self.storage.create_cron(def).await?;
                tracing::info!(cron_id = %def.id, "cron definition created");
                Ok(def)
            }
        }
    }

    async fn find_existing(
        &self,
        def: &CronDefinition,
    ) -> Result<Option<CronDefinition>, ServiceError> {
        if let (Some(application_id), Some(branch)) = (def.application_id, &def.branch) {
            let legacy = CronIdentity::Legacy {
                application_id,
                branch: branch.clone(),
                pipeline_yml_name: def.pipeline_yml_name.clone(),
            };
            if let Some(found) = self.storage.find_cron(&legacy).await? {
                return Ok(Some(found));
            }
        }
        Ok(self.storage.find_cron(&def.source_identity()).await?)
    }

    /// Replace the expression and yml of an existing definition.
    pub async fn update(
        &self,
        id: CronId,
        req: UpdateCronRequest,
    ) -> Result<CronDefinition, ServiceError> {
        let mut def = self.storage.get_cron(id).await.map_err(not_found(id))?;

        let spec = parse_pipeline_yml(&req.pipeline_yml)?;
        validate_expr(&req.cron_expr)?;

        if spec.cron_compensator.is_some() {
            def.extra.compensator = spec.cron_compensator;
        }
        def.cron_expr = req.cron_expr;
        def.extra.pipeline_yml = req.pipeline_yml;
        for namespace in req.config_manage_namespaces {
            if !def.extra.config_manage_namespaces.contains(&namespace) {
                def.extra.config_manage_namespaces.push(namespace);
            }
        }
        def.extra.incoming_secrets = req.incoming_secrets;
        if !req.pipeline_definition_id.is_empty() {
            def.pipeline_definition_id = req.pipeline_definition_id;
        }
        def.updated_at = Utc::now();

        self.storage.update_cron(def.clone()).await?;
        if def.enabled {
            self.crond.add_into_crond(&def).await?;
        }
        Ok(def)
    }

    /// Delete a definition and drop its entry everywhere.
    pub async fn delete(&self, id: CronId) -> Result<(), ServiceError> {
        let def = self.storage.get_cron(id).await.map_err(not_found(id))?;
        self.storage.delete_cron(id).await.map_err(not_found(id))?;
        self.crond.delete_from_crond(&def).await?;
        tracing::info!(cron_id = %id, "cron definition deleted");
        Ok(())
    }

    /// Get a definition; `None` if it does not exist.
    pub async fn get(&self, id: CronId) -> Result<Option<CronDefinition>, ServiceError> {
        match self.storage.get_cron(id).await {
            Ok(def) => Ok(Some(def)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn paging(&self, req: PagingRequest) -> Result<CronPage, ServiceError> {
        let query = req.into_query()?;
        Ok(self.storage.page_crons(&query).await?)
    }

    /// Enable a definition.
    pub async fn start(&self, id: CronId) -> Result<CronDefinition, ServiceError> {
        self.operate(id, true).await
    }

    /// Disable a definition.
    pub async fn stop(&self, id: CronId) -> Result<CronDefinition, ServiceError> {
        self.operate(id, false).await
    }

    async fn operate(&self, id: CronId, enable: bool) -> Result<CronDefinition, ServiceError> {
        let mut def = self.storage.get_cron(id).await.map_err(not_found(id))?;
        def.enabled = enable;
        def.updated_at = Utc::now();
        self.storage.update_cron(def.clone()).await?;

        if enable {
            if def.is_schedulable() {
                self.crond.add_into_crond(&def).await?;
            }
        } else {
            self.crond.delete_from_crond(&def).await?;
        }
        tracing::info!(cron_id = %id, enabled = enable, "cron definition switched");
        Ok(def)
    }
}
