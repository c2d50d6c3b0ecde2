//! The pipeline-creation callback invoked when a definition fires.
//!
//! Running pipelines is outside this crate; [`PipelineTrigger`] is the seam
//! where an execution engine plugs in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::core::definition::{CronDefinition, TRIGGER_MODE_CRON, labels};
use crate::core::types::CronId;

/// Internal client name recorded on compensation-created pipelines.
pub const COMPENSATOR_CLIENT: &str = "system-cron-compensator";

/// Errors returned by a [`PipelineTrigger`].
#[derive(Debug, Error)]
pub enum TriggerError {
    /// The pipeline service refused the request.
    #[error("pipeline creation rejected: {0}")]
    Rejected(String),

    /// The pipeline service could not be reached.
    #[error("pipeline service unavailable: {0}")]
    Unavailable(String),
}

/// Everything the execution engine needs to create one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerRequest {
    pub cron_id: CronId,
    /// Scheduled instant this pipeline stands for.
    pub trigger_at: DateTime<Utc>,
    pub pipeline_source: String,
    pub pipeline_yml_name: String,
    pub pipeline_yml: String,
    pub cluster_name: String,
    pub pipeline_definition_id: String,
    pub filter_labels: BTreeMap<String, String>,
    pub normal_labels: BTreeMap<String, String>,
    pub envs: BTreeMap<String, String>,
    pub config_manage_namespaces: Vec<String>,
    pub incoming_secrets: BTreeMap<String, String>,
    /// Actor the pipeline runs as.
    pub user_id: Option<String>,
    /// Set when the request comes from an internal component.
    pub internal_client: Option<String>,
    pub compensated: bool,
}

impl TriggerRequest {
    /// Request for a regular cron fire of `def` at `trigger_at`.
    pub fn for_cron(def: &CronDefinition, trigger_at: DateTime<Utc>) -> Self {
        let extra = &def.extra;
        let mut filter_labels = extra.filter_labels.clone();
        let mut normal_labels = extra.normal_labels.clone();

        if filter_labels.contains_key(labels::TRIGGER_MODE) {
            filter_labels.insert(labels::TRIGGER_MODE.to_string(), TRIGGER_MODE_CRON.to_string());
        }
        normal_labels.insert(labels::TRIGGER_MODE.to_string(), TRIGGER_MODE_CRON.to_string());
        normal_labels.insert(
            labels::CRON_TRIGGER_TIME.to_string(),
            trigger_at
                .timestamp_nanos_opt()
                .unwrap_or_else(|| trigger_at.timestamp().saturating_mul(1_000_000_000))
                .to_string(),
        );
        normal_labels.insert(labels::CRON_ID.to_string(), def.id.to_string());

        Self {
            cron_id: def.id,
            trigger_at,
            pipeline_source: def.pipeline_source.clone(),
            pipeline_yml_name: def.pipeline_yml_name.clone(),
            pipeline_yml: extra.pipeline_yml.clone(),
            cluster_name: extra.cluster_name.clone(),
            pipeline_definition_id: def.pipeline_definition_id.clone(),
            user_id: normal_labels.get(labels::USER_ID).cloned(),
            filter_labels,
            normal_labels,
            envs: extra.envs.clone(),
            config_manage_namespaces: extra.config_manage_namespaces.clone(),
            incoming_secrets: extra.incoming_secrets.clone(),
            internal_client: None,
            compensated: false,
        }
    }

    /// Request catching up a missed instant of `def`.
    pub fn for_compensation(def: &CronDefinition, trigger_at: DateTime<Utc>) -> Self {
        let mut request = Self::for_cron(def, trigger_at);
        request
            .filter_labels
            .insert(labels::CRON_COMPENSATED.to_string(), "true".to_string());
        request.internal_client = Some(COMPENSATOR_CLIENT.to_string());
        request.compensated = true;
        request
    }
}

/// Reference to a created pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineRef {
    pub id: u64,
}

/// Creates pipelines on behalf of the scheduler.
#[async_trait]
pub trait PipelineTrigger: Send + Sync {
    /// Create (and start) a pipeline for `request`.
    async fn create_pipeline(&self, request: TriggerRequest) -> Result<PipelineRef, TriggerError>;

    /// Trigger instants of cron-created pipelines of `cron_id` within
    /// `[start, end]`. Used to tell missed instants from executed ones.
    async fn cron_triggered_instants(
        &self,
        cron_id: CronId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, TriggerError>;
}

/// Trigger that only logs requests.
///
/// Used by the standalone binary when no execution engine is attached.
#[derive(Debug, Default)]
pub struct LoggingTrigger;

#[async_trait]
impl PipelineTrigger for LoggingTrigger {
    async fn create_pipeline(&self, request: TriggerRequest) -> Result<PipelineRef, TriggerError> {
        tracing::info!(
            cron_id = %request.cron_id,
            trigger_at = %request.trigger_at,
            source = %request.pipeline_source,
            yml_name = %request.pipeline_yml_name,
            compensated = request.compensated,
            "pipeline trigger requested"
        );
        Ok(PipelineRef { id: 0 })
    }

    async fn cron_triggered_instants(
        &self,
        _cron_id: CronId,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, TriggerError> {
        Ok(Vec::new())
    }
}
