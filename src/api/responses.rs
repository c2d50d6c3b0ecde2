//! API response types.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::core::definition::{Compensator, CronDefinition};
use crate::core::schedule::Schedule;
use crate::engine::EntrySnapshot;
use crate::storage::CronPage;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// A cron definition as shown to API callers.
///
/// Secrets of the definition are never included.
#[derive(Debug, Serialize)]
pub struct CronResponse {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub pipeline_source: String,
    pub pipeline_yml_name: String,
    pub cron_expr: String,
    pub enable: bool,
    pub cluster_name: String,
    pub pipeline_definition_id: String,
    pub filter_labels: BTreeMap<String, String>,
    pub normal_labels: BTreeMap<String, String>,
    pub config_manage_namespaces: Vec<String>,
    pub cron_start_from: Option<DateTime<Utc>>,
    pub compensator: Option<Compensator>,
    /// Next activation, if enabled and the expression can fire.
    pub next_trigger_at: Option<DateTime<Utc>>,
}

impl From<CronDefinition> for CronResponse {
    fn from(def: CronDefinition) -> Self {
        let next_trigger_at = if def.is_schedulable() {
            Schedule::new(&def.cron_expr)
                .ok()
                .and_then(|s| s.next_after(Utc::now()))
        } else {
            None
        };
        Self {
            id: def.id.get(),
            created_at: def.created_at,
            updated_at: def.updated_at,
            pipeline_source: def.pipeline_source,
            pipeline_yml_name: def.pipeline_yml_name,
            cron_expr: def.cron_expr,
            enable: def.enabled,
            cluster_name: def.extra.cluster_name,
            pipeline_definition_id: def.pipeline_definition_id,
            filter_labels: def.extra.filter_labels,
            normal_labels: def.extra.normal_labels,
            config_manage_namespaces: def.extra.config_manage_namespaces,
            cron_start_from: def.extra.cron_start_from,
            compensator: def.extra.compensator,
            next_trigger_at,
        }
    }
}

/// One page of definitions.
#[derive(Debug, Serialize)]
pub struct CronListResponse {
    pub total: u64,
    pub data: Vec<CronResponse>,
}

impl From<CronPage> for CronListResponse {
    fn from(page: CronPage) -> Self {
        Self {
            total: page.total,
            data: page.data.into_iter().map(CronResponse::from).collect(),
        }
    }
}

/// Entries of this replica's engine.
#[derive(Debug, Serialize)]
pub struct EntryListResponse {
    pub entries: Vec<EntrySnapshot>,
    pub count: usize,
}

/// Outcome of a local reload.
#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub logs: Vec<String>,
}

/// Generic message response.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}
