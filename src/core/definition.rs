//! Durable cron definitions and their identity rules.
//!
//! A [`CronDefinition`] is one row of the definition store: which pipeline
//! to run, on which schedule, with which labels and environment. Rows are
//! identified either by the legacy `(application, branch, yml name)` triple
//! or by `(source, yml name)`; see [`CronIdentity`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::CronId;

/// Extra-blob version stamped on definitions created through the current
/// service. Such rows never match the legacy identity lookup.
pub const EXTRA_VERSION_V2: &str = "v2";

/// Trigger mode recorded on pipelines created by the scheduler.
pub const TRIGGER_MODE_CRON: &str = "cron";

/// Well-known label keys.
pub mod labels {
    /// User the pipeline runs as.
    pub const USER_ID: &str = "userID";
    /// User that owns the definition.
    pub const OWNER_USER_ID: &str = "ownerUserID";
    /// How the pipeline was triggered.
    pub const TRIGGER_MODE: &str = "pipelineTriggerMode";
    /// Scheduled instant of a cron-triggered pipeline, unix nanoseconds.
    pub const CRON_TRIGGER_TIME: &str = "cronTriggerTime";
    /// Definition that produced a cron-triggered pipeline.
    pub const CRON_ID: &str = "cronID";
    /// Set on pipelines created by interrupt compensation.
    pub const CRON_COMPENSATED: &str = "cronCompensated";
}

/// How missed trigger instants of a definition are caught up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Compensator {
    /// Whether missed instants are compensated at all.
    pub enable: bool,
    /// Compensate the most recent missed instant first.
    pub latest_first: bool,
    /// Stop compensating once a later run has already executed.
    pub stop_if_latter_executed: bool,
}

impl Default for Compensator {
    fn default() -> Self {
        Self {
            enable: false,
            latest_first: true,
            stop_if_latter_executed: true,
        }
    }
}

/// Schemaless part of a definition, persisted as one JSON column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronExtra {
    pub pipeline_yml: String,
    pub cluster_name: String,
    pub filter_labels: BTreeMap<String, String>,
    pub normal_labels: BTreeMap<String, String>,
    pub envs: BTreeMap<String, String>,
    pub config_manage_namespaces: Vec<String>,
    pub incoming_secrets: BTreeMap<String, String>,
    /// Triggers scheduled before this instant are suppressed.
    pub cron_start_from: Option<DateTime<Utc>>,
    pub version: String,
    pub compensator: Option<Compensator>,
    pub last_compensate_at: Option<DateTime<Utc>>,
}

/// One durable cron definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronDefinition {
    pub id: CronId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub pipeline_source: String,
    pub pipeline_yml_name: String,
    pub cron_expr: String,
    pub enabled: bool,
    pub extra: CronExtra,
    pub application_id: Option<u64>,
    pub branch: Option<String>,
    pub base_pipeline_id: Option<u64>,
    pub pipeline_definition_id: String,
}

impl CronDefinition {
    /// Create an unsaved definition; the store assigns the id.
    pub fn new(
        pipeline_source: impl Into<String>,
        pipeline_yml_name: impl Into<String>,
        cron_expr: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CronId::new(0),
            created_at: now,
            updated_at: now,
            pipeline_source: pipeline_source.into(),
            pipeline_yml_name: pipeline_yml_name.into(),
            cron_expr: cron_expr.into(),
            enabled: true,
            extra: CronExtra {
                version: EXTRA_VERSION_V2.to_string(),
                ..CronExtra::default()
            },
            application_id: None,
            branch: None,
            base_pipeline_id: None,
            pipeline_definition_id: String::new(),
        }
    }

    /// Set enabled status.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the pipeline yml body.
    pub fn with_yml(mut self, yml: impl Into<String>) -> Self {
        self.extra.pipeline_yml = yml.into();
        self
    }

    /// Suppress triggers scheduled before `from`.
    pub fn with_start_from(mut self, from: DateTime<Utc>) -> Self {
        self.extra.cron_start_from = Some(from);
        self
    }

    /// Whether this definition should have a live engine entry.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && !self.cron_expr.trim().is_empty()
    }

    /// Whether a trigger scheduled at `instant` falls before the start
    /// boundary and must be skipped.
    pub fn is_suppressed_at(&self, instant: DateTime<Utc>) -> bool {
        self.extra
            .cron_start_from
            .is_some_and(|from| instant < from)
    }

    /// Whether the extra blob carries the current version tag.
    pub fn is_v2(&self) -> bool {
        self.extra.version == EXTRA_VERSION_V2
    }

    /// The legacy identity, if this row can be matched by it.
    pub fn legacy_identity(&self) -> Option<CronIdentity> {
        if self.is_v2() {
            return None;
        }
        match (self.application_id, &self.branch) {
            (Some(application_id), Some(branch)) => Some(CronIdentity::Legacy {
                application_id,
                branch: branch.clone(),
                pipeline_yml_name: self.pipeline_yml_name.clone(),
            }),
            _ => None,
        }
    }

    /// The `(source, yml name)` identity.
    pub fn source_identity(&self) -> CronIdentity {
        CronIdentity::Source {
            pipeline_source: self.pipeline_source.clone(),
            pipeline_yml_name: self.pipeline_yml_name.clone(),
        }
    }

    /// Compensator settings, falling back to the default.
    pub fn compensator(&self) -> Compensator {
        self.extra.compensator.unwrap_or_default()
    }
}

/// Key used to find an existing definition during upsert.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CronIdentity {
    /// `(application_id, branch, pipeline_yml_name)`, only matching rows
    /// whose extra version is not `v2`.
    Legacy {
        application_id: u64,
        branch: String,
        pipeline_yml_name: String,
    },
    /// `(pipeline_source, pipeline_yml_name)`.
    Source {
        pipeline_source: String,
        pipeline_yml_name: String,
    },
}

impl CronIdentity {
    /// Whether `def` is identified by this key.
    pub fn matches(&self, def: &CronDefinition) -> bool {
        match self {
            CronIdentity::Legacy {
                application_id,
                branch,
                pipeline_yml_name,
            } => {
                !def.is_v2()
                    && def.application_id == Some(*application_id)
                    && def.branch.as_deref() == Some(branch.as_str())
                    && def.pipeline_yml_name == *pipeline_yml_name
            }
            CronIdentity::Source {
                pipeline_source,
                pipeline_yml_name,
            } => {
                def.pipeline_source == *pipeline_source
                    && def.pipeline_yml_name == *pipeline_yml_name
            }
        }
    }
}
