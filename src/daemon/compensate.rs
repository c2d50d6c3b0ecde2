//! Interrupt compensation: catch up instants missed while no replica ran.
//!
//! Each round looks at every enabled definition, lists the activations in
//! its compensation window, asks the trigger collaborator which of them
//! already produced a pipeline and triggers the rest. The window starts at
//! the definition's last compensation point (or its last update), is capped
//! to one day, and ends a grace period before now so it never races the
//! regular cron fire.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::trigger::{PipelineTrigger, TriggerRequest};
use super::CrondError;
use crate::core::definition::CronDefinition;
use crate::core::schedule::Schedule;
use crate::events::{Event, EventBus};
use crate::storage::{CronExtraPatch, Storage};

/// Name of the engine entry running compensation rounds.
pub const COMPENSATOR_ENTRY_NAME: &str = "cron-compensator";

/// Default upper bound of instants compensated per definition per round.
pub const DEFAULT_MAX_INSTANTS: usize = 100;

const MAX_WINDOW_HOURS: i64 = 24;

/// Outcome of one compensation round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    pub definitions: usize,
    pub triggered: usize,
    pub failed: usize,
}

/// Runs compensation rounds over the definition store.
pub struct InterruptCompensator<S: Storage> {
    storage: Arc<S>,
    trigger: Arc<dyn PipelineTrigger>,
    grace: Duration,
    max_instants: usize,
    events: Option<Arc<EventBus>>,
}

impl<S: Storage> Clone for InterruptCompensator<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            trigger: Arc::clone(&self.trigger),
            grace: self.grace,
            max_instants: self.max_instants,
            events: self.events.clone(),
        }
    }
}

impl<S: Storage> InterruptCompensator<S> {
    pub fn new(storage: Arc<S>, trigger: Arc<dyn PipelineTrigger>, grace: Duration) -> Self {
        Self {
            storage,
            trigger,
            grace,
            max_instants: DEFAULT_MAX_INSTANTS,
            events: None,
        }
    }

    /// Cap instants compensated per definition per round.
    pub fn with_max_instants(mut self, max: usize) -> Self {
        self.max_instants = max;
        self
    }

    /// Report triggers to `events`.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Compensate every enabled definition relative to `now`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<CompensationReport, CrondError> {
        let definitions = self.storage.list_enabled_crons().await?;
        let mut report = CompensationReport {
            definitions: definitions.len(),
            ..CompensationReport::default()
        };

        for def in definitions {
            match self.compensate(def, now).await {
                Ok(triggered) => report.triggered += triggered,
                Err(e) => {
                    tracing::error!(error = %e, "failed to do interrupt compensation");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Compensate one definition; returns the number of pipelines created.
    pub async fn compensate(
        &self,
        def: CronDefinition,
        now: DateTime<Utc>,
    ) -> Result<usize, CrondError> {
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::zero());
        let window_end = now - grace;
        let window_start = window_start(&def, now);

        let schedule = Schedule::new(&def.cron_expr).map_err(|e| CrondError::Definition {
            id: def.id,
            message: e.to_string(),
        })?;

        let mut missed = Vec::new();
        if window_start < window_end {
            let needed: Vec<DateTime<Utc>> = schedule
                .between(window_start, window_end, self.max_instants)
                .into_iter()
                .filter(|t| !def.is_suppressed_at(*t))
                .collect();

            if !needed.is_empty() {
                let executed = self
                    .trigger
                    .cron_triggered_instants(def.id, window_start, window_end)
                    .await?;
                missed = select_missed(&def, needed, &executed);
            }
        }

        let mut triggered = 0;
        for instant in missed {
            let request = TriggerRequest::for_compensation(&def, instant);
            match self.trigger.create_pipeline(request).await {
                Ok(pipeline) => {
                    tracing::info!(cron_id = %def.id, trigger_at = %instant, pipeline_id = pipeline.id, "interrupt compensation triggered");
                    if let Some(bus) = &self.events {
                        bus.emit(Event::cron_triggered(def.id, instant, true)).await;
                    }
                    triggered += 1;
                }
                Err(e) => {
                    tracing::error!(cron_id = %def.id, trigger_at = %instant, error = %e, "failed to trigger interrupt compensation");
                    if let Some(bus) = &self.events {
                        bus.emit(Event::cron_trigger_failed(def.id, instant, e.to_string()))
                            .await;
                    }
                }
            }
        }

        self.storage
            .patch_cron_extra(def.id, &CronExtraPatch::compensated_until(window_end))
            .await?;
        Ok(triggered)
    }
}

fn window_start(def: &CronDefinition, now: DateTime<Utc>) -> DateTime<Utc> {
    let from = def.extra.last_compensate_at.unwrap_or(def.updated_at);
    from.max(now - chrono::Duration::hours(MAX_WINDOW_HOURS))
}

/// Instants not yet executed, ordered per the definition's compensator.
fn select_missed(
    def: &CronDefinition,
    needed: Vec<DateTime<Utc>>,
    executed: &[DateTime<Utc>],
) -> Vec<DateTime<Utc>> {
    let compensator = def.compensator();
    let executed_secs: HashSet<i64> = executed.iter().map(|t| t.timestamp()).collect();
    let latest_executed = executed.iter().max().copied();

    let mut missed: Vec<DateTime<Utc>> = needed
        .into_iter()
        .filter(|t| !executed_secs.contains(&t.timestamp()))
        .filter(|t| {
            !compensator.stop_if_latter_executed || latest_executed.is_none_or(|latest| latest < *t)
        })
        .collect();

    if compensator.latest_first {
        missed.reverse();
    }
    missed
}
