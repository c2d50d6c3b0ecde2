//! The crond reconciliation daemon and the jobs it schedules.
//!
//! - [`Crond`] keeps this replica's engine in line with the definition store
//!   and reacts to schedule-change signals.
//! - [`BuildCacheGc`] and [`InterruptCompensator`] run as engine entries next
//!   to the per-definition entries.

mod compensate;
mod crond;
mod gc;
mod trigger;

pub use compensate::{
    COMPENSATOR_ENTRY_NAME, CompensationReport, DEFAULT_MAX_INSTANTS, InterruptCompensator,
};
pub use crond::{CompensatorOptions, Crond, CrondBuilder, CrondOptions};
pub use gc::{
    BuildCacheGc, CleanerError, ClusterOutcome, DryRunCleaner, GC_ENTRY_NAME, GcReport,
    ImageCleaner,
};
pub use trigger::{
    COMPENSATOR_CLIENT, LoggingTrigger, PipelineRef, PipelineTrigger, TriggerError,
    TriggerRequest,
};

use thiserror::Error;

use crate::coordination::CoordinationError;
use crate::core::types::CronId;
use crate::engine::EngineError;
use crate::storage::StorageError;

/// Errors from the daemon.
#[derive(Debug, Error)]
pub enum CrondError {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Engine error.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Coordination store error.
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// Pipeline trigger error.
    #[error("trigger error: {0}")]
    Trigger(#[from] TriggerError),

    /// A stored definition is unusable.
    #[error("invalid cron definition {id}: {message}")]
    Definition { id: CronId, message: String },
}
