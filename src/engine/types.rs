//! Engine type definitions.
//!
//! Error types, job types, entry state and the commands exchanged between a
//! [`CronEngine`](super::CronEngine) and its run loop.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::schedule::{Schedule, ScheduleError};

/// Errors that can occur in the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The cron expression did not parse.
    #[error("invalid expression: {0}")]
    InvalidExpression(#[from] ScheduleError),

    /// No entry with this name is scheduled.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// An entry with this name is already scheduled.
    #[error("duplicate entry name: {0}")]
    DuplicateName(String),

    /// The run loop could not be reached.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// Future produced by one job invocation.
pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A job: invoked with the scheduled instant that triggered it.
pub type JobFn = Arc<dyn Fn(DateTime<Utc>) -> JobFuture + Send + Sync>;

/// Wrap an async closure as a [`JobFn`].
pub fn job_fn<F, Fut>(f: F) -> JobFn
where
    F: Fn(DateTime<Utc>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |trigger_at| Box::pin(f(trigger_at)) as JobFuture)
}

/// A scheduled entry. Owned by the engine; callers see [`EntrySnapshot`].
pub(crate) struct Entry {
    pub(crate) name: String,
    pub(crate) schedule: Schedule,
    pub(crate) next: Option<DateTime<Utc>>,
    pub(crate) prev: Option<DateTime<Utc>>,
    pub(crate) job: JobFn,
}

impl Entry {
    pub(crate) fn new(name: String, schedule: Schedule, job: JobFn) -> Self {
        Self {
            name,
            schedule,
            next: None,
            prev: None,
            job,
        }
    }

    pub(crate) fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            name: self.name.clone(),
            expression: self.schedule.expression().to_string(),
            next: self.next,
            prev: self.prev,
        }
    }
}

/// Read-only copy of an entry's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySnapshot {
    pub name: String,
    pub expression: String,
    /// Next activation; `None` while stopped or if it never fires again.
    pub next: Option<DateTime<Utc>>,
    /// Last activation fired.
    pub prev: Option<DateTime<Utc>>,
}

/// Commands that can be sent to the run loop.
pub(crate) enum EngineCommand {
    Add {
        entry: Entry,
        response: oneshot::Sender<Result<(), EngineError>>,
    },
    Remove {
        name: String,
        response: oneshot::Sender<Result<(), EngineError>>,
    },
    Snapshot {
        response: oneshot::Sender<Vec<EntrySnapshot>>,
    },
    Stop {
        response: oneshot::Sender<()>,
    },
}
