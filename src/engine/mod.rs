//! Cron engine: named entries fired by a single run loop.
//!
//! Jobs run on their own tasks. When a [`DistributedLock`] is configured,
//! each fire first creates the lock key for its `(entry, instant)` pair and
//! only the replica that created it runs the job.
//!
//! [`DistributedLock`]: crate::coordination::DistributedLock

mod handle;
mod runner;
mod types;

pub use handle::{CronEngine, CronEngineBuilder, DEFAULT_LOCK_HOLD};
pub use types::{EngineError, EntrySnapshot, JobFn, JobFuture, job_fn};
