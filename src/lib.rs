//! pipecron - distributed cron scheduling for recurring pipeline execution.
//!
//! Several replicas run the same set of cron definitions. Each replica keeps
//! an in-process [`CronEngine`] in line with the definition store, and a
//! per-instant lock in the coordination store makes sure exactly one replica
//! creates the pipeline for a given trigger instant.

pub mod api;
pub mod config;
pub mod coordination;
pub mod core;
pub mod daemon;
pub mod engine;
pub mod events;
pub mod service;
pub mod storage;
pub mod testing;

pub use config::{ConfigError, ConfigLoader, CrondConfig};
pub use coordination::{
    CoordinationError, DistributedLock, InMemoryCoordinator, LockKey, Signal, SignalKeys,
    SignalStore,
};
pub use core::definition::{Compensator, CronDefinition, CronIdentity};
pub use core::schedule::{Schedule, ScheduleError};
pub use core::types::{CronId, InstanceId};
pub use daemon::{
    BuildCacheGc, Crond, CrondError, CrondOptions, DryRunCleaner, ImageCleaner, LoggingTrigger,
    PipelineTrigger, TriggerRequest,
};
pub use engine::{CronEngine, EngineError, EntrySnapshot};
pub use events::{Event, EventBus, EventHandler};
pub use service::{CronService, ServiceError};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{InMemoryStorage, Storage, StorageError};

#[cfg(feature = "etcd")]
pub use coordination::EtcdCoordinator;
