//! Lifecycle events and event handling.
//!
//! The engine, the reconciliation daemon and the build-cache GC report what
//! they did through an [`EventBus`]. Handlers are optional; nothing depends
//! on an event being observed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::core::types::CronId;

/// Lifecycle events emitted while scheduling.
#[derive(Debug, Clone)]
pub enum Event {
    /// An engine entry reached its activation instant.
    EntryFired {
        name: String,
        trigger_at: DateTime<Utc>,
        timestamp: Instant,
    },

    /// Another replica holds the execution lock for this instant.
    LockContended {
        name: String,
        trigger_at: DateTime<Utc>,
        timestamp: Instant,
    },

    /// The coordination store could not be asked for the lock.
    LockFailed {
        name: String,
        trigger_at: DateTime<Utc>,
        error: String,
        timestamp: Instant,
    },

    /// A job panicked; the engine kept running.
    JobPanicked {
        name: String,
        trigger_at: DateTime<Utc>,
        message: String,
        timestamp: Instant,
    },

    /// A pipeline was created for a definition.
    CronTriggered {
        cron_id: CronId,
        trigger_at: DateTime<Utc>,
        compensated: bool,
        timestamp: Instant,
    },

    /// A trigger was skipped because it precedes the start boundary.
    CronSuppressed {
        cron_id: CronId,
        trigger_at: DateTime<Utc>,
        start_from: DateTime<Utc>,
        timestamp: Instant,
    },

    /// The pipeline-creation callback failed.
    CronTriggerFailed {
        cron_id: CronId,
        trigger_at: DateTime<Utc>,
        error: String,
        timestamp: Instant,
    },

    /// Images of one cluster were deleted by the build-cache GC.
    GcBatchDeleted {
        cluster: String,
        deleted: usize,
        timestamp: Instant,
    },

    /// Batch deletion for one cluster failed.
    GcBatchFailed {
        cluster: String,
        error: String,
        timestamp: Instant,
    },

    /// An image was deleted but its store record could not be removed.
    GcRecordRemoveFailed {
        cluster: String,
        name: String,
        error: String,
        timestamp: Instant,
    },

    /// The engine was rebuilt from the definition store.
    Reloaded { entries: usize, timestamp: Instant },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::EntryFired { timestamp, .. }
            | Event::LockContended { timestamp, .. }
            | Event::LockFailed { timestamp, .. }
            | Event::JobPanicked { timestamp, .. }
            | Event::CronTriggered { timestamp, .. }
            | Event::CronSuppressed { timestamp, .. }
            | Event::CronTriggerFailed { timestamp, .. }
            | Event::GcBatchDeleted { timestamp, .. }
            | Event::GcBatchFailed { timestamp, .. }
            | Event::GcRecordRemoveFailed { timestamp, .. }
            | Event::Reloaded { timestamp, .. } => *timestamp,
        }
    }

    pub fn entry_fired(name: impl Into<String>, trigger_at: DateTime<Utc>) -> Self {
        Event::EntryFired {
            name: name.into(),
            trigger_at,
            timestamp: Instant::now(),
        }
    }

    pub fn lock_contended(name: impl Into<String>, trigger_at: DateTime<Utc>) -> Self {
        Event::LockContended {
            name: name.into(),
            trigger_at,
            timestamp: Instant::now(),
        }
    }

    pub fn lock_failed(
        name: impl Into<String>,
        trigger_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Event::LockFailed {
            name: name.into(),
            trigger_at,
            error: error.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn job_panicked(
        name: impl Into<String>,
        trigger_at: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        Event::JobPanicked {
            name: name.into(),
            trigger_at,
            message: message.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn cron_triggered(cron_id: CronId, trigger_at: DateTime<Utc>, compensated: bool) -> Self {
        Event::CronTriggered {
            cron_id,
            trigger_at,
            compensated,
            timestamp: Instant::now(),
        }
    }

    pub fn cron_suppressed(
        cron_id: CronId,
        trigger_at: DateTime<Utc>,
        start_from: DateTime<Utc>,
    ) -> Self {
        Event::CronSuppressed {
            cron_id,
            trigger_at,
            start_from,
            timestamp: Instant::now(),
        }
    }

    pub fn cron_trigger_failed(
        cron_id: CronId,
        trigger_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Event::CronTriggerFailed {
            cron_id,
            trigger_at,
            error: error.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn gc_batch_deleted(cluster: impl Into<String>, deleted: usize) -> Self {
        Event::GcBatchDeleted {
            cluster: cluster.into(),
            deleted,
            timestamp: Instant::now(),
        }
    }

    pub fn gc_batch_failed(cluster: impl Into<String>, error: impl Into<String>) -> Self {
        Event::GcBatchFailed {
            cluster: cluster.into(),
            error: error.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn gc_record_remove_failed(
        cluster: impl Into<String>,
        name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Event::GcRecordRemoveFailed {
            cluster: cluster.into(),
            name: name.into(),
            error: error.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn reloaded(entries: usize) -> Self {
        Event::Reloaded {
            entries,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Emit an event to all registered handlers, in registration order.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingHandler;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        count: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Event) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_emit_reaches_every_handler() {
        let bus = EventBus::new();
        let recorder = Arc::new(RecordingHandler::new());
        let counter = Arc::new(CountingHandler {
            count: AtomicU32::new(0),
        });
        bus.register(recorder.clone()).await;
        bus.register(counter.clone()).await;
        assert_eq!(bus.handler_count().await, 2);

        bus.emit(Event::gc_batch_deleted("cluster-a", 3)).await;
        bus.emit(Event::reloaded(4)).await;

        assert_eq!(counter.count.load(Ordering::SeqCst), 2);
        let events = recorder.events().await;
        assert!(matches!(
            &events[0],
            Event::GcBatchDeleted { cluster, deleted: 3, .. } if cluster == "cluster-a"
        ));
        assert!(matches!(events[1], Event::Reloaded { entries: 4, .. }));
    }

    #[tokio::test]
    async fn test_emit_without_handlers_is_noop() {
        let bus = EventBus::default();
        bus.emit(Event::lock_contended("cron-1", Utc::now())).await;
        assert_eq!(bus.handler_count().await, 0);
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let first = Event::entry_fired("a", Utc::now());
        let second = Event::cron_trigger_failed(CronId::new(1), Utc::now(), "boom");
        assert!(second.timestamp() >= first.timestamp());
    }
}
