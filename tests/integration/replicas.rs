//! Multi-replica integration tests.
//!
//! These tests verify that the execution lock admits exactly one replica
//! per trigger instant.

use crate::common::{LOCK_NAMESPACE, replica, wait_for_requests};
use pipecron::coordination::InMemoryCoordinator;
use pipecron::core::definition::CronDefinition;
use pipecron::daemon::CrondOptions;
use pipecron::testing::{FailingLock, RecordingHandler, RecordingTrigger};
use pipecron::{Crond, Event, EventBus, InMemoryStorage, Storage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Test: Three replicas scheduling the same definition trigger each
/// instant once.
#[tokio::test]
async fn test_replicas_trigger_each_instant_once() {
    let storage = Arc::new(InMemoryStorage::new());
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let trigger = Arc::new(RecordingTrigger::new());

    let def = storage
        .create_cron(CronDefinition::new("dice", "every-second.yml", "* * * * * *"))
        .await
        .unwrap();

    let replicas: Vec<_> = (0..3)
        .map(|i| replica(&storage, &coordinator, &trigger, &format!("replica-{}", i)))
        .collect();
    for crond in &replicas {
        crond.reload_crond().await.unwrap();
    }

    wait_for_requests(&trigger, 3, Duration::from_secs(6)).await;
    for crond in &replicas {
        crond.shutdown().await;
    }

    let requests = trigger.requests().await;
    let mut per_instant: HashMap<_, usize> = HashMap::new();
    for request in &requests {
        assert_eq!(request.cron_id, def.id);
        *per_instant.entry(request.trigger_at).or_default() += 1;
    }
    assert!(
        per_instant.values().all(|&n| n == 1),
        "duplicate triggers: {:?}",
        per_instant
    );

    let held = coordinator.keys_with_prefix(LOCK_NAMESPACE).unwrap();
    assert!(!held.is_empty());
    assert!(held.iter().all(|k| k.contains(&def.id.entry_name())));
}

/// Test: A replica that cannot reach the lock backend never triggers.
#[tokio::test]
async fn test_unreachable_lock_backend_skips_fires() {
    let storage = Arc::new(InMemoryStorage::new());
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let trigger = Arc::new(RecordingTrigger::new());
    let events = Arc::new(EventBus::new());
    let recorder = Arc::new(RecordingHandler::new());
    events.register(recorder.clone()).await;

    storage
        .create_cron(CronDefinition::new("dice", "every-second.yml", "* * * * * *"))
        .await
        .unwrap();

    let crond = Crond::builder(storage.clone(), coordinator, trigger.clone())
        .lock(Arc::new(FailingLock))
        .events(events)
        .options(CrondOptions {
            compensator: None,
            ..CrondOptions::default()
        })
        .build();
    crond.reload_crond().await.unwrap();

    tokio::time::sleep(Duration::from_millis(2200)).await;
    crond.shutdown().await;

    assert_eq!(trigger.attempts().await, 0);
    assert!(
        recorder
            .events()
            .await
            .iter()
            .any(|e| matches!(e, Event::LockFailed { .. }))
    );
}
