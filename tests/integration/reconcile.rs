//! Reconciliation integration tests.
//!
//! These tests drive replicas through the admin service and check that
//! signals and reloads reach every engine.

use crate::common::{create_request, replica, wait_for_entry, wait_for_requests};
use pipecron::coordination::InMemoryCoordinator;
use pipecron::core::definition::CronDefinition;
use pipecron::testing::RecordingTrigger;
use pipecron::{CronService, InMemoryStorage, Storage};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

/// Test: A definition created through the service fires every second until
/// it is stopped.
#[tokio::test]
async fn test_created_definition_fires_until_stopped() {
    let storage = Arc::new(InMemoryStorage::new());
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let trigger = Arc::new(RecordingTrigger::new());
    let crond = replica(&storage, &coordinator, &trigger, "r1");
    let cancel = CancellationToken::new();
    let watcher = crond.run(cancel.clone()).await.unwrap();

    let service = CronService::new(storage.clone(), crond.clone());
    let def = service
        .create(create_request("every-second.yml", "* * * * * *"))
        .await
        .unwrap();
    wait_for_entry(&crond, &def.id.entry_name(), true, WAIT).await;

    let requests = wait_for_requests(&trigger, 2, WAIT).await;
    let instants: HashSet<_> = requests.iter().map(|r| r.trigger_at).collect();
    assert_eq!(instants.len(), requests.len());
    assert!(requests.iter().all(|r| r.cron_id == def.id));
    assert!(
        requests
            .iter()
            .all(|r| r.trigger_at.timestamp_subsec_nanos() == 0)
    );

    service.stop(def.id).await.unwrap();
    wait_for_entry(&crond, &def.id.entry_name(), false, WAIT).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let settled = trigger.requests().await.len();
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(trigger.requests().await.len(), settled);

    cancel.cancel();
    watcher.await.unwrap();
    crond.shutdown().await;
}

/// Test: An add signal published by one replica reaches its peers.
#[tokio::test]
async fn test_signals_reach_every_replica() {
    let storage = Arc::new(InMemoryStorage::new());
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let trigger = Arc::new(RecordingTrigger::new());
    let a = replica(&storage, &coordinator, &trigger, "a");
    let b = replica(&storage, &coordinator, &trigger, "b");
    let cancel = CancellationToken::new();
    let watchers = vec![
        a.run(cancel.clone()).await.unwrap(),
        b.run(cancel.clone()).await.unwrap(),
    ];

    let service = CronService::new(storage.clone(), a.clone());
    let def = service
        .create(create_request("hourly.yml", "0 0 * * * *"))
        .await
        .unwrap();
    wait_for_entry(&a, &def.id.entry_name(), true, WAIT).await;
    wait_for_entry(&b, &def.id.entry_name(), true, WAIT).await;

    service.delete(def.id).await.unwrap();
    wait_for_entry(&a, &def.id.entry_name(), false, WAIT).await;
    wait_for_entry(&b, &def.id.entry_name(), false, WAIT).await;

    cancel.cancel();
    for watcher in watchers {
        watcher.await.unwrap();
    }
    a.shutdown().await;
    b.shutdown().await;
}

/// Test: A reload request rebuilds every replica from the store, picking up
/// rows written without a signal.
#[tokio::test]
async fn test_reload_request_rebuilds_every_replica() {
    let storage = Arc::new(InMemoryStorage::new());
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let trigger = Arc::new(RecordingTrigger::new());
    let a = replica(&storage, &coordinator, &trigger, "a");
    let b = replica(&storage, &coordinator, &trigger, "b");
    let cancel = CancellationToken::new();
    let watchers = vec![
        a.run(cancel.clone()).await.unwrap(),
        b.run(cancel.clone()).await.unwrap(),
    ];

    let def = storage
        .create_cron(CronDefinition::new("dice", "quiet.yml", "0 0 * * * *"))
        .await
        .unwrap();
    assert!(
        !a.crond_snapshot()
            .await
            .unwrap()
            .iter()
            .any(|e| e.name == def.id.entry_name())
    );

    a.request_reload().await.unwrap();
    wait_for_entry(&a, &def.id.entry_name(), true, WAIT).await;
    wait_for_entry(&b, &def.id.entry_name(), true, WAIT).await;

    cancel.cancel();
    for watcher in watchers {
        watcher.await.unwrap();
    }
    a.shutdown().await;
    b.shutdown().await;
}

/// Test: Repeated reloads leave the same entry set.
#[tokio::test]
async fn test_repeated_reload_is_stable() {
    let storage = Arc::new(InMemoryStorage::new());
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let trigger = Arc::new(RecordingTrigger::new());
    let crond = replica(&storage, &coordinator, &trigger, "r1");

    for i in 0..5 {
        storage
            .create_cron(CronDefinition::new("dice", format!("{}.yml", i), "0 0 3 * * *"))
            .await
            .unwrap();
    }
    storage
        .create_cron(CronDefinition::new("dice", "off.yml", "0 0 3 * * *").with_enabled(false))
        .await
        .unwrap();

    let mut snapshots = Vec::new();
    for _ in 0..3 {
        crond.reload_crond().await.unwrap();
        let mut names: Vec<String> = crond
            .crond_snapshot()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        snapshots.push(names);
    }

    // Five definitions plus the build-cache GC entry.
    assert_eq!(snapshots[0].len(), 6);
    assert!(snapshots.windows(2).all(|w| w[0] == w[1]));
    crond.shutdown().await;
}

/// Test: Upserting the same source identity keeps one row and one entry.
#[tokio::test]
async fn test_upsert_keeps_single_entry() {
    let storage = Arc::new(InMemoryStorage::new());
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let trigger = Arc::new(RecordingTrigger::new());
    let crond = replica(&storage, &coordinator, &trigger, "r1");
    let cancel = CancellationToken::new();
    let watcher = crond.run(cancel.clone()).await.unwrap();

    let service = CronService::new(storage.clone(), crond.clone());
    let first = service
        .create(create_request("nightly.yml", "0 0 1 * * *"))
        .await
        .unwrap();
    let second = service
        .create(create_request("nightly.yml", "0 30 2 * * *"))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(storage.list_enabled_crons().await.unwrap().len(), 1);

    let name = first.id.entry_name();
    let start = tokio::time::Instant::now();
    loop {
        let entries = crond.crond_snapshot().await.unwrap();
        let matching: Vec<_> = entries.iter().filter(|e| e.name == name).collect();
        if matching.len() == 1 && matching[0].expression == "0 30 2 * * *" {
            break;
        }
        assert!(start.elapsed() < WAIT, "entry not rebuilt: {:?}", entries);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cancel.cancel();
    watcher.await.unwrap();
    crond.shutdown().await;
}
