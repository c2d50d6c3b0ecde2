//! Build-cache GC integration tests.
//!
//! These tests run GC rounds against each store backend.

use chrono::{Duration as ChronoDuration, Utc};
use pipecron::daemon::BuildCacheGc;
use pipecron::storage::BuildCacheRecord;
use pipecron::testing::{FakeImageCleaner, FlakyStorage};
use pipecron::{InMemoryStorage, Storage};
use std::sync::Arc;
use std::time::Duration;

const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

async fn seed_clusters<S: Storage>(storage: &S) {
    let old = Utc::now() - ChronoDuration::days(10);
    for (cluster, name) in [
        ("east", "east-1"),
        ("east", "east-2"),
        ("west", "west-1"),
        ("north", "north-1"),
    ] {
        storage
            .save_build_cache(BuildCacheRecord::new(cluster, name).with_last_pull_at(old))
            .await
            .unwrap();
    }
    storage
        .save_build_cache(BuildCacheRecord::new("east", "east-fresh").with_last_pull_at(Utc::now()))
        .await
        .unwrap();
}

async fn remaining_names<S: Storage>(storage: &S) -> Vec<String> {
    let mut names: Vec<String> = storage
        .list_expired_build_caches(Utc::now() + ChronoDuration::days(365))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    names.sort();
    names
}

/// Test: A failing cluster and an undeletable record each only affect
/// themselves.
#[tokio::test]
async fn test_failures_are_isolated_per_cluster_and_record() {
    let inner = Arc::new(InMemoryStorage::new());
    seed_clusters(inner.as_ref()).await;
    let storage = Arc::new(FlakyStorage::new(inner.clone()).undeletable("east-2"));
    let cleaner = Arc::new(FakeImageCleaner::new().failing_cluster("west"));

    let gc = BuildCacheGc::new(storage, cleaner.clone(), WEEK);
    let report = gc.run_once().await.unwrap();

    assert_eq!(report.clusters.len(), 3);
    assert_eq!(report.removed(), 2);
    let west = report.clusters.iter().find(|c| c.cluster == "west").unwrap();
    assert!(west.error.is_some());
    let east = report.clusters.iter().find(|c| c.cluster == "east").unwrap();
    assert_eq!(east.record_failures, vec!["east-2".to_string()]);

    assert_eq!(
        remaining_names(inner.as_ref()).await,
        vec!["east-2", "east-fresh", "west-1"]
    );

    // The next round retries what is left.
    let report = gc.run_once().await.unwrap();
    assert_eq!(report.removed(), 0);
    assert_eq!(cleaner.calls().await.len(), 5);
}

/// Test: A GC round against the SQLite store removes expired records only.
#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_gc_against_sqlite() {
    let storage = Arc::new(pipecron::SqliteStorage::in_memory().await.unwrap());
    seed_clusters(storage.as_ref()).await;

    let gc = BuildCacheGc::new(storage.clone(), Arc::new(FakeImageCleaner::new()), WEEK);
    let report = gc.run_once().await.unwrap();

    assert_eq!(report.removed(), 4);
    assert_eq!(remaining_names(storage.as_ref()).await, vec!["east-fresh"]);
    storage.close().await;
}
