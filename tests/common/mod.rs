//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use pipecron::coordination::InMemoryCoordinator;
use pipecron::daemon::{CrondOptions, TriggerRequest};
use pipecron::service::CreateCronRequest;
use pipecron::testing::RecordingTrigger;
use pipecron::{Crond, InMemoryStorage, InstanceId};
use std::sync::Arc;
use std::time::Duration;

pub const LOCK_NAMESPACE: &str = "/test/dlock";

pub const PIPELINE_YML: &str = "version: 1.1\nstages: []\n";

/// Definition request with the fields every create needs.
pub fn create_request(yml_name: &str, expr: &str) -> CreateCronRequest {
    CreateCronRequest {
        pipeline_source: "dice".to_string(),
        pipeline_yml_name: yml_name.to_string(),
        pipeline_yml: PIPELINE_YML.to_string(),
        cron_expr: expr.to_string(),
        ..CreateCronRequest::default()
    }
}

/// A replica sharing `storage`, `coordinator` and `trigger` with its peers.
///
/// Interrupt compensation is off so only regular fires reach the trigger.
pub fn replica(
    storage: &Arc<InMemoryStorage>,
    coordinator: &Arc<InMemoryCoordinator>,
    trigger: &Arc<RecordingTrigger>,
    instance: &str,
) -> Crond<InMemoryStorage> {
    let lock = coordinator.lock(LOCK_NAMESPACE, InstanceId::new(instance));
    Crond::builder(storage.clone(), coordinator.clone(), trigger.clone())
        .lock(Arc::new(lock))
        .options(CrondOptions {
            compensator: None,
            ..CrondOptions::default()
        })
        .build()
}

/// Wait until the trigger has accepted at least `count` requests.
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_requests(
    trigger: &RecordingTrigger,
    count: usize,
    timeout: Duration,
) -> Vec<TriggerRequest> {
    let start = tokio::time::Instant::now();
    loop {
        let requests = trigger.requests().await;
        if requests.len() >= count {
            return requests;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for {} trigger requests, got {}",
                count,
                requests.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until the replica's engine does (or does not) hold entry `name`.
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_entry(
    crond: &Crond<InMemoryStorage>,
    name: &str,
    present: bool,
    timeout: Duration,
) {
    let start = tokio::time::Instant::now();
    loop {
        let entries = crond.crond_snapshot().await.unwrap();
        if entries.iter().any(|e| e.name == name) == present {
            return;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for entry '{}' to be {}",
                name,
                if present { "added" } else { "removed" }
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
