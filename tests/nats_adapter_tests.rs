//! Integration tests for the NATS lock manager and outbound ports
//!
//! These tests require a running NATS server with JetStream enabled.
//! Run with: `nats-server -js`

use async_nats::jetstream;
use cim_delta::commands::ChangeWorkflowTitle;
use cim_delta::lock::KvLockConfig;
use cim_delta::{
    DeltaEngine, DeltaId, ErrorKind, InMemoryDeltaStore, LockManager, NatsKvLockManager,
    NatsNotifier, NatsRecomputeScheduler, RecomputeScheduler, RecordingNotifier,
    RecordingScheduler, WorkflowId,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const NATS_URL: &str = "nats://localhost:4222";
const WAIT: Duration = Duration::from_secs(5);

/// Helper to check if NATS is available
async fn nats_available() -> bool {
    async_nats::connect(NATS_URL).await.is_ok()
}

async fn client() -> async_nats::Client {
    async_nats::connect(NATS_URL).await.unwrap()
}

fn unique(test_name: &str) -> String {
    format!("{}-{}", test_name, Uuid::new_v4().simple())
}

/// Lock manager over a bucket no other test uses, plus that bucket
async fn lock_manager(
    client: &async_nats::Client,
    test_name: &str,
    ttl: Duration,
) -> (NatsKvLockManager, jetstream::kv::Store) {
    let config = KvLockConfig {
        bucket: unique(test_name),
        ttl,
        poll_interval: Duration::from_millis(10),
    };
    let bucket = config.bucket.clone();
    let manager = NatsKvLockManager::new(client.clone(), config).await.unwrap();
    let store = jetstream::new(client.clone())
        .get_key_value(bucket)
        .await
        .unwrap();
    (manager, store)
}

#[tokio::test]
async fn test_kv_lock_is_busy_while_held() {
    if !nats_available().await {
        eprintln!("Skipping test: NATS server not available");
        return;
    }

    let client = client().await;
    let (locks, _) = lock_manager(&client, "busy", Duration::from_secs(30)).await;
    let workflow_id = WorkflowId::new();

    let held = locks.acquire(workflow_id, WAIT).await.unwrap();
    let err = locks
        .acquire(workflow_id, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert!(err.is_retryable());
    assert!(held.ensure_held().await.is_ok());

    let other = locks
        .acquire(WorkflowId::new(), Duration::from_millis(100))
        .await;
    assert!(other.is_ok());
}

#[tokio::test]
async fn test_kv_lock_can_be_reacquired_after_drop() {
    if !nats_available().await {
        eprintln!("Skipping test: NATS server not available");
        return;
    }

    let client = client().await;
    let (locks, _) = lock_manager(&client, "reacquire", Duration::from_secs(30)).await;
    let workflow_id = WorkflowId::new();

    let first = locks.acquire(workflow_id, WAIT).await.unwrap();
    drop(first);

    // Release happens on the lease task, so give it a moment
    let second = locks
        .acquire(workflow_id, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(second.ensure_held().await.is_ok());
}

#[tokio::test]
async fn test_held_kv_lock_outlives_its_ttl() {
    if !nats_available().await {
        eprintln!("Skipping test: NATS server not available");
        return;
    }

    let client = client().await;
    let (locks, _) = lock_manager(&client, "renew", Duration::from_secs(1)).await;
    let workflow_id = WorkflowId::new();

    let held = locks.acquire(workflow_id, WAIT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert!(held.ensure_held().await.is_ok());
    let err = locks
        .acquire(workflow_id, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
}

#[tokio::test]
async fn test_expired_holder_does_not_release_newer_lock() {
    if !nats_available().await {
        eprintln!("Skipping test: NATS server not available");
        return;
    }

    let client = client().await;
    let (locks, bucket) = lock_manager(&client, "stale", Duration::from_secs(30)).await;
    let workflow_id = WorkflowId::new();
    let key = NatsKvLockManager::key(workflow_id);

    let stale = locks.acquire(workflow_id, WAIT).await.unwrap();
    // The key vanishing is what an expiry looks like to the next holder
    bucket.purge(key.as_str()).await.unwrap();
    let current = locks.acquire(workflow_id, WAIT).await.unwrap();
    let owner = bucket.get(key.as_str()).await.unwrap().unwrap();

    drop(stale);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(bucket.get(key.as_str()).await.unwrap(), Some(owner));
    assert!(current.ensure_held().await.is_ok());
    let err = locks
        .acquire(workflow_id, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
}

#[tokio::test]
async fn test_lost_kv_lock_is_detected_before_commit() {
    if !nats_available().await {
        eprintln!("Skipping test: NATS server not available");
        return;
    }

    let client = client().await;
    let (locks, bucket) = lock_manager(&client, "lost", Duration::from_secs(30)).await;
    let workflow_id = WorkflowId::new();

    let lock = locks.acquire(workflow_id, WAIT).await.unwrap();
    bucket
        .purge(NatsKvLockManager::key(workflow_id).as_str())
        .await
        .unwrap();

    let err = lock.ensure_held().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert!(err.is_retryable());
    // Once lost, always lost, even after the key reappears
    let _current = locks.acquire(workflow_id, WAIT).await.unwrap();
    assert!(lock.ensure_held().await.is_err());
}

#[tokio::test]
async fn test_engine_runs_on_kv_locks() {
    if !nats_available().await {
        eprintln!("Skipping test: NATS server not available");
        return;
    }

    let client = client().await;
    let (locks, _) = lock_manager(&client, "engine", Duration::from_secs(30)).await;
    let engine = DeltaEngine::new(
        Arc::new(InMemoryDeltaStore::new()),
        Arc::new(RecordingNotifier::new()),
        Arc::new(RecordingScheduler::new()),
    )
    .with_lock_manager(Arc::new(locks));
    let workflow_id = engine.create_workflow("before", false).await.unwrap().id();

    for name in ["one", "two", "three"] {
        engine
            .create::<ChangeWorkflowTitle>(workflow_id, name.to_string())
            .await
            .unwrap()
            .unwrap();
    }
    engine.undo(workflow_id).await.unwrap().unwrap();

    let doc = engine.load_document(workflow_id).await.unwrap();
    assert_eq!(doc.workflow.name, "two");
    assert_eq!(engine.verify_chain(workflow_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_notifier_publishes_camel_case_json_per_workflow() {
    if !nats_available().await {
        eprintln!("Skipping test: NATS server not available");
        return;
    }

    let client = client().await;
    let prefix = format!("test.delta.{}", Uuid::new_v4().simple());
    let notifier = NatsNotifier::new(client.clone(), prefix.clone());
    let engine = DeltaEngine::new(
        Arc::new(InMemoryDeltaStore::new()),
        Arc::new(notifier.clone()),
        Arc::new(RecordingScheduler::new()),
    );
    let workflow_id = engine.create_workflow("before", true).await.unwrap().id();

    let mut messages = client.subscribe(notifier.subject(workflow_id)).await.unwrap();
    client.flush().await.unwrap();
    engine
        .create::<ChangeWorkflowTitle>(workflow_id, "after".to_string())
        .await
        .unwrap()
        .unwrap();

    let message = tokio::time::timeout(WAIT, messages.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.subject.to_string(), format!("{prefix}.{workflow_id}"));

    let body: Value = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(body["updateWorkflow"]["name"], "after");
    assert_eq!(body["updateWorkflow"]["public"], true);
    assert!(body["updateWorkflow"].get("lastUpdate").is_some());
    assert!(body.get("update_workflow").is_none());
}

#[tokio::test]
async fn test_recompute_request_is_acknowledged_by_stream() {
    if !nats_available().await {
        eprintln!("Skipping test: NATS server not available");
        return;
    }

    let client = client().await;
    let js = jetstream::new(client.clone());
    let name = unique("TEST-RECOMPUTE").to_uppercase();
    let subject = format!("test.recompute.{}", Uuid::new_v4().simple());
    let stream = js
        .create_stream(jetstream::stream::Config {
            name: name.clone(),
            subjects: vec![subject.clone()],
            storage: jetstream::stream::StorageType::Memory,
            ..Default::default()
        })
        .await
        .unwrap();

    let scheduler = NatsRecomputeScheduler::new(client.clone(), subject.clone());
    let workflow_id = WorkflowId::new();
    scheduler
        .schedule_recompute(workflow_id, DeltaId::new(42))
        .await
        .unwrap();

    let message = stream
        .get_last_raw_message_by_subject(&subject)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(
        body,
        json!({"workflow_id": workflow_id.to_string(), "delta_id": 42})
    );

    js.delete_stream(&name).await.unwrap();
}

#[tokio::test]
async fn test_recompute_without_stream_is_an_error() {
    if !nats_available().await {
        eprintln!("Skipping test: NATS server not available");
        return;
    }

    let client = client().await;
    let subject = format!("test.unrouted.{}", Uuid::new_v4().simple());
    let scheduler = NatsRecomputeScheduler::new(client, subject);

    let result = scheduler
        .schedule_recompute(WorkflowId::new(), DeltaId::new(1))
        .await;
    assert!(result.is_err());
}
