//! Serialization of concurrent history moves on one workflow

use anyhow::Result;
use cim_delta::commands::ChangeWorkflowTitle;
use cim_delta::{
    DeltaEngine, EngineConfig, ErrorKind, InMemoryDeltaStore, InProcessLockManager, LockManager,
    RecordingNotifier, RecordingScheduler,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

fn engine() -> (DeltaEngine, Arc<InProcessLockManager>) {
    let locks = Arc::new(InProcessLockManager::new());
    let engine = DeltaEngine::new(
        Arc::new(InMemoryDeltaStore::new()),
        Arc::new(RecordingNotifier::new()),
        Arc::new(RecordingScheduler::new()),
    )
    .with_lock_manager(locks.clone());
    (engine, locks)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_form_a_single_chain() -> Result<()> {
    let (engine, _) = engine();
    let workflow_id = engine.create_workflow("start", false).await?.id();

    let tasks: Vec<_> = (0..16)
        .map(|n| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .create::<ChangeWorkflowTitle>(workflow_id, format!("title {n}"))
                    .await
            })
        })
        .collect();
    for created in join_all(tasks).await {
        assert!(created??.is_some());
    }

    let chain = engine.verify_chain(workflow_id).await?;
    assert_eq!(chain.len(), 16);
    assert!(chain[0].is_root());
    for pair in chain.windows(2) {
        assert_eq!(pair[1].prev_delta_id, Some(pair[0].id));
        assert!(pair[0].id < pair[1].id);
    }
    let doc = engine.load_document(workflow_id).await?;
    assert_eq!(doc.workflow.last_delta, chain.last().map(|d| d.id));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_undo_and_redo_keep_head_on_chain() -> Result<()> {
    let (engine, _) = engine();
    let workflow_id = engine.create_workflow("t0", false).await?.id();
    for n in 1..=6 {
        engine
            .create::<ChangeWorkflowTitle>(workflow_id, format!("t{n}"))
            .await?;
    }

    let tasks: Vec<_> = (0..24)
        .map(|n| {
            let engine = engine.clone();
            tokio::spawn(async move {
                if n % 3 == 0 {
                    engine.redo(workflow_id).await
                } else {
                    engine.undo(workflow_id).await
                }
            })
        })
        .collect();
    for moved in join_all(tasks).await {
        moved??;
    }

    let chain = engine.verify_chain(workflow_id).await?;
    assert_eq!(chain.len(), 6);
    let doc = engine.load_document(workflow_id).await?;
    let applied = match doc.workflow.last_delta {
        Some(head) => chain.iter().position(|d| d.id == head).map_or(0, |i| i + 1),
        None => 0,
    };
    assert_eq!(doc.workflow.name, format!("t{applied}"));
    Ok(())
}

#[tokio::test]
async fn test_held_lock_makes_commands_busy() -> Result<()> {
    let (engine, locks) = engine();
    let engine =
        engine.with_config(EngineConfig::default().with_lock_timeout(Duration::from_millis(30)));
    let workflow_id = engine.create_workflow("W", false).await?.id();

    let held = locks.acquire(workflow_id, Duration::from_secs(1)).await?;
    let err = engine
        .create::<ChangeWorkflowTitle>(workflow_id, "blocked".into())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert!(err.is_retryable());
    let err = engine.undo(workflow_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert_eq!(engine.metrics().error_count("busy").await, 2);

    drop(held);
    let delta = engine
        .create::<ChangeWorkflowTitle>(workflow_id, "unblocked".into())
        .await?;
    assert!(delta.is_some());
    assert_eq!(
        engine.load_document(workflow_id).await?.workflow.name,
        "unblocked"
    );
    Ok(())
}

#[tokio::test]
async fn test_other_workflows_are_not_blocked() -> Result<()> {
    let (engine, locks) = engine();
    let engine =
        engine.with_config(EngineConfig::default().with_lock_timeout(Duration::from_millis(30)));
    let busy = engine.create_workflow("busy", false).await?.id();
    let free = engine.create_workflow("free", false).await?.id();

    let _held = locks.acquire(busy, Duration::from_secs(1)).await?;
    let delta = engine
        .create::<ChangeWorkflowTitle>(free, "still editable".into())
        .await?;
    assert!(delta.is_some());
    Ok(())
}
