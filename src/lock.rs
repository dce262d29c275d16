// Copyright 2025 Cowboy AI, LLC.

//! Per-workflow mutual exclusion
//!
//! Every history mutation runs while holding its workflow's lock. Locks on
//! different workflows never contend. A lock is released when its
//! [`WorkflowLock`] guard drops, including when the holding task panics or
//! is cancelled.

use crate::errors::{DeltaError, DeltaResult};
use crate::identifiers::WorkflowId;
use crate::store::StoreError;
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

/// Grants exclusive access to one workflow at a time
#[async_trait]
pub trait LockManager: Send + Sync + fmt::Debug {
    /// Wait up to `timeout` for the workflow's lock
    ///
    /// Fails with [`DeltaError::Busy`] when the lock is still held after
    /// `timeout`.
    async fn acquire(&self, workflow_id: WorkflowId, timeout: Duration)
        -> DeltaResult<WorkflowLock>;
}

/// Proof of holding a workflow's lock; dropping it releases the lock
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct WorkflowLock {
    workflow_id: WorkflowId,
    waited: Duration,
    guard: Guard,
}

/// Backend handle; releases the lock when dropped
enum Guard {
    Local { _guard: OwnedMutexGuard<()> },
    Kv(KvLease),
}

impl WorkflowLock {
    /// Workflow this lock covers
    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    /// Time spent waiting before the lock was granted
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Confirm the lock is still ours
    ///
    /// In-process locks cannot be lost. A KV lease can expire and be taken
    /// by another process; then this fails with [`DeltaError::LockLost`].
    pub async fn ensure_held(&self) -> DeltaResult<()> {
        match &self.guard {
            Guard::Local { .. } => Ok(()),
            Guard::Kv(lease) => lease.ensure_held(self.workflow_id).await,
        }
    }
}

impl fmt::Debug for WorkflowLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backend = match self.guard {
            Guard::Local { .. } => "local",
            Guard::Kv(_) => "nats-kv",
        };
        f.debug_struct("WorkflowLock")
            .field("workflow_id", &self.workflow_id)
            .field("waited", &self.waited)
            .field("backend", &backend)
            .finish()
    }
}

fn busy(workflow_id: WorkflowId, waited: Duration) -> DeltaError {
    DeltaError::Busy {
        workflow_id,
        waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
    }
}

/// Locks held in this process
///
/// Waiters are served in arrival order. Suitable when a single process owns
/// all writes to the store.
#[derive(Debug, Clone, Default)]
pub struct InProcessLockManager {
    locks: Arc<Mutex<HashMap<WorkflowId, Arc<Mutex<()>>>>>,
}

impl InProcessLockManager {
    /// Create a manager with no locks
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workflows with a lock entry
    pub async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Forget locks nobody holds or waits for
    pub async fn prune(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    async fn entry(&self, workflow_id: WorkflowId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.retain(|id, lock| *id == workflow_id || Arc::strong_count(lock) > 1);
        locks.entry(workflow_id).or_default().clone()
    }
}

#[async_trait]
impl LockManager for InProcessLockManager {
    async fn acquire(
        &self,
        workflow_id: WorkflowId,
        timeout: Duration,
    ) -> DeltaResult<WorkflowLock> {
        let started = Instant::now();
        let lock = self.entry(workflow_id).await;

        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(WorkflowLock {
                workflow_id,
                waited: started.elapsed(),
                guard: Guard::Local { _guard: guard },
            }),
            Err(_) => {
                debug!(workflow_id = %workflow_id, "Workflow lock wait timed out");
                Err(busy(workflow_id, started.elapsed()))
            }
        }
    }
}

/// Configuration for [`NatsKvLockManager`]
#[derive(Debug, Clone)]
pub struct KvLockConfig {
    /// Bucket holding one key per locked workflow
    pub bucket: String,
    /// Age after which an abandoned lock expires; held locks are renewed
    /// every third of it
    pub ttl: Duration,
    /// Delay between attempts while the lock is held elsewhere
    pub poll_interval: Duration,
}

impl Default for KvLockConfig {
    fn default() -> Self {
        Self {
            bucket: "workflow-locks".to_string(),
            ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(25),
        }
    }
}

impl KvLockConfig {
    /// How often a held lock is renewed
    pub fn refresh_interval(&self) -> Duration {
        self.ttl / 3
    }
}

/// Revision of a lease key, shared with the task renewing it
#[derive(Debug)]
struct LeaseState {
    revision: AtomicU64,
    lost: AtomicBool,
}

/// A held key in the lock bucket
///
/// Dropping the lease closes `release`, which makes its keeper task delete
/// the key at the last revision it wrote.
struct KvLease {
    store: kv::Store,
    key: String,
    owner: Bytes,
    state: Arc<LeaseState>,
    _release: oneshot::Sender<()>,
}

impl KvLease {
    async fn ensure_held(&self, workflow_id: WorkflowId) -> DeltaResult<()> {
        if self.state.lost.load(Ordering::SeqCst) {
            return Err(DeltaError::LockLost { workflow_id });
        }
        let entry = self
            .store
            .entry(self.key.as_str())
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to read workflow lock: {}", e)))?;
        let ours = entry.is_some_and(|entry| {
            matches!(entry.operation, kv::Operation::Put) && entry.value == self.owner
        });
        if ours {
            return Ok(());
        }
        self.state.lost.store(true, Ordering::SeqCst);
        warn!(workflow_id = %workflow_id, key = %self.key, "Workflow lock was taken over");
        Err(DeltaError::LockLost { workflow_id })
    }
}

/// Renew a lease until it is released, then delete it
///
/// Every write is conditional on the revision this task wrote last, so a
/// lease that expired and was re-acquired elsewhere is never renewed or
/// deleted here.
async fn keep_lease(
    store: kv::Store,
    key: String,
    owner: Bytes,
    state: Arc<LeaseState>,
    mut release: oneshot::Receiver<()>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut release => break,
            _ = ticker.tick() => {
                let revision = state.revision.load(Ordering::SeqCst);
                match store.update(key.as_str(), owner.clone(), revision).await {
                    Ok(next) => state.revision.store(next, Ordering::SeqCst),
                    Err(e) => {
                        state.lost.store(true, Ordering::SeqCst);
                        warn!(key = %key, revision, error = %e, "Failed to renew workflow lock");
                        return;
                    }
                }
            }
        }
    }

    if state.lost.load(Ordering::SeqCst) {
        return;
    }
    let revision = state.revision.load(Ordering::SeqCst);
    match store.delete_expect_revision(key.as_str(), Some(revision)).await {
        Ok(()) => debug!(key = %key, revision, "Released workflow lock"),
        Err(e) => warn!(
            key = %key,
            revision,
            error = %e,
            "Workflow lock not released; it was taken over or expires with the bucket TTL"
        ),
    }
}

/// Locks shared between processes through a JetStream key-value bucket
///
/// A lock is a key created only if absent, holding a random owner token.
/// The holder renews it while held and deletes it on release, both
/// conditional on the key's revision. Holders that die without releasing
/// leave a key that expires after the bucket's max age.
#[derive(Clone)]
pub struct NatsKvLockManager {
    store: kv::Store,
    config: KvLockConfig,
}

impl NatsKvLockManager {
    /// Create the lock bucket if needed and connect to it
    pub async fn new(client: async_nats::Client, config: KvLockConfig) -> DeltaResult<Self> {
        let js = jetstream::new(client);
        let store = js
            .create_key_value(kv::Config {
                bucket: config.bucket.clone(),
                description: "Workflow history locks".to_string(),
                history: 1,
                max_age: config.ttl,
                storage: jetstream::stream::StorageType::Memory,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                StoreError::Backend(format!("Failed to create lock bucket: {}", e))
            })?;

        Ok(Self { store, config })
    }

    /// Bucket key guarding a workflow
    pub fn key(workflow_id: WorkflowId) -> String {
        format!("workflow.{}", workflow_id)
    }

    fn lease(&self, key: String, owner: Bytes, revision: u64) -> KvLease {
        let state = Arc::new(LeaseState {
            revision: AtomicU64::new(revision),
            lost: AtomicBool::new(false),
        });
        let (release, released) = oneshot::channel();
        tokio::spawn(keep_lease(
            self.store.clone(),
            key.clone(),
            owner.clone(),
            state.clone(),
            released,
            self.config.refresh_interval(),
        ));
        KvLease {
            store: self.store.clone(),
            key,
            owner,
            state,
            _release: release,
        }
    }
}

impl fmt::Debug for NatsKvLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsKvLockManager")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl LockManager for NatsKvLockManager {
    async fn acquire(
        &self,
        workflow_id: WorkflowId,
        timeout: Duration,
    ) -> DeltaResult<WorkflowLock> {
        let started = Instant::now();
        let key = Self::key(workflow_id);
        let owner = Bytes::from(Uuid::new_v4().to_string());

        loop {
            match self.store.create(key.as_str(), owner.clone()).await {
                Ok(revision) => {
                    return Ok(WorkflowLock {
                        workflow_id,
                        waited: started.elapsed(),
                        guard: Guard::Kv(self.lease(key, owner, revision)),
                    })
                }
                Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(StoreError::Backend(format!(
                        "Failed to acquire workflow lock: {}",
                        e
                    ))
                    .into())
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                debug!(workflow_id = %workflow_id, "Workflow lock wait timed out");
                return Err(busy(workflow_id, elapsed));
            }
            tokio::time::sleep(self.config.poll_interval.min(timeout - elapsed)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_second_acquire_times_out_as_busy() {
        let manager = InProcessLockManager::new();
        let id = WorkflowId::new();

        let held = manager.acquire(id, WAIT).await.unwrap();
        let err = manager
            .acquire(id, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(err.is_retryable());
        drop(held);

        assert!(manager.acquire(id, Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn test_local_lock_is_always_held() {
        let manager = InProcessLockManager::new();
        let lock = manager.acquire(WorkflowId::new(), WAIT).await.unwrap();
        assert!(lock.ensure_held().await.is_ok());
        assert!(format!("{:?}", lock).contains("local"));
    }

    #[tokio::test]
    async fn test_different_workflows_do_not_contend() {
        let manager = InProcessLockManager::new();
        let _a = manager.acquire(WorkflowId::new(), WAIT).await.unwrap();
        let b = manager
            .acquire(WorkflowId::new(), Duration::from_millis(20))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_aborted_holder_releases_lock() {
        let manager = InProcessLockManager::new();
        let id = WorkflowId::new();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let holder = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let _lock = manager.acquire(id, WAIT).await.unwrap();
                let _ = tx.send(());
                std::future::pending::<()>().await;
            })
        };
        rx.await.unwrap();
        holder.abort();
        let _ = holder.await;

        let lock = manager.acquire(id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(lock.workflow_id(), id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_critical_sections_never_overlap() {
        let manager = InProcessLockManager::new();
        let id = WorkflowId::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                tokio::spawn(async move {
                    let _lock = manager.acquire(id, WAIT).await.unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_arrival_order() {
        let manager = InProcessLockManager::new();
        let id = WorkflowId::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = manager.acquire(id, WAIT).await.unwrap();
        let mut tasks = Vec::new();
        for n in 0..3 {
            let manager = manager.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _lock = manager.acquire(id, WAIT).await.unwrap();
                order.lock().await.push(n);
            }));
            // let each waiter enqueue before the next arrives
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(first);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_prune_forgets_idle_locks() {
        let manager = InProcessLockManager::new();
        let held = manager.acquire(WorkflowId::new(), WAIT).await.unwrap();
        drop(manager.acquire(WorkflowId::new(), WAIT).await.unwrap());
        assert_eq!(manager.tracked().await, 2);

        manager.prune().await;
        assert_eq!(manager.tracked().await, 1);
        drop(held);
        manager.prune().await;
        assert_eq!(manager.tracked().await, 0);
    }

    #[test]
    fn test_kv_lock_defaults() {
        let config = KvLockConfig::default();
        assert_eq!(config.bucket, "workflow-locks");
        assert!(config.poll_interval < config.ttl);
        assert_eq!(config.refresh_interval(), Duration::from_secs(10));
        assert_eq!(
            NatsKvLockManager::key(WorkflowId::new()).split('.').count(),
            2
        );
    }
}
