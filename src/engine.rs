// Copyright 2025 Cowboy AI, LLC.

//! The command lifecycle: create, redo and undo under the workflow lock
//!
//! Every history move follows the same sequence:
//!
//! 1. acquire the workflow's lock
//! 2. load the document and check the head
//! 3. apply the delta to a staged copy of the document
//! 4. confirm the lock is still held, then commit document, head and delta
//!    in one store write
//! 5. release the lock
//! 6. notify clients, then schedule a recompute if a live step was invalidated
//!
//! A failure in steps 1-4 leaves storage as it was. Steps 5-6 cannot fail the
//! move: it is already durable.

use crate::chain::HistoryChain;
use crate::commands::{ApplyContext, ApplyOutcome, Command, CommandHandler, CommandRegistry};
use crate::config::EngineConfig;
use crate::delta::{Delta, HistoryEntry};
use crate::document::WorkflowDocument;
use crate::errors::{DeltaError, DeltaResult, ErrorKind};
use crate::identifiers::{DeltaId, WorkflowId};
use crate::lock::{InProcessLockManager, LockManager, WorkflowLock};
use crate::metrics::{names, EngineMetrics};
use crate::notify::DeltaNotification;
use crate::sinks::{NotificationSink, RecomputeScheduler};
use crate::store::{DeltaStore, HistoryCommit, NewDelta, PayloadUpdate};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Direction of a replayed delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn apply(
        self,
        handler: &dyn CommandHandler,
        delta: &mut Delta,
        doc: &mut WorkflowDocument,
    ) -> DeltaResult<ApplyOutcome> {
        let ctx = ApplyContext {
            workflow_id: delta.workflow_id,
            delta_id: delta.id,
        };
        let result = match self {
            Direction::Forward => handler.forward(&mut delta.payload, doc, &ctx),
            Direction::Backward => handler.backward(&mut delta.payload, doc, &ctx),
        };
        result.map_err(|e| DeltaError::ApplyFailed {
            delta_id: delta.id,
            kind: delta.kind.clone(),
            reason: e.to_string(),
        })
    }
}

/// A committed move waiting to be announced
struct Committed {
    document: WorkflowDocument,
    head: Option<Delta>,
    outcome: ApplyOutcome,
}

/// Creates, replays and reverts deltas
///
/// Cheap to clone; clones share the store, locks, sinks and metrics.
#[derive(Debug, Clone)]
pub struct DeltaEngine {
    store: Arc<dyn DeltaStore>,
    registry: Arc<CommandRegistry>,
    locks: Arc<dyn LockManager>,
    notifier: Arc<dyn NotificationSink>,
    scheduler: Arc<dyn RecomputeScheduler>,
    config: EngineConfig,
    metrics: EngineMetrics,
}

impl DeltaEngine {
    /// An engine with the built-in command kinds and in-process locks
    pub fn new(
        store: Arc<dyn DeltaStore>,
        notifier: Arc<dyn NotificationSink>,
        scheduler: Arc<dyn RecomputeScheduler>,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(CommandRegistry::with_builtin()),
            locks: Arc::new(InProcessLockManager::new()),
            notifier,
            scheduler,
            config: EngineConfig::default(),
            metrics: EngineMetrics::new(),
        }
    }

    /// Use a different lock manager
    pub fn with_lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = locks;
        self
    }

    /// Use a different command registry
    pub fn with_registry(mut self, registry: CommandRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Use different settings
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Record into an existing metrics collector
    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// The backing store
    pub fn store(&self) -> &Arc<dyn DeltaStore> {
        &self.store
    }

    /// The command registry
    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Active settings
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Collected metrics
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    fn chain(&self) -> HistoryChain<'_> {
        HistoryChain::new(self.store.as_ref(), &self.registry)
    }

    /// Create an empty workflow with a single tab
    pub async fn create_workflow(
        &self,
        name: impl Into<String>,
        public: bool,
    ) -> DeltaResult<WorkflowDocument> {
        let document = WorkflowDocument::new(name, public);
        self.store.insert_document(document.clone()).await?;
        info!(workflow_id = %document.id(), "Created workflow");
        Ok(document)
    }

    /// Current committed state of a workflow
    pub async fn load_document(&self, workflow_id: WorkflowId) -> DeltaResult<WorkflowDocument> {
        Ok(self.store.load_document(workflow_id).await?)
    }

    /// Run a command of kind `C` against a workflow
    ///
    /// Returns `Ok(None)` when `C::amend` decides the command changes
    /// nothing: no delta is recorded, no notification sent, nothing
    /// scheduled. Otherwise any redo branch is discarded, the new delta
    /// becomes the head, and the delta is returned with its payload as
    /// stored.
    pub async fn create<C: Command>(
        &self,
        workflow_id: WorkflowId,
        args: C::Args,
    ) -> DeltaResult<Option<Delta>> {
        let result = self.create_locked::<C>(workflow_id, args).await;
        self.tally(result).await
    }

    async fn create_locked<C: Command>(
        &self,
        workflow_id: WorkflowId,
        args: C::Args,
    ) -> DeltaResult<Option<Delta>> {
        let handler = self.registry.handler(C::KIND)?;
        let lock = self.lock(workflow_id).await?;
        let mut document = self.store.load_document(workflow_id).await?;

        let Some(payload) = C::amend(args, &document)? else {
            debug!(workflow_id = %workflow_id, kind = C::KIND, "Command changes nothing");
            self.metrics.increment(names::ABORT).await;
            return Ok(None);
        };

        let timer = self.metrics.timer(names::APPLY);
        let chain = self.chain();
        let head = document.workflow.last_delta;
        let mut truncate = match chain.successor(workflow_id, head).await? {
            Some(orphan) => Some(chain.truncation_from(&orphan).await?),
            None => None,
        };

        let mut delta = Delta {
            id: self.store.allocate_delta_id().await?,
            workflow_id,
            prev_delta_id: head,
            datetime: Utc::now(),
            kind: C::KIND.to_string(),
            payload: serde_json::to_value(&payload)?,
        };
        let outcome = Direction::Forward.apply(handler.as_ref(), &mut delta, &mut document)?;
        document.workflow.last_delta = Some(delta.id);
        if let Some(truncation) = truncate.as_mut() {
            truncation
                .keep
                .extend(handler.referenced_children(&delta.payload)?);
        }

        lock.ensure_held().await?;
        let receipt = self
            .store
            .commit(HistoryCommit {
                document: document.clone(),
                truncate,
                new_delta: Some(NewDelta {
                    delta: delta.clone(),
                    payload_table: handler.payload_table(),
                }),
                payload_update: None,
            })
            .await?;
        timer.record().await;
        drop(lock);

        info!(
            workflow_id = %workflow_id,
            delta_id = %delta.id,
            kind = %delta.kind,
            discarded = receipt.deltas_deleted,
            "Created delta"
        );
        if !receipt.orphans.is_empty() {
            debug!(
                workflow_id = %workflow_id,
                tabs = receipt.orphans.tabs.len(),
                steps = receipt.orphans.steps.len(),
                "Collected orphaned children"
            );
        }
        self.metrics.increment(names::CREATE).await;
        self.metrics
            .add(names::TRUNCATED, receipt.deltas_deleted as u64)
            .await;

        self.announce(Committed {
            document,
            head: Some(delta.clone()),
            outcome,
        })
        .await;
        Ok(Some(delta))
    }

    /// Re-apply `delta`, which must directly follow the current head
    ///
    /// Fails with a conflict if the head has moved.
    pub async fn forward(&self, delta: &Delta) -> DeltaResult<Delta> {
        let result: DeltaResult<Delta> = async {
            let lock = self.lock(delta.workflow_id).await?;
            let document = self.store.load_document(delta.workflow_id).await?;
            let head = document.workflow.last_delta;
            if head != delta.prev_delta_id {
                return Err(DeltaError::HeadConflict {
                    expected: delta.prev_delta_id,
                    actual: head,
                });
            }
            let stored = self.load_delta_of(delta.workflow_id, delta.id).await?;
            self.replay(lock, document, stored, Direction::Forward).await
        }
        .await;
        self.tally(result).await
    }

    /// Revert `delta`, which must be the current head
    ///
    /// Fails with a conflict if the head has moved.
    pub async fn backward(&self, delta: &Delta) -> DeltaResult<Delta> {
        let result: DeltaResult<Delta> = async {
            let lock = self.lock(delta.workflow_id).await?;
            let document = self.store.load_document(delta.workflow_id).await?;
            let head = document.workflow.last_delta;
            if head != Some(delta.id) {
                return Err(DeltaError::HeadConflict {
                    expected: Some(delta.id),
                    actual: head,
                });
            }
            let stored = self.load_delta_of(delta.workflow_id, delta.id).await?;
            self.replay(lock, document, stored, Direction::Backward).await
        }
        .await;
        self.tally(result).await
    }

    /// Revert the head delta, if there is one
    pub async fn undo(&self, workflow_id: WorkflowId) -> DeltaResult<Option<Delta>> {
        let result: DeltaResult<Option<Delta>> = async {
            let lock = self.lock(workflow_id).await?;
            let document = self.store.load_document(workflow_id).await?;
            let Some(head) = document.workflow.last_delta else {
                debug!(workflow_id = %workflow_id, "Nothing to undo");
                return Ok(None);
            };
            let stored = self.load_delta_of(workflow_id, head).await?;
            self.replay(lock, document, stored, Direction::Backward)
                .await
                .map(Some)
        }
        .await;
        self.tally(result).await
    }

    /// Re-apply the delta after the head, if there is one
    pub async fn redo(&self, workflow_id: WorkflowId) -> DeltaResult<Option<Delta>> {
        let result: DeltaResult<Option<Delta>> = async {
            let lock = self.lock(workflow_id).await?;
            let document = self.store.load_document(workflow_id).await?;
            let head = document.workflow.last_delta;
            let Some(next) = self.chain().successor(workflow_id, head).await? else {
                debug!(workflow_id = %workflow_id, "Nothing to redo");
                return Ok(None);
            };
            self.replay(lock, document, next, Direction::Forward)
                .await
                .map(Some)
        }
        .await;
        self.tally(result).await
    }

    /// The workflow's chain, root first, with the redo branch marked
    pub async fn history(&self, workflow_id: WorkflowId) -> DeltaResult<Vec<HistoryEntry>> {
        let head = self
            .store
            .load_document(workflow_id)
            .await?
            .workflow
            .last_delta;
        let chain = self.chain().verify(workflow_id).await?;

        let mut applied = head.is_some();
        let mut entries = Vec::with_capacity(chain.len());
        for delta in chain {
            let description = self.registry.handler(&delta.kind)?.describe(&delta.payload)?;
            entries.push(HistoryEntry {
                id: delta.id,
                kind: delta.kind,
                description,
                datetime: delta.datetime,
                applied,
            });
            if Some(delta.id) == head {
                applied = false;
            }
        }
        Ok(entries)
    }

    /// Check the workflow's chain, returning it root first
    pub async fn verify_chain(&self, workflow_id: WorkflowId) -> DeltaResult<Vec<Delta>> {
        let result = self.chain().verify(workflow_id).await;
        if let Err(e) = &result {
            error!(workflow_id = %workflow_id, error = %e, "History chain is corrupt");
        }
        result
    }

    async fn lock(&self, workflow_id: WorkflowId) -> DeltaResult<WorkflowLock> {
        let lock = self
            .locks
            .acquire(workflow_id, self.config.lock_timeout())
            .await?;
        self.metrics
            .record_duration(names::LOCK_WAIT, lock.waited())
            .await;
        Ok(lock)
    }

    async fn load_delta_of(&self, workflow_id: WorkflowId, delta_id: DeltaId) -> DeltaResult<Delta> {
        let delta = self.store.load_delta(delta_id).await?;
        if delta.workflow_id != workflow_id {
            return Err(DeltaError::not_found("Delta", delta_id));
        }
        Ok(delta)
    }

    /// Apply a stored delta in one direction and move the head across it
    async fn replay(
        &self,
        lock: WorkflowLock,
        mut document: WorkflowDocument,
        mut delta: Delta,
        direction: Direction,
    ) -> DeltaResult<Delta> {
        let handler = self.registry.handler(&delta.kind)?;
        let timer = self.metrics.timer(names::APPLY);
        let outcome = direction.apply(handler.as_ref(), &mut delta, &mut document)?;

        let head = match direction {
            Direction::Forward => Some(delta.clone()),
            Direction::Backward => match delta.prev_delta_id {
                Some(prev) => Some(self.store.load_delta(prev).await?),
                None => None,
            },
        };
        document.workflow.last_delta = head.as_ref().map(|d| d.id);

        let mut commit = HistoryCommit::document(document.clone());
        commit.payload_update = Some(PayloadUpdate {
            delta_id: delta.id,
            payload: delta.payload.clone(),
        });
        lock.ensure_held().await?;
        self.store.commit(commit).await?;
        timer.record().await;
        drop(lock);

        match direction {
            Direction::Forward => {
                info!(workflow_id = %delta.workflow_id, delta_id = %delta.id, kind = %delta.kind, "Redid delta");
                self.metrics.increment(names::REDO).await;
            }
            Direction::Backward => {
                info!(workflow_id = %delta.workflow_id, delta_id = %delta.id, kind = %delta.kind, "Undid delta");
                self.metrics.increment(names::UNDO).await;
            }
        }

        self.announce(Committed {
            document,
            head,
            outcome,
        })
        .await;
        Ok(delta)
    }

    /// Notify clients, then schedule a recompute if one is needed
    async fn announce(&self, committed: Committed) {
        let workflow_id = committed.document.id();
        let notification = DeltaNotification::build(
            &committed.document,
            committed.head.as_ref(),
            &committed.outcome,
        );

        if let Err(e) = self.notifier.notify(workflow_id, &notification).await {
            warn!(workflow_id = %workflow_id, error = %e, "Failed to deliver delta notification");
        }

        if !notification.needs_recompute() {
            return;
        }
        let Some(head) = committed.head.as_ref().map(|d| d.id) else {
            debug!(workflow_id = %workflow_id, "Invalidated steps without a head; nothing to render");
            return;
        };
        match self.scheduler.schedule_recompute(workflow_id, head).await {
            Ok(()) => self.metrics.increment(names::RECOMPUTE).await,
            Err(e) => error!(
                workflow_id = %workflow_id,
                delta_id = %head,
                error = %e,
                "Failed to schedule recompute"
            ),
        }
    }

    async fn tally<T>(&self, result: DeltaResult<T>) -> DeltaResult<T> {
        if let Err(e) = &result {
            self.metrics.record_error(e.kind().as_str()).await;
            match e.kind() {
                ErrorKind::Fatal => {
                    error!(error = %e, "History operation failed")
                }
                _ => debug!(error = %e, kind = %e.kind(), "History operation rejected"),
            }
        }
        result
    }
}
