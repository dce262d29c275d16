// Copyright 2025 Cowboy AI, LLC.

//! Queries and bulk maintenance over one workflow's delta chain
//!
//! A workflow's history is a singly linked list: every delta points at its
//! predecessor, the first one at nothing. Deltas after the head form the
//! redo branch. Creating a command while a redo branch exists discards the
//! whole branch in one range delete, then hard-deletes the tabs and steps
//! that only the discarded deltas still referred to.

use crate::commands::{CommandRegistry, ReferencedChildren};
use crate::delta::Delta;
use crate::errors::{DeltaError, DeltaResult};
use crate::identifiers::{DeltaId, WorkflowId};
use crate::lock::WorkflowLock;
use crate::store::{CommitReceipt, DeltaStore, HistoryCommit, OrphanSweep, Truncation};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// View of one store through one command registry
#[derive(Debug, Clone, Copy)]
pub struct HistoryChain<'a> {
    store: &'a dyn DeltaStore,
    registry: &'a CommandRegistry,
}

impl<'a> HistoryChain<'a> {
    /// Wrap a store and the registry that interprets its payloads
    pub fn new(store: &'a dyn DeltaStore, registry: &'a CommandRegistry) -> Self {
        Self { store, registry }
    }

    /// The delta after `prev`; with `None`, the root
    pub async fn successor(
        &self,
        workflow_id: WorkflowId,
        prev: Option<DeltaId>,
    ) -> DeltaResult<Option<Delta>> {
        Ok(self.store.successor(workflow_id, prev).await?)
    }

    /// Delete `delta` and every later delta of its workflow
    ///
    /// Goes through the same committed [`Truncation`] as a create that
    /// discards a redo branch: owned rows of every registered kind and the
    /// children only the deleted deltas referred to leave in one store
    /// write. The head must already sit before `delta`, and `lock` must be
    /// the held lock of the delta's workflow.
    pub async fn delete_with_successors(
        &self,
        lock: &WorkflowLock,
        delta: &Delta,
    ) -> DeltaResult<CommitReceipt> {
        check_lock(lock, delta.workflow_id)?;
        let document = self.store.load_document(delta.workflow_id).await?;
        let mut commit = HistoryCommit::document(document);
        commit.truncate = Some(self.truncation_from(delta).await?);

        lock.ensure_held().await?;
        let receipt = self.store.commit(commit).await?;
        debug!(
            workflow_id = %delta.workflow_id,
            from = %delta.id,
            deleted = receipt.deltas_deleted,
            tabs = receipt.orphans.tabs.len(),
            steps = receipt.orphans.steps.len(),
            "Discarded redo branch"
        );
        Ok(receipt)
    }

    /// Truncation discarding `orphan` and its successors
    ///
    /// `keep` starts from the children referenced by the deltas that survive;
    /// callers add whatever the delta being created references.
    pub async fn truncation_from(&self, orphan: &Delta) -> DeltaResult<Truncation> {
        let survivors: Vec<Delta> = self
            .store
            .list_deltas(orphan.workflow_id)
            .await?
            .into_iter()
            .filter(|d| d.id < orphan.id)
            .collect();
        Ok(Truncation {
            from: orphan.id,
            owned_tables: self.registry.owned_tables(),
            keep: self.referenced_by(&survivors)?,
        })
    }

    /// Children referenced by `deltas`
    pub fn referenced_by(&self, deltas: &[Delta]) -> DeltaResult<ReferencedChildren> {
        let mut keep = ReferencedChildren::default();
        for delta in deltas {
            let handler = self.registry.handler(&delta.kind)?;
            keep.extend(handler.referenced_children(&delta.payload)?);
        }
        Ok(keep)
    }

    /// Hard-delete soft-deleted children no remaining delta refers to
    ///
    /// Truncating commits already sweep; this is the standalone pass. It is
    /// a store write of its own, so it runs under `lock`.
    pub async fn collect_orphans(&self, lock: &WorkflowLock) -> DeltaResult<OrphanSweep> {
        let workflow_id = lock.workflow_id();
        let deltas = self.store.list_deltas(workflow_id).await?;
        let keep = self.referenced_by(&deltas)?;

        lock.ensure_held().await?;
        let sweep = self.store.delete_orphan_children(workflow_id, &keep).await?;
        if !sweep.is_empty() {
            debug!(
                workflow_id = %workflow_id,
                tabs = sweep.tabs.len(),
                steps = sweep.steps.len(),
                "Collected orphaned children"
            );
        }
        Ok(sweep)
    }

    /// The whole chain, root first, after checking its invariants
    ///
    /// Fails with [`DeltaError::CorruptHistory`] naming the first violation:
    /// more than one root, a dangling or non-decreasing predecessor link, a
    /// fork, a delta unreachable from the root, or a head off the chain.
    pub async fn verify(&self, workflow_id: WorkflowId) -> DeltaResult<Vec<Delta>> {
        let head = self.store.load_document(workflow_id).await?.workflow.last_delta;
        let deltas = self.store.list_deltas(workflow_id).await?;
        let corrupt = |reason: String| DeltaError::CorruptHistory {
            workflow_id,
            reason,
        };

        let ids: HashSet<DeltaId> = deltas.iter().map(|d| d.id).collect();
        let mut by_prev: HashMap<Option<DeltaId>, &Delta> = HashMap::new();
        for delta in &deltas {
            if let Some(prev) = delta.prev_delta_id {
                if !ids.contains(&prev) {
                    return Err(corrupt(format!(
                        "delta {} points at missing delta {}",
                        delta.id, prev
                    )));
                }
                if prev >= delta.id {
                    return Err(corrupt(format!(
                        "delta {} points forward at {}",
                        delta.id, prev
                    )));
                }
            }
            if let Some(other) = by_prev.insert(delta.prev_delta_id, delta) {
                return Err(corrupt(match delta.prev_delta_id {
                    None => format!("deltas {} and {} are both roots", other.id, delta.id),
                    Some(prev) => format!(
                        "deltas {} and {} both follow {}",
                        other.id, delta.id, prev
                    ),
                }));
            }
        }

        let mut chain = Vec::with_capacity(deltas.len());
        let mut cursor = None;
        while let Some(next) = by_prev.get(&cursor) {
            chain.push((*next).clone());
            cursor = Some(next.id);
        }
        if chain.len() != deltas.len() {
            return Err(corrupt(format!(
                "{} of {} deltas are unreachable from the root",
                deltas.len() - chain.len(),
                deltas.len()
            )));
        }
        if let Some(head) = head {
            if !ids.contains(&head) {
                return Err(corrupt(format!("head {} is not on the chain", head)));
            }
        }
        Ok(chain)
    }
}

fn check_lock(lock: &WorkflowLock, workflow_id: WorkflowId) -> DeltaResult<()> {
    if lock.workflow_id() == workflow_id {
        Ok(())
    } else {
        Err(DeltaError::validation(format!(
            "lock on workflow {} does not cover workflow {}",
            lock.workflow_id(),
            workflow_id
        )))
    }
}
