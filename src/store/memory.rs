// Copyright 2025 Cowboy AI, LLC.

//! In-memory delta store

use super::{
    CommitReceipt, DeltaStore, HistoryCommit, OrphanSweep, StoreError, StoreResult, Truncation,
};
use crate::commands::ReferencedChildren;
use crate::delta::{Delta, OwnedTable};
use crate::document::WorkflowDocument;
use crate::identifiers::{DeltaId, WorkflowId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Base row shared by every delta kind
#[derive(Debug, Clone)]
struct DeltaRow {
    workflow_id: WorkflowId,
    prev_delta_id: Option<DeltaId>,
    datetime: DateTime<Utc>,
    kind: String,
    payload_table: OwnedTable,
}

#[derive(Debug, Default)]
struct Tables {
    documents: HashMap<WorkflowId, WorkflowDocument>,
    deltas: BTreeMap<DeltaId, DeltaRow>,
    owned: HashMap<OwnedTable, BTreeMap<DeltaId, Value>>,
    last_delta_id: u64,
}

impl Tables {
    fn document(&self, workflow_id: WorkflowId) -> StoreResult<&WorkflowDocument> {
        self.documents
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    fn join(&self, id: DeltaId, row: &DeltaRow) -> StoreResult<Delta> {
        let payload = self
            .owned
            .get(&row.payload_table)
            .and_then(|rows| rows.get(&id))
            .cloned()
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "delta {id} has no row in {}",
                    row.payload_table
                ))
            })?;
        Ok(Delta {
            id,
            workflow_id: row.workflow_id,
            prev_delta_id: row.prev_delta_id,
            datetime: row.datetime,
            kind: row.kind.clone(),
            payload,
        })
    }

    /// IDs of `from` and every later delta of the workflow
    fn branch_from(&self, workflow_id: WorkflowId, from: DeltaId) -> Vec<DeltaId> {
        self.deltas
            .range(from..)
            .filter(|(_, row)| row.workflow_id == workflow_id)
            .map(|(id, _)| *id)
            .collect()
    }

    fn delete_ids(&mut self, ids: &[DeltaId], owned_tables: &[OwnedTable]) {
        for table in owned_tables {
            if let Some(rows) = self.owned.get_mut(table) {
                for id in ids {
                    rows.remove(id);
                }
            }
        }
        for id in ids {
            self.deltas.remove(id);
        }
    }

    fn sweep_orphans(&mut self, workflow_id: WorkflowId, keep: &ReferencedChildren) -> OrphanSweep {
        let Some(doc) = self.documents.get_mut(&workflow_id) else {
            return OrphanSweep::default();
        };
        let mut sweep = OrphanSweep::default();

        doc.tabs.retain(|tab| {
            let orphan = tab.is_deleted && !keep.tabs.contains(&tab.id);
            if orphan {
                sweep.tabs.push(tab.id);
            }
            !orphan
        });
        doc.steps.retain(|step| {
            let orphan = (step.is_deleted && !keep.steps.contains(&step.id))
                || sweep.tabs.contains(&step.tab_id);
            if orphan {
                sweep.steps.push(step.id);
            }
            !orphan
        });
        sweep
    }

    /// Reject commits that would fork or dangle the chain
    ///
    /// Runs before any mutation so a rejected commit leaves no trace.
    fn check_commit(&self, commit: &HistoryCommit) -> StoreResult<()> {
        let workflow_id = commit.document.id();
        self.document(workflow_id)?;

        let truncated_from = commit.truncate.as_ref().map(|t| t.from);
        let survives = |id: &DeltaId| truncated_from.map_or(true, |from| *id < from);

        if let Some(new) = &commit.new_delta {
            let delta = &new.delta;
            if delta.workflow_id != workflow_id {
                return Err(StoreError::Constraint(format!(
                    "delta {} belongs to workflow {}, not {}",
                    delta.id, delta.workflow_id, workflow_id
                )));
            }
            if delta.id.get() > self.last_delta_id {
                return Err(StoreError::Constraint(format!(
                    "delta id {} was never allocated",
                    delta.id
                )));
            }
            let last = self
                .deltas
                .iter()
                .rev()
                .find(|(id, row)| row.workflow_id == workflow_id && survives(id))
                .map(|(id, _)| *id);
            if let Some(last) = last {
                if delta.id <= last {
                    return Err(StoreError::Constraint(format!(
                        "delta id {} does not follow {}",
                        delta.id, last
                    )));
                }
            }
            let forks = self.deltas.iter().any(|(id, row)| {
                row.workflow_id == workflow_id
                    && row.prev_delta_id == delta.prev_delta_id
                    && survives(id)
            });
            if forks {
                return Err(StoreError::Constraint(format!(
                    "delta {} would fork the history after {:?}",
                    delta.id, delta.prev_delta_id
                )));
            }
        }

        if let Some(update) = &commit.payload_update {
            match self.deltas.get(&update.delta_id) {
                Some(row) if row.workflow_id == workflow_id => {}
                _ => return Err(StoreError::DeltaNotFound(update.delta_id)),
            }
        }

        if let Some(head) = commit.document.workflow.last_delta {
            let inserted = commit.new_delta.as_ref().map(|n| n.delta.id) == Some(head);
            let stored = self
                .deltas
                .get(&head)
                .is_some_and(|row| row.workflow_id == workflow_id)
                && survives(&head);
            if !inserted && !stored {
                return Err(StoreError::Constraint(format!(
                    "head {head} is not a delta of workflow {workflow_id}"
                )));
            }
        }
        Ok(())
    }

    fn truncate(&mut self, workflow_id: WorkflowId, truncation: &Truncation) -> usize {
        let doomed = self.branch_from(workflow_id, truncation.from);
        self.delete_ids(&doomed, &truncation.owned_tables);
        doomed.len()
    }
}

/// Delta store keeping everything in process memory
///
/// Deltas live in a base table ordered by ID; each payload lives in the
/// table its command kind declares, the way a relational schema would
/// split a polymorphic model.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeltaStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryDeltaStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently held in an owned table
    pub async fn owned_row_count(&self, table: OwnedTable) -> usize {
        let tables = self.tables.read().await;
        tables.owned.get(&table).map_or(0, BTreeMap::len)
    }

    /// Number of deltas across all workflows
    pub async fn delta_count(&self) -> usize {
        self.tables.read().await.deltas.len()
    }
}

#[async_trait]
impl DeltaStore for InMemoryDeltaStore {
    async fn insert_document(&self, document: WorkflowDocument) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.documents.contains_key(&document.id()) {
            return Err(StoreError::Constraint(format!(
                "workflow {} already exists",
                document.id()
            )));
        }
        if document.workflow.last_delta.is_some() {
            return Err(StoreError::Constraint(
                "a new workflow cannot point at history".to_string(),
            ));
        }
        tables.documents.insert(document.id(), document);
        Ok(())
    }

    async fn load_document(&self, workflow_id: WorkflowId) -> StoreResult<WorkflowDocument> {
        let tables = self.tables.read().await;
        tables.document(workflow_id).cloned()
    }

    async fn load_delta(&self, delta_id: DeltaId) -> StoreResult<Delta> {
        let tables = self.tables.read().await;
        let row = tables
            .deltas
            .get(&delta_id)
            .ok_or(StoreError::DeltaNotFound(delta_id))?;
        tables.join(delta_id, row)
    }

    async fn successor(
        &self,
        workflow_id: WorkflowId,
        prev: Option<DeltaId>,
    ) -> StoreResult<Option<Delta>> {
        let tables = self.tables.read().await;
        let start = prev.map_or(DeltaId::new(0), |id| DeltaId::new(id.get() + 1));
        tables
            .deltas
            .range(start..)
            .find(|(_, row)| row.workflow_id == workflow_id && row.prev_delta_id == prev)
            .map(|(id, row)| tables.join(*id, row))
            .transpose()
    }

    async fn list_deltas(&self, workflow_id: WorkflowId) -> StoreResult<Vec<Delta>> {
        let tables = self.tables.read().await;
        tables
            .deltas
            .iter()
            .filter(|(_, row)| row.workflow_id == workflow_id)
            .map(|(id, row)| tables.join(*id, row))
            .collect()
    }

    async fn allocate_delta_id(&self) -> StoreResult<DeltaId> {
        let mut tables = self.tables.write().await;
        tables.last_delta_id += 1;
        Ok(DeltaId::new(tables.last_delta_id))
    }

    async fn delete_orphan_children(
        &self,
        workflow_id: WorkflowId,
        keep: &ReferencedChildren,
    ) -> StoreResult<OrphanSweep> {
        let mut tables = self.tables.write().await;
        tables.document(workflow_id)?;
        Ok(tables.sweep_orphans(workflow_id, keep))
    }

    async fn commit(&self, commit: HistoryCommit) -> StoreResult<CommitReceipt> {
        let mut tables = self.tables.write().await;
        tables.check_commit(&commit)?;

        let workflow_id = commit.document.id();
        let mut receipt = CommitReceipt::default();

        if let Some(truncation) = &commit.truncate {
            receipt.deltas_deleted = tables.truncate(workflow_id, truncation);
        }
        if let Some(new) = commit.new_delta {
            let delta = new.delta;
            tables
                .owned
                .entry(new.payload_table)
                .or_default()
                .insert(delta.id, delta.payload);
            tables.deltas.insert(
                delta.id,
                DeltaRow {
                    workflow_id: delta.workflow_id,
                    prev_delta_id: delta.prev_delta_id,
                    datetime: delta.datetime,
                    kind: delta.kind,
                    payload_table: new.payload_table,
                },
            );
        }
        if let Some(update) = commit.payload_update {
            if let Some(table) = tables.deltas.get(&update.delta_id).map(|r| r.payload_table) {
                tables
                    .owned
                    .entry(table)
                    .or_default()
                    .insert(update.delta_id, update.payload);
            }
        }
        tables.documents.insert(workflow_id, commit.document);

        if let Some(truncation) = &commit.truncate {
            receipt.orphans = tables.sweep_orphans(workflow_id, &truncation.keep);
            debug!(
                workflow_id = %workflow_id,
                from = %truncation.from,
                deleted = receipt.deltas_deleted,
                "Truncated history"
            );
        }
        Ok(receipt)
    }
}
