// Copyright 2025 Cowboy AI, LLC.

//! Storage for workflow documents and their delta chains
//!
//! The engine only ever writes through [`DeltaStore::commit`], which applies a
//! [`HistoryCommit`] as one unit: either the document, the new or updated
//! delta, the truncated branch and the orphan sweep all land, or none do.

mod memory;

pub use memory::InMemoryDeltaStore;

use crate::commands::ReferencedChildren;
use crate::delta::{Delta, OwnedTable};
use crate::document::WorkflowDocument;
use crate::identifiers::{DeltaId, StepId, TabId, WorkflowId};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Errors raised by a [`DeltaStore`]
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No workflow with this ID
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    /// No delta with this ID
    #[error("Delta not found: {0}")]
    DeltaNotFound(DeltaId),

    /// A write would break a history invariant
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Stored data is inconsistent
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// The underlying storage system failed
    #[error("Storage error: {0}")]
    Backend(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A delta to insert, with the table its payload goes to
#[derive(Debug, Clone)]
pub struct NewDelta {
    /// The delta, payload included
    pub delta: Delta,
    /// Table receiving the payload row
    pub payload_table: OwnedTable,
}

/// Rewrite of an existing delta's payload after forward/backward
#[derive(Debug, Clone)]
pub struct PayloadUpdate {
    /// Delta whose payload changed
    pub delta_id: DeltaId,
    /// New payload
    pub payload: Value,
}

/// Removal of an abandoned redo branch
#[derive(Debug, Clone)]
pub struct Truncation {
    /// First delta of the branch; it and every later delta of the workflow go
    pub from: DeltaId,
    /// Tables cascaded with the deleted deltas
    pub owned_tables: Vec<OwnedTable>,
    /// Children the surviving history still refers to
    pub keep: ReferencedChildren,
}

/// Everything one history mutation writes
#[derive(Debug, Clone)]
pub struct HistoryCommit {
    /// Document state after the mutation, head pointer included
    pub document: WorkflowDocument,
    /// Branch to discard before inserting
    pub truncate: Option<Truncation>,
    /// Delta created by this mutation
    pub new_delta: Option<NewDelta>,
    /// Payload bookkeeping written back by redo/undo
    pub payload_update: Option<PayloadUpdate>,
}

impl HistoryCommit {
    /// A commit that only writes the document
    pub fn document(document: WorkflowDocument) -> Self {
        Self {
            document,
            truncate: None,
            new_delta: None,
            payload_update: None,
        }
    }
}

/// What a history mutation removed from storage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Deltas removed by truncation
    pub deltas_deleted: usize,
    /// Result of the orphan sweep, if one ran
    pub orphans: OrphanSweep,
}

/// Children hard-deleted by an orphan sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanSweep {
    /// Removed tabs
    pub tabs: Vec<TabId>,
    /// Removed steps, including those of removed tabs
    pub steps: Vec<StepId>,
}

impl OrphanSweep {
    /// Whether nothing was removed
    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty() && self.steps.is_empty()
    }
}

/// Persistent storage for documents and history
#[async_trait]
pub trait DeltaStore: Send + Sync + fmt::Debug {
    /// Store a new document
    async fn insert_document(&self, document: WorkflowDocument) -> StoreResult<()>;

    /// Load a document with all of its children
    async fn load_document(&self, workflow_id: WorkflowId) -> StoreResult<WorkflowDocument>;

    /// Load a delta with its payload
    async fn load_delta(&self, delta_id: DeltaId) -> StoreResult<Delta>;

    /// The delta whose `prev_delta_id` is `prev` on this workflow
    ///
    /// With `prev == None` this is the root of the history.
    async fn successor(
        &self,
        workflow_id: WorkflowId,
        prev: Option<DeltaId>,
    ) -> StoreResult<Option<Delta>>;

    /// Every delta of a workflow in ID order
    async fn list_deltas(&self, workflow_id: WorkflowId) -> StoreResult<Vec<Delta>>;

    /// Reserve the next delta ID
    ///
    /// IDs are strictly increasing and never reused, even when the delta
    /// they were reserved for is never committed.
    async fn allocate_delta_id(&self) -> StoreResult<DeltaId>;

    /// Hard-delete soft-deleted tabs and steps not in `keep`
    ///
    /// Standalone sweep; truncating commits sweep on their own.
    async fn delete_orphan_children(
        &self,
        workflow_id: WorkflowId,
        keep: &ReferencedChildren,
    ) -> StoreResult<OrphanSweep>;

    /// Apply a history mutation atomically
    async fn commit(&self, commit: HistoryCommit) -> StoreResult<CommitReceipt>;
}
