// Copyright 2025 Cowboy AI, LLC.

//! Command kinds and the registry the engine dispatches through
//!
//! A command kind is a type implementing [`Command`]. It decides in `amend`
//! whether the requested change does anything, and knows how to apply and
//! revert itself against a staged [`WorkflowDocument`]. The engine never
//! names concrete kinds: it stores `(kind, payload)` and looks the kind up in
//! a [`CommandRegistry`] whenever a delta must be replayed, reverted or
//! described.

mod step;
mod tab;
mod workflow;

pub use step::{
    AddStep, AddStepArgs, AddStepPayload, ChangeStepNotes, ChangeStepNotesArgs,
    ChangeStepNotesPayload, ChangeStepParams, ChangeStepParamsArgs, ChangeStepParamsPayload,
    DeleteStep, DeleteStepPayload, ReorderSteps, ReorderStepsArgs, ReorderStepsPayload,
};
pub use tab::{
    AddTab, AddTabArgs, AddTabPayload, DeleteTab, DeleteTabPayload, SetTabName, SetTabNameArgs,
    SetTabNamePayload,
};
pub use workflow::{ChangeWorkflowTitle, SetWorkflowPublic, ValueChange};

use crate::delta::OwnedTable;
use crate::document::WorkflowDocument;
use crate::errors::{DeltaError, DeltaResult};
use crate::identifiers::{DeltaId, StepId, TabId, WorkflowId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Identity of the delta being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyContext {
    /// Workflow being edited
    pub workflow_id: WorkflowId,
    /// Delta whose effect is applied or reverted
    pub delta_id: DeltaId,
}

/// What a forward or backward application touched
///
/// The engine turns this into the client notification and the recompute
/// decision; it is never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Steps whose cached output is no longer current
    pub invalidated_steps: Vec<StepId>,
    /// Step the command is about, serialized whole (or cleared if removed)
    pub touched_step: Option<StepId>,
    /// Tab the command is about, serialized whole (or cleared if removed)
    pub touched_tab: Option<TabId>,
}

impl ApplyOutcome {
    /// Nothing beyond workflow fields changed
    pub fn none() -> Self {
        Self::default()
    }

    /// Report steps needing a new render
    pub fn invalidating(mut self, steps: impl IntoIterator<Item = StepId>) -> Self {
        self.invalidated_steps.extend(steps);
        self
    }

    /// Report the step the command is about
    pub fn touching_step(mut self, step: StepId) -> Self {
        self.touched_step = Some(step);
        self
    }

    /// Report the tab the command is about
    pub fn touching_tab(mut self, tab: TabId) -> Self {
        self.touched_tab = Some(tab);
        self
    }

    /// Whether a render must be scheduled
    pub fn needs_recompute(&self) -> bool {
        !self.invalidated_steps.is_empty()
    }
}

/// A child entity a delta refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildRef {
    /// A tab
    Tab(TabId),
    /// A step
    Step(StepId),
}

/// Children referenced by a set of deltas
///
/// Soft-deleted children outside this set can be hard-deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferencedChildren {
    /// Referenced tabs
    pub tabs: HashSet<TabId>,
    /// Referenced steps
    pub steps: HashSet<StepId>,
}

impl ReferencedChildren {
    /// Record references
    pub fn extend(&mut self, refs: impl IntoIterator<Item = ChildRef>) {
        for r in refs {
            match r {
                ChildRef::Tab(id) => {
                    self.tabs.insert(id);
                }
                ChildRef::Step(id) => {
                    self.steps.insert(id);
                }
            }
        }
    }
}

/// A command kind
///
/// Implementations are zero-sized markers; all state lives in `Payload`,
/// which is what gets persisted. `forward` and `backward` may update the
/// payload's bookkeeping fields (e.g. versions to restore on undo); the
/// engine writes the updated payload back in the same commit.
pub trait Command: Send + Sync + 'static {
    /// Discriminator stored on every delta of this kind
    const KIND: &'static str;

    /// Table holding this kind's payloads
    const PAYLOAD_TABLE: OwnedTable;

    /// Caller-supplied arguments
    type Args: Send;

    /// Persisted payload
    type Payload: Serialize + DeserializeOwned + Send;

    /// Inspect current state and build the payload
    ///
    /// `Ok(None)` aborts creation without error: nothing is recorded,
    /// notified or scheduled.
    fn amend(args: Self::Args, doc: &WorkflowDocument) -> DeltaResult<Option<Self::Payload>>;

    /// Apply the change
    fn forward(
        payload: &mut Self::Payload,
        doc: &mut WorkflowDocument,
        ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome>;

    /// Revert the change
    fn backward(
        payload: &mut Self::Payload,
        doc: &mut WorkflowDocument,
        ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome>;

    /// Human-readable description for history listings
    fn describe(payload: &Self::Payload) -> String;

    /// Children this delta must keep alive through orphan collection
    fn referenced_children(_payload: &Self::Payload) -> Vec<ChildRef> {
        Vec::new()
    }

    /// Every table whose rows are owned by deltas of this kind
    fn owned_tables() -> Vec<OwnedTable> {
        vec![Self::PAYLOAD_TABLE]
    }
}

/// Type-erased view of a [`Command`], operating on JSON payloads
pub trait CommandHandler: Send + Sync {
    /// Kind discriminator
    fn kind(&self) -> &'static str;

    /// Table holding this kind's payloads
    fn payload_table(&self) -> OwnedTable;

    /// Tables cascaded when deltas of this kind are deleted
    fn owned_tables(&self) -> Vec<OwnedTable>;

    /// Apply a stored payload, updating its bookkeeping in place
    fn forward(
        &self,
        payload: &mut Value,
        doc: &mut WorkflowDocument,
        ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome>;

    /// Revert a stored payload, updating its bookkeeping in place
    fn backward(
        &self,
        payload: &mut Value,
        doc: &mut WorkflowDocument,
        ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome>;

    /// Describe a stored payload
    fn describe(&self, payload: &Value) -> DeltaResult<String>;

    /// Children a stored payload refers to
    fn referenced_children(&self, payload: &Value) -> DeltaResult<Vec<ChildRef>>;
}

struct TypedHandler<C>(PhantomData<fn() -> C>);

impl<C: Command> TypedHandler<C> {
    fn decode(payload: &Value) -> DeltaResult<C::Payload> {
        Ok(serde_json::from_value(payload.clone())?)
    }

    fn apply(
        payload: &mut Value,
        doc: &mut WorkflowDocument,
        ctx: &ApplyContext,
        f: fn(&mut C::Payload, &mut WorkflowDocument, &ApplyContext) -> DeltaResult<ApplyOutcome>,
    ) -> DeltaResult<ApplyOutcome> {
        let mut typed = Self::decode(payload)?;
        let outcome = f(&mut typed, doc, ctx)?;
        *payload = serde_json::to_value(&typed)?;
        Ok(outcome)
    }
}

impl<C: Command> CommandHandler for TypedHandler<C> {
    fn kind(&self) -> &'static str {
        C::KIND
    }

    fn payload_table(&self) -> OwnedTable {
        C::PAYLOAD_TABLE
    }

    fn owned_tables(&self) -> Vec<OwnedTable> {
        C::owned_tables()
    }

    fn forward(
        &self,
        payload: &mut Value,
        doc: &mut WorkflowDocument,
        ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        Self::apply(payload, doc, ctx, C::forward)
    }

    fn backward(
        &self,
        payload: &mut Value,
        doc: &mut WorkflowDocument,
        ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        Self::apply(payload, doc, ctx, C::backward)
    }

    fn describe(&self, payload: &Value) -> DeltaResult<String> {
        Ok(C::describe(&Self::decode(payload)?))
    }

    fn referenced_children(&self, payload: &Value) -> DeltaResult<Vec<ChildRef>> {
        Ok(C::referenced_children(&Self::decode(payload)?))
    }
}

/// Maps command kinds to their handlers
#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every command kind shipped in this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register::<ChangeWorkflowTitle>()
            .register::<SetWorkflowPublic>()
            .register::<AddTab>()
            .register::<SetTabName>()
            .register::<DeleteTab>()
            .register::<AddStep>()
            .register::<DeleteStep>()
            .register::<ReorderSteps>()
            .register::<ChangeStepParams>()
            .register::<ChangeStepNotes>();
        registry
    }

    /// Register a command kind, replacing any handler with the same kind
    pub fn register<C: Command>(&mut self) -> &mut Self {
        self.handlers
            .insert(C::KIND, Arc::new(TypedHandler::<C>(PhantomData)));
        self
    }

    /// Whether a kind is registered
    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Handler for a kind
    pub fn handler(&self, kind: &str) -> DeltaResult<Arc<dyn CommandHandler>> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| DeltaError::UnknownCommand(kind.to_string()))
    }

    /// Every owned table across all registered kinds, sorted
    pub fn owned_tables(&self) -> Vec<OwnedTable> {
        self.handlers
            .values()
            .flat_map(|h| h.owned_tables())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
