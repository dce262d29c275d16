// Copyright 2025 Cowboy AI, LLC.

//! Commands editing steps
//!
//! Every command here that can change a render result invalidates the
//! affected step and every step after it in the same tab, since later steps
//! consume earlier output. The versions it overwrote are kept in the payload
//! and restored on undo.

use super::{ApplyContext, ApplyOutcome, ChildRef, Command};
use crate::delta::OwnedTable;
use crate::document::{Step, WorkflowDocument};
use crate::errors::{DeltaError, DeltaResult};
use crate::identifiers::{DeltaId, StepId, TabId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

type PriorVersions = Vec<(StepId, Option<DeltaId>)>;

fn missing_step(id: StepId) -> DeltaError {
    DeltaError::not_found("Step", id)
}

/// Live steps of `tab_id` from `position` onwards
fn steps_from(doc: &WorkflowDocument, tab_id: TabId, position: usize) -> Vec<StepId> {
    doc.live_step_ids(tab_id)
        .into_iter()
        .skip(position)
        .collect()
}

/// Invalidate `steps` at `ctx.delta_id`, remembering what was overwritten
fn invalidate(
    doc: &mut WorkflowDocument,
    steps: Vec<StepId>,
    ctx: &ApplyContext,
    prior: &mut PriorVersions,
) -> ApplyOutcome {
    *prior = doc.invalidate_steps(&steps, ctx.delta_id);
    ApplyOutcome::none().invalidating(steps)
}

/// Put back versions saved by [`invalidate`]
fn restore(doc: &mut WorkflowDocument, prior: &PriorVersions) -> ApplyOutcome {
    doc.restore_step_versions(prior);
    ApplyOutcome::none().invalidating(prior.iter().map(|(id, _)| *id))
}

/// Arguments to [`AddStep`]
#[derive(Debug, Clone)]
pub struct AddStepArgs {
    /// Tab receiving the step
    pub tab_id: TabId,
    /// Index among the tab's live steps
    pub position: usize,
    /// Module the step runs
    pub module_id_name: String,
    /// Initial parameter values
    pub params: Map<String, Value>,
}

/// Payload of [`AddStep`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddStepPayload {
    step_id: StepId,
    tab_id: TabId,
    position: usize,
    module_id_name: String,
    params: Map<String, Value>,
    #[serde(default)]
    prior_versions: PriorVersions,
}

impl AddStepPayload {
    /// The step this delta creates
    pub fn step_id(&self) -> StepId {
        self.step_id
    }
}

/// Insert a step into a tab
pub struct AddStep;

impl Command for AddStep {
    const KIND: &'static str = "AddStep";
    const PAYLOAD_TABLE: OwnedTable = OwnedTable::new("add_step_deltas");
    type Args = AddStepArgs;
    type Payload = AddStepPayload;

    fn amend(args: AddStepArgs, doc: &WorkflowDocument) -> DeltaResult<Option<AddStepPayload>> {
        doc.live_tab(args.tab_id)?;
        let n_steps = doc.live_steps(args.tab_id).len();
        if args.position > n_steps {
            return Err(DeltaError::validation(format!(
                "position {} is past the end of a tab with {} steps",
                args.position, n_steps
            )));
        }
        if args.module_id_name.trim().is_empty() {
            return Err(DeltaError::validation("module id must not be empty"));
        }
        Ok(Some(AddStepPayload {
            step_id: StepId::new(),
            tab_id: args.tab_id,
            position: args.position,
            module_id_name: args.module_id_name,
            params: args.params,
            prior_versions: Vec::new(),
        }))
    }

    fn forward(
        payload: &mut AddStepPayload,
        doc: &mut WorkflowDocument,
        ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        doc.live_tab(payload.tab_id)?;
        let mut order = doc.live_step_ids(payload.tab_id);
        if payload.position > order.len() {
            return Err(DeltaError::validation("step position out of range"));
        }
        match doc.step_mut(payload.step_id) {
            Some(step) => step.is_deleted = false,
            None => {
                let mut step = Step::new(
                    payload.tab_id,
                    payload.module_id_name.clone(),
                    payload.position,
                    payload.params.clone(),
                );
                step.id = payload.step_id;
                doc.steps.push(step);
            }
        }
        order.insert(payload.position, payload.step_id);
        doc.set_step_order(&order);

        let affected = steps_from(doc, payload.tab_id, payload.position);
        let outcome = invalidate(doc, affected, ctx, &mut payload.prior_versions);
        Ok(outcome.touching_step(payload.step_id))
    }

    fn backward(
        payload: &mut AddStepPayload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        let step = doc
            .step_mut(payload.step_id)
            .ok_or_else(|| missing_step(payload.step_id))?;
        step.is_deleted = true;
        let order = doc.live_step_ids(payload.tab_id);
        doc.set_step_order(&order);

        // The removed step keeps its restored version so a redo renders it
        // from where it was; it is reported as cleared, not invalidated.
        let outcome = restore(doc, &payload.prior_versions);
        let invalidated = outcome
            .invalidated_steps
            .into_iter()
            .filter(|id| *id != payload.step_id);
        Ok(ApplyOutcome::none()
            .invalidating(invalidated)
            .touching_step(payload.step_id))
    }

    fn describe(payload: &AddStepPayload) -> String {
        format!("Added '{}' step", payload.module_id_name)
    }

    fn referenced_children(payload: &AddStepPayload) -> Vec<ChildRef> {
        vec![ChildRef::Step(payload.step_id), ChildRef::Tab(payload.tab_id)]
    }
}

/// Payload of [`DeleteStep`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteStepPayload {
    step_id: StepId,
    tab_id: TabId,
    position: usize,
    #[serde(default)]
    prior_versions: PriorVersions,
}

/// Soft-delete a step
pub struct DeleteStep;

impl Command for DeleteStep {
    const KIND: &'static str = "DeleteStep";
    const PAYLOAD_TABLE: OwnedTable = OwnedTable::new("delete_step_deltas");
    type Args = StepId;
    type Payload = DeleteStepPayload;

    fn amend(step_id: StepId, doc: &WorkflowDocument) -> DeltaResult<Option<DeleteStepPayload>> {
        let step = doc.live_step(step_id)?;
        Ok(Some(DeleteStepPayload {
            step_id,
            tab_id: step.tab_id,
            position: step.position,
            prior_versions: Vec::new(),
        }))
    }

    fn forward(
        payload: &mut DeleteStepPayload,
        doc: &mut WorkflowDocument,
        ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        let step = doc
            .step_mut(payload.step_id)
            .ok_or_else(|| missing_step(payload.step_id))?;
        step.is_deleted = true;
        let order = doc.live_step_ids(payload.tab_id);
        doc.set_step_order(&order);

        let affected = steps_from(doc, payload.tab_id, payload.position);
        let outcome = invalidate(doc, affected, ctx, &mut payload.prior_versions);
        Ok(outcome.touching_step(payload.step_id))
    }

    fn backward(
        payload: &mut DeleteStepPayload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        let mut order = doc.live_step_ids(payload.tab_id);
        let step = doc
            .step_mut(payload.step_id)
            .ok_or_else(|| missing_step(payload.step_id))?;
        step.is_deleted = false;
        order.insert(payload.position.min(order.len()), payload.step_id);
        doc.set_step_order(&order);

        Ok(restore(doc, &payload.prior_versions).touching_step(payload.step_id))
    }

    fn describe(_payload: &DeleteStepPayload) -> String {
        "Deleted step".to_string()
    }

    fn referenced_children(payload: &DeleteStepPayload) -> Vec<ChildRef> {
        vec![ChildRef::Step(payload.step_id)]
    }
}

/// Arguments to [`ReorderSteps`]
#[derive(Debug, Clone)]
pub struct ReorderStepsArgs {
    /// Tab whose steps move
    pub tab_id: TabId,
    /// Every live step of the tab, in the new order
    pub order: Vec<StepId>,
}

/// Payload of [`ReorderSteps`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorderStepsPayload {
    tab_id: TabId,
    old_order: Vec<StepId>,
    new_order: Vec<StepId>,
    #[serde(default)]
    prior_versions: PriorVersions,
}

/// Move steps around within a tab
pub struct ReorderSteps;

impl ReorderSteps {
    /// Steps from the first position whose occupant changed
    fn moved(from: &[StepId], to: &[StepId]) -> Vec<StepId> {
        let first = from
            .iter()
            .zip(to)
            .position(|(a, b)| a != b)
            .unwrap_or(to.len());
        to[first..].to_vec()
    }
}

impl Command for ReorderSteps {
    const KIND: &'static str = "ReorderSteps";
    const PAYLOAD_TABLE: OwnedTable = OwnedTable::new("reorder_steps_deltas");
    type Args = ReorderStepsArgs;
    type Payload = ReorderStepsPayload;

    fn amend(
        args: ReorderStepsArgs,
        doc: &WorkflowDocument,
    ) -> DeltaResult<Option<ReorderStepsPayload>> {
        doc.live_tab(args.tab_id)?;
        let old_order = doc.live_step_ids(args.tab_id);

        let mut expected = old_order.clone();
        let mut given = args.order.clone();
        expected.sort();
        given.sort();
        if expected != given {
            return Err(DeltaError::validation(
                "new order must list every step of the tab exactly once",
            ));
        }
        if old_order == args.order {
            return Ok(None);
        }
        Ok(Some(ReorderStepsPayload {
            tab_id: args.tab_id,
            old_order,
            new_order: args.order,
            prior_versions: Vec::new(),
        }))
    }

    fn forward(
        payload: &mut ReorderStepsPayload,
        doc: &mut WorkflowDocument,
        ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        doc.set_step_order(&payload.new_order);
        let affected = Self::moved(&payload.old_order, &payload.new_order);
        Ok(invalidate(doc, affected, ctx, &mut payload.prior_versions))
    }

    fn backward(
        payload: &mut ReorderStepsPayload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        doc.set_step_order(&payload.old_order);
        Ok(restore(doc, &payload.prior_versions))
    }

    fn describe(_payload: &ReorderStepsPayload) -> String {
        "Reordered steps".to_string()
    }

    fn referenced_children(payload: &ReorderStepsPayload) -> Vec<ChildRef> {
        payload
            .old_order
            .iter()
            .map(|id| ChildRef::Step(*id))
            .chain(std::iter::once(ChildRef::Tab(payload.tab_id)))
            .collect()
    }
}

/// Arguments to [`ChangeStepParams`]
#[derive(Debug, Clone)]
pub struct ChangeStepParamsArgs {
    /// Step to edit
    pub step_id: StepId,
    /// Values to merge over the current parameters
    pub values: Map<String, Value>,
}

/// Payload of [`ChangeStepParams`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeStepParamsPayload {
    step_id: StepId,
    old_values: Map<String, Value>,
    new_values: Map<String, Value>,
    #[serde(default)]
    prior_versions: PriorVersions,
}

/// Change a step's parameter values
pub struct ChangeStepParams;

impl Command for ChangeStepParams {
    const KIND: &'static str = "ChangeStepParams";
    const PAYLOAD_TABLE: OwnedTable = OwnedTable::new("change_step_params_deltas");
    type Args = ChangeStepParamsArgs;
    type Payload = ChangeStepParamsPayload;

    fn amend(
        args: ChangeStepParamsArgs,
        doc: &WorkflowDocument,
    ) -> DeltaResult<Option<ChangeStepParamsPayload>> {
        let step = doc.live_step(args.step_id)?;
        let old_values = step.params.clone();
        let mut new_values = old_values.clone();
        new_values.extend(args.values);
        if new_values == old_values {
            return Ok(None);
        }
        Ok(Some(ChangeStepParamsPayload {
            step_id: args.step_id,
            old_values,
            new_values,
            prior_versions: Vec::new(),
        }))
    }

    fn forward(
        payload: &mut ChangeStepParamsPayload,
        doc: &mut WorkflowDocument,
        ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        let step = doc
            .step_mut(payload.step_id)
            .ok_or_else(|| missing_step(payload.step_id))?;
        step.params = payload.new_values.clone();
        let (tab_id, position) = (step.tab_id, step.position);

        let affected = steps_from(doc, tab_id, position);
        let outcome = invalidate(doc, affected, ctx, &mut payload.prior_versions);
        Ok(outcome.touching_step(payload.step_id))
    }

    fn backward(
        payload: &mut ChangeStepParamsPayload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        let step = doc
            .step_mut(payload.step_id)
            .ok_or_else(|| missing_step(payload.step_id))?;
        step.params = payload.old_values.clone();
        Ok(restore(doc, &payload.prior_versions).touching_step(payload.step_id))
    }

    fn describe(_payload: &ChangeStepParamsPayload) -> String {
        "Changed parameters".to_string()
    }

    fn referenced_children(payload: &ChangeStepParamsPayload) -> Vec<ChildRef> {
        vec![ChildRef::Step(payload.step_id)]
    }
}

/// Arguments to [`ChangeStepNotes`]
#[derive(Debug, Clone)]
pub struct ChangeStepNotesArgs {
    /// Step to annotate
    pub step_id: StepId,
    /// Replacement notes
    pub notes: String,
}

/// Payload of [`ChangeStepNotes`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeStepNotesPayload {
    step_id: StepId,
    old_notes: String,
    new_notes: String,
}

/// Edit a step's notes; never affects render output
pub struct ChangeStepNotes;

impl Command for ChangeStepNotes {
    const KIND: &'static str = "ChangeStepNotes";
    const PAYLOAD_TABLE: OwnedTable = OwnedTable::new("change_step_notes_deltas");
    type Args = ChangeStepNotesArgs;
    type Payload = ChangeStepNotesPayload;

    fn amend(
        args: ChangeStepNotesArgs,
        doc: &WorkflowDocument,
    ) -> DeltaResult<Option<ChangeStepNotesPayload>> {
        let step = doc.live_step(args.step_id)?;
        if step.notes == args.notes {
            return Ok(None);
        }
        Ok(Some(ChangeStepNotesPayload {
            step_id: args.step_id,
            old_notes: step.notes.clone(),
            new_notes: args.notes,
        }))
    }

    fn forward(
        payload: &mut ChangeStepNotesPayload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        let step = doc
            .step_mut(payload.step_id)
            .ok_or_else(|| missing_step(payload.step_id))?;
        step.notes = payload.new_notes.clone();
        Ok(ApplyOutcome::none().touching_step(payload.step_id))
    }

    fn backward(
        payload: &mut ChangeStepNotesPayload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        let step = doc
            .step_mut(payload.step_id)
            .ok_or_else(|| missing_step(payload.step_id))?;
        step.notes = payload.old_notes.clone();
        Ok(ApplyOutcome::none().touching_step(payload.step_id))
    }

    fn describe(_payload: &ChangeStepNotesPayload) -> String {
        "Changed step notes".to_string()
    }

    fn referenced_children(payload: &ChangeStepNotesPayload) -> Vec<ChildRef> {
        vec![ChildRef::Step(payload.step_id)]
    }
}
