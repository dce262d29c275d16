// Copyright 2025 Cowboy AI, LLC.

//! Client notifications describing what a history move changed
//!
//! A notification is computed from committed state after the workflow lock
//! is released. It carries only the entities a command touched; clients
//! refetch anything else.

use crate::commands::ApplyOutcome;
use crate::delta::Delta;
use crate::document::{OutputStatus, Step, Tab, WorkflowDocument};
use crate::identifiers::{DeltaId, StepId, TabId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Workflow fields every notification refreshes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowUpdate {
    /// Display name
    pub name: String,
    /// Visibility
    pub public: bool,
    /// Time of the head delta, or workflow creation when there is none
    pub last_update: DateTime<Utc>,
}

/// A step whose cached output was invalidated
///
/// Output fields are reset so clients show the step as rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepVersionUpdate {
    /// Delta the next render must reach
    pub last_relevant_delta_id: Option<DeltaId>,
    /// Always busy until the render lands
    pub output_status: OutputStatus,
    /// Cleared suggestions
    pub quick_fixes: Vec<Value>,
    /// Cleared column list
    pub output_columns: Vec<Value>,
    /// Cleared error text
    pub output_error: String,
    /// Cleared row count
    pub output_n_rows: u64,
}

impl StepVersionUpdate {
    fn busy(last_relevant_delta_id: Option<DeltaId>) -> Self {
        Self {
            last_relevant_delta_id,
            output_status: OutputStatus::Busy,
            quick_fixes: Vec::new(),
            output_columns: Vec::new(),
            output_error: String::new(),
            output_n_rows: 0,
        }
    }
}

/// A step the command edited directly, serialized whole
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    /// Step ID
    pub id: StepId,
    /// Owning tab
    pub tab_id: TabId,
    /// Module the step runs
    pub module_id_name: String,
    /// Order within the tab
    pub position: usize,
    /// Parameter values
    pub params: Map<String, Value>,
    /// User notes
    pub notes: String,
    /// Delta the next render must reach
    pub last_relevant_delta_id: Option<DeltaId>,
    /// Render state
    pub output_status: OutputStatus,
}

impl From<&Step> for StepView {
    fn from(step: &Step) -> Self {
        Self {
            id: step.id,
            tab_id: step.tab_id,
            module_id_name: step.module_id_name.clone(),
            position: step.position,
            params: step.params.clone(),
            notes: step.notes.clone(),
            last_relevant_delta_id: step.last_relevant_delta_id,
            output_status: step.output_status,
        }
    }
}

/// Entry of [`DeltaNotification::update_steps`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StepUpdate {
    /// Full step after a direct edit
    Full(StepView),
    /// Version bump after invalidation
    Version(StepVersionUpdate),
}

/// A tab the command edited directly
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabView {
    /// Tab ID
    pub id: TabId,
    /// Slug
    pub slug: String,
    /// Display name
    pub name: String,
    /// Order among live tabs
    pub position: usize,
    /// Live steps in order
    pub step_ids: Vec<StepId>,
}

/// What clients must refresh after a history move
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaNotification {
    /// Workflow the notification is about
    #[serde(skip)]
    pub workflow_id: WorkflowId,
    /// Refreshed workflow fields
    pub update_workflow: WorkflowUpdate,
    /// Changed steps keyed by ID
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub update_steps: BTreeMap<StepId, StepUpdate>,
    /// Steps that disappeared from the document
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub clear_step_ids: Vec<StepId>,
    /// Changed tabs keyed by ID
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub update_tabs: BTreeMap<TabId, TabView>,
    /// Tabs that disappeared from the document
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub clear_tab_ids: Vec<TabId>,
    #[serde(skip)]
    recompute: bool,
}

impl DeltaNotification {
    /// Build the notification for a committed history move
    ///
    /// `head` is the delta `doc.workflow.last_delta` points at, if any.
    pub fn build(doc: &WorkflowDocument, head: Option<&Delta>, outcome: &ApplyOutcome) -> Self {
        let mut notification = Self {
            workflow_id: doc.id(),
            update_workflow: WorkflowUpdate {
                name: doc.workflow.name.clone(),
                public: doc.workflow.public,
                last_update: head.map_or(doc.workflow.created_at, |d| d.datetime),
            },
            update_steps: BTreeMap::new(),
            clear_step_ids: Vec::new(),
            update_tabs: BTreeMap::new(),
            clear_tab_ids: Vec::new(),
            recompute: outcome
                .invalidated_steps
                .iter()
                .any(|id| !doc.is_step_removed(*id)),
        };

        for id in &outcome.invalidated_steps {
            notification.add_step(doc, *id, |step| {
                StepUpdate::Version(StepVersionUpdate::busy(step.last_relevant_delta_id))
            });
        }
        if let Some(id) = outcome.touched_step {
            notification.add_step(doc, id, |step| StepUpdate::Full(step.into()));
        }
        if let Some(id) = outcome.touched_tab {
            match doc.tab(id).filter(|t| !t.is_deleted) {
                Some(tab) => {
                    notification.update_tabs.insert(id, tab_view(doc, tab));
                }
                None => {
                    notification.clear_tab_ids.push(id);
                    let hidden: Vec<StepId> = doc
                        .steps
                        .iter()
                        .filter(|s| s.tab_id == id && !s.is_deleted)
                        .map(|s| s.id)
                        .collect();
                    for step_id in hidden {
                        notification.clear_step(step_id);
                    }
                }
            }
        }
        notification
    }

    fn add_step(
        &mut self,
        doc: &WorkflowDocument,
        id: StepId,
        update: impl FnOnce(&Step) -> StepUpdate,
    ) {
        match doc.step(id).filter(|_| !doc.is_step_removed(id)) {
            Some(step) => {
                self.update_steps.insert(id, update(step));
            }
            None => self.clear_step(id),
        }
    }

    fn clear_step(&mut self, id: StepId) {
        self.update_steps.remove(&id);
        if !self.clear_step_ids.contains(&id) {
            self.clear_step_ids.push(id);
        }
    }

    /// Whether a render must be scheduled: some live step was invalidated
    pub fn needs_recompute(&self) -> bool {
        self.recompute
    }

    /// JSON body sent to clients
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

fn tab_view(doc: &WorkflowDocument, tab: &Tab) -> TabView {
    TabView {
        id: tab.id,
        slug: tab.slug.clone(),
        name: tab.name.clone(),
        position: tab.position,
        step_ids: doc.live_step_ids(tab.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc_with_step() -> (WorkflowDocument, StepId) {
        let mut doc = WorkflowDocument::new("Budget", false);
        let step = Step::new(doc.tabs[0].id, "loadurl", 0, Map::new());
        let id = step.id;
        doc.steps.push(step);
        (doc, id)
    }

    #[test]
    fn test_workflow_only_change() {
        let (doc, _) = doc_with_step();
        let n = DeltaNotification::build(&doc, None, &ApplyOutcome::none());
        assert_eq!(n.update_workflow.last_update, doc.workflow.created_at);
        assert!(!n.needs_recompute());

        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(
            value,
            json!({
                "updateWorkflow": {
                    "name": "Budget",
                    "public": false,
                    "lastUpdate": doc.workflow.created_at,
                }
            })
        );
    }

    #[test]
    fn test_invalidated_step_gets_version_bump() {
        let (mut doc, id) = doc_with_step();
        doc.invalidate_steps(&[id], DeltaId::new(4));
        let n = DeltaNotification::build(&doc, None, &ApplyOutcome::none().invalidating([id]));
        assert!(n.needs_recompute());

        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(
            value["updateSteps"][id.to_string()],
            json!({
                "lastRelevantDeltaId": 4,
                "outputStatus": "busy",
                "quickFixes": [],
                "outputColumns": [],
                "outputError": "",
                "outputNRows": 0,
            })
        );
    }

    #[test]
    fn test_touched_step_is_serialized_whole() {
        let (mut doc, id) = doc_with_step();
        doc.step_mut(id).unwrap().notes = "check totals".into();
        doc.step_mut(id).unwrap().output_status = OutputStatus::Busy;
        let n = DeltaNotification::build(&doc, None, &ApplyOutcome::none().touching_step(id));
        assert!(!n.needs_recompute());
        match &n.update_steps[&id] {
            StepUpdate::Full(view) => assert_eq!(view.notes, "check totals"),
            other => panic!("expected full step, got {:?}", other),
        }
    }

    #[test]
    fn test_removed_step_is_cleared() {
        let (mut doc, id) = doc_with_step();
        doc.step_mut(id).unwrap().is_deleted = true;
        let outcome = ApplyOutcome::none().invalidating([id]).touching_step(id);
        let n = DeltaNotification::build(&doc, None, &outcome);
        assert!(n.update_steps.is_empty());
        assert_eq!(n.clear_step_ids, vec![id]);
        assert!(!n.needs_recompute());
    }

    #[test]
    fn test_tab_update_and_clear() {
        let (mut doc, step) = doc_with_step();
        let tab = doc.tabs[0].id;
        let n = DeltaNotification::build(&doc, None, &ApplyOutcome::none().touching_tab(tab));
        assert_eq!(n.update_tabs[&tab].step_ids, vec![step]);

        doc.tab_mut(tab).unwrap().is_deleted = true;
        let n = DeltaNotification::build(&doc, None, &ApplyOutcome::none().touching_tab(tab));
        assert!(n.update_tabs.is_empty());
        assert_eq!(n.clear_tab_ids, vec![tab]);
    }

    #[test]
    fn test_deleted_tab_clears_its_steps() {
        let (mut doc, live) = doc_with_step();
        let tab = doc.tabs[0].id;
        let mut removed = Step::new(tab, "filter", 1, Map::new());
        removed.is_deleted = true;
        let gone = removed.id;
        doc.steps.push(removed);
        doc.tab_mut(tab).unwrap().is_deleted = true;

        let n = DeltaNotification::build(&doc, None, &ApplyOutcome::none().touching_tab(tab));
        assert_eq!(n.clear_tab_ids, vec![tab]);
        assert_eq!(n.clear_step_ids, vec![live]);
        assert!(!n.clear_step_ids.contains(&gone));
        assert!(n.update_steps.is_empty());
    }

    #[test]
    fn test_last_update_follows_head() {
        let (doc, _) = doc_with_step();
        let head = Delta {
            id: DeltaId::new(2),
            workflow_id: doc.id(),
            prev_delta_id: None,
            datetime: doc.workflow.created_at + chrono::Duration::seconds(90),
            kind: "ChangeWorkflowTitle".into(),
            payload: json!({}),
        };
        let n = DeltaNotification::build(&doc, Some(&head), &ApplyOutcome::none());
        assert_eq!(n.update_workflow.last_update, head.datetime);
    }
}
