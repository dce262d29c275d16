// Copyright 2025 Cowboy AI, LLC.

//! The collaboratively edited document: a workflow, its tabs and their steps
//!
//! Commands never touch storage directly. They receive a [`WorkflowDocument`]
//! staged by the engine, mutate it in memory, and the engine commits the
//! result together with the history head in one write.

use crate::errors::{DeltaError, DeltaResult};
use crate::identifiers::{DeltaId, StepId, TabId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Root entity of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier
    pub id: WorkflowId,
    /// Display name
    pub name: String,
    /// Whether anyone can view the workflow
    pub public: bool,
    /// Head of the history chain; `None` before the first command
    pub last_delta: Option<DeltaId>,
    /// When the workflow was created
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Create a workflow with an empty history
    pub fn new(name: impl Into<String>, public: bool) -> Self {
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            public,
            last_delta: None,
            created_at: Utc::now(),
        }
    }
}

/// A tab inside a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tab {
    /// Unique identifier
    pub id: TabId,
    /// Client-chosen handle, unique among live tabs of the workflow
    pub slug: String,
    /// Display name
    pub name: String,
    /// Order among the workflow's live tabs
    pub position: usize,
    /// Soft-delete flag; deleted tabs survive while history refers to them
    pub is_deleted: bool,
}

/// Render state of a step's cached output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    /// A render is pending
    Busy,
    /// Cached output is current
    Ok,
    /// The last render failed
    Error,
}

/// A module instance placed in a tab
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier
    pub id: StepId,
    /// Owning tab
    pub tab_id: TabId,
    /// Module implementation this step runs
    pub module_id_name: String,
    /// Order among the tab's live steps
    pub position: usize,
    /// Parameter values, always a JSON object
    pub params: Map<String, Value>,
    /// Free-form user notes
    pub notes: String,
    /// Delta a render of this step must have reached to be current
    pub last_relevant_delta_id: Option<DeltaId>,
    /// Render state of the cached output
    pub output_status: OutputStatus,
    /// Soft-delete flag
    pub is_deleted: bool,
}

impl Step {
    /// Create a live step with no render history
    pub fn new(
        tab_id: TabId,
        module_id_name: impl Into<String>,
        position: usize,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            id: StepId::new(),
            tab_id,
            module_id_name: module_id_name.into(),
            position,
            params,
            notes: String::new(),
            last_relevant_delta_id: None,
            output_status: OutputStatus::Ok,
            is_deleted: false,
        }
    }
}

/// A workflow with all of its tabs and steps, live and soft-deleted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    /// The workflow row
    pub workflow: Workflow,
    /// Every tab, including soft-deleted ones
    pub tabs: Vec<Tab>,
    /// Every step, including soft-deleted ones
    pub steps: Vec<Step>,
}

impl WorkflowDocument {
    /// A fresh document with a single tab named "Tab 1"
    pub fn new(name: impl Into<String>, public: bool) -> Self {
        Self {
            workflow: Workflow::new(name, public),
            tabs: vec![Tab {
                id: TabId::new(),
                slug: "tab-1".to_string(),
                name: "Tab 1".to_string(),
                position: 0,
                is_deleted: false,
            }],
            steps: Vec::new(),
        }
    }

    /// Workflow identifier
    pub fn id(&self) -> WorkflowId {
        self.workflow.id
    }

    /// Look up a tab, live or deleted
    pub fn tab(&self, id: TabId) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.id == id)
    }

    /// Mutable tab lookup, live or deleted
    pub fn tab_mut(&mut self, id: TabId) -> Option<&mut Tab> {
        self.tabs.iter_mut().find(|t| t.id == id)
    }

    /// A live tab, or `NotFound`
    pub fn live_tab(&self, id: TabId) -> DeltaResult<&Tab> {
        self.tab(id)
            .filter(|t| !t.is_deleted)
            .ok_or_else(|| DeltaError::not_found("Tab", id))
    }

    /// Look up a step, live or deleted
    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Mutable step lookup, live or deleted
    pub fn step_mut(&mut self, id: StepId) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// A live step in a live tab, or `NotFound`
    pub fn live_step(&self, id: StepId) -> DeltaResult<&Step> {
        let step = self
            .step(id)
            .filter(|s| !s.is_deleted)
            .ok_or_else(|| DeltaError::not_found("Step", id))?;
        self.live_tab(step.tab_id)?;
        Ok(step)
    }

    /// Live tabs ordered by position
    pub fn live_tabs(&self) -> Vec<&Tab> {
        let mut tabs: Vec<&Tab> = self.tabs.iter().filter(|t| !t.is_deleted).collect();
        tabs.sort_by_key(|t| t.position);
        tabs
    }

    /// Live steps of a tab ordered by position
    pub fn live_steps(&self, tab_id: TabId) -> Vec<&Step> {
        let mut steps: Vec<&Step> = self
            .steps
            .iter()
            .filter(|s| s.tab_id == tab_id && !s.is_deleted)
            .collect();
        steps.sort_by_key(|s| s.position);
        steps
    }

    /// IDs of the live steps of a tab, in order
    pub fn live_step_ids(&self, tab_id: TabId) -> Vec<StepId> {
        self.live_steps(tab_id).into_iter().map(|s| s.id).collect()
    }

    /// Whether a step is hidden from the document, directly or via its tab
    pub fn is_step_removed(&self, id: StepId) -> bool {
        match self.step(id) {
            Some(step) => step.is_deleted || self.tab(step.tab_id).map_or(true, |t| t.is_deleted),
            None => true,
        }
    }

    /// Rewrite positions of a tab's live steps to match `order`
    pub(crate) fn set_step_order(&mut self, order: &[StepId]) {
        for (position, id) in order.iter().enumerate() {
            if let Some(step) = self.step_mut(*id) {
                step.position = position;
            }
        }
    }

    /// Rewrite positions of live tabs to match `order`
    pub(crate) fn set_tab_order(&mut self, order: &[TabId]) {
        for (position, id) in order.iter().enumerate() {
            if let Some(tab) = self.tab_mut(*id) {
                tab.position = position;
            }
        }
    }

    /// Mark steps as needing a render up to `delta_id`
    ///
    /// Returns each step's previous version so the caller can restore it.
    pub(crate) fn invalidate_steps(
        &mut self,
        ids: &[StepId],
        delta_id: DeltaId,
    ) -> Vec<(StepId, Option<DeltaId>)> {
        let mut previous = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(step) = self.step_mut(*id) {
                previous.push((*id, step.last_relevant_delta_id));
                step.last_relevant_delta_id = Some(delta_id);
                step.output_status = OutputStatus::Busy;
            }
        }
        previous
    }

    /// Restore versions recorded by [`invalidate_steps`](Self::invalidate_steps)
    pub(crate) fn restore_step_versions(&mut self, previous: &[(StepId, Option<DeltaId>)]) {
        for (id, version) in previous {
            if let Some(step) = self.step_mut(*id) {
                step.last_relevant_delta_id = *version;
                step.output_status = OutputStatus::Busy;
            }
        }
    }
}
