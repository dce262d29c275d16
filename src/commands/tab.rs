// Copyright 2025 Cowboy AI, LLC.

//! Commands editing tabs

use super::{ApplyContext, ApplyOutcome, ChildRef, Command};
use crate::delta::OwnedTable;
use crate::document::{Tab, WorkflowDocument};
use crate::errors::{DeltaError, DeltaResult};
use crate::identifiers::TabId;
use serde::{Deserialize, Serialize};

fn live_tab_ids(doc: &WorkflowDocument) -> Vec<TabId> {
    doc.live_tabs().into_iter().map(|t| t.id).collect()
}

fn missing_tab(id: TabId) -> DeltaError {
    DeltaError::not_found("Tab", id)
}

/// Arguments to [`AddTab`]
#[derive(Debug, Clone)]
pub struct AddTabArgs {
    /// Slug, unique among live tabs
    pub slug: String,
    /// Display name
    pub name: String,
}

/// Payload of [`AddTab`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTabPayload {
    tab_id: TabId,
    slug: String,
    name: String,
}

/// Append a tab to the workflow
pub struct AddTab;

impl Command for AddTab {
    const KIND: &'static str = "AddTab";
    const PAYLOAD_TABLE: OwnedTable = OwnedTable::new("add_tab_deltas");
    type Args = AddTabArgs;
    type Payload = AddTabPayload;

    fn amend(args: AddTabArgs, doc: &WorkflowDocument) -> DeltaResult<Option<AddTabPayload>> {
        if args.slug.trim().is_empty() {
            return Err(DeltaError::validation("tab slug must not be empty"));
        }
        if doc.live_tabs().iter().any(|t| t.slug == args.slug) {
            return Err(DeltaError::validation(format!(
                "tab slug {} is already in use",
                args.slug
            )));
        }
        Ok(Some(AddTabPayload {
            tab_id: TabId::new(),
            slug: args.slug,
            name: args.name,
        }))
    }

    fn forward(
        payload: &mut AddTabPayload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        let mut order = live_tab_ids(doc);
        match doc.tab_mut(payload.tab_id) {
            Some(tab) => tab.is_deleted = false,
            None => doc.tabs.push(Tab {
                id: payload.tab_id,
                slug: payload.slug.clone(),
                name: payload.name.clone(),
                position: order.len(),
                is_deleted: false,
            }),
        }
        order.push(payload.tab_id);
        doc.set_tab_order(&order);
        Ok(ApplyOutcome::none().touching_tab(payload.tab_id))
    }

    fn backward(
        payload: &mut AddTabPayload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        let tab = doc
            .tab_mut(payload.tab_id)
            .ok_or_else(|| missing_tab(payload.tab_id))?;
        tab.is_deleted = true;
        let order = live_tab_ids(doc);
        doc.set_tab_order(&order);
        Ok(ApplyOutcome::none().touching_tab(payload.tab_id))
    }

    fn describe(payload: &AddTabPayload) -> String {
        format!("Added tab {}", payload.name)
    }

    fn referenced_children(payload: &AddTabPayload) -> Vec<ChildRef> {
        vec![ChildRef::Tab(payload.tab_id)]
    }
}

/// Arguments to [`SetTabName`]
#[derive(Debug, Clone)]
pub struct SetTabNameArgs {
    /// Tab to rename
    pub tab_id: TabId,
    /// New display name
    pub name: String,
}

/// Payload of [`SetTabName`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetTabNamePayload {
    tab_id: TabId,
    old_name: String,
    new_name: String,
}

/// Rename a tab
pub struct SetTabName;

impl Command for SetTabName {
    const KIND: &'static str = "SetTabName";
    const PAYLOAD_TABLE: OwnedTable = OwnedTable::new("set_tab_name_deltas");
    type Args = SetTabNameArgs;
    type Payload = SetTabNamePayload;

    fn amend(
        args: SetTabNameArgs,
        doc: &WorkflowDocument,
    ) -> DeltaResult<Option<SetTabNamePayload>> {
        let tab = doc.live_tab(args.tab_id)?;
        if tab.name == args.name {
            return Ok(None);
        }
        Ok(Some(SetTabNamePayload {
            tab_id: tab.id,
            old_name: tab.name.clone(),
            new_name: args.name,
        }))
    }

    fn forward(
        payload: &mut SetTabNamePayload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        let tab = doc
            .tab_mut(payload.tab_id)
            .ok_or_else(|| missing_tab(payload.tab_id))?;
        tab.name = payload.new_name.clone();
        Ok(ApplyOutcome::none().touching_tab(payload.tab_id))
    }

    fn backward(
        payload: &mut SetTabNamePayload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        let tab = doc
            .tab_mut(payload.tab_id)
            .ok_or_else(|| missing_tab(payload.tab_id))?;
        tab.name = payload.old_name.clone();
        Ok(ApplyOutcome::none().touching_tab(payload.tab_id))
    }

    fn describe(payload: &SetTabNamePayload) -> String {
        format!(
            "Renamed tab {} to {}",
            payload.old_name, payload.new_name
        )
    }

    fn referenced_children(payload: &SetTabNamePayload) -> Vec<ChildRef> {
        vec![ChildRef::Tab(payload.tab_id)]
    }
}

/// Payload of [`DeleteTab`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteTabPayload {
    tab_id: TabId,
    /// Live tab order before the delete, refreshed on every forward
    #[serde(default)]
    prior_order: Vec<TabId>,
}

/// Soft-delete a tab
pub struct DeleteTab;

impl Command for DeleteTab {
    const KIND: &'static str = "DeleteTab";
    const PAYLOAD_TABLE: OwnedTable = OwnedTable::new("delete_tab_deltas");
    type Args = TabId;
    type Payload = DeleteTabPayload;

    fn amend(tab_id: TabId, doc: &WorkflowDocument) -> DeltaResult<Option<DeleteTabPayload>> {
        doc.live_tab(tab_id)?;
        if doc.live_tabs().len() == 1 {
            return Err(DeltaError::validation("cannot delete the only tab"));
        }
        Ok(Some(DeleteTabPayload {
            tab_id,
            prior_order: Vec::new(),
        }))
    }

    fn forward(
        payload: &mut DeleteTabPayload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        payload.prior_order = live_tab_ids(doc);
        let tab = doc
            .tab_mut(payload.tab_id)
            .ok_or_else(|| missing_tab(payload.tab_id))?;
        tab.is_deleted = true;
        let order = live_tab_ids(doc);
        doc.set_tab_order(&order);
        Ok(ApplyOutcome::none().touching_tab(payload.tab_id))
    }

    fn backward(
        payload: &mut DeleteTabPayload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        let tab = doc
            .tab_mut(payload.tab_id)
            .ok_or_else(|| missing_tab(payload.tab_id))?;
        tab.is_deleted = false;
        doc.set_tab_order(&payload.prior_order);
        Ok(ApplyOutcome::none().touching_tab(payload.tab_id))
    }

    fn describe(_payload: &DeleteTabPayload) -> String {
        "Deleted tab".to_string()
    }

    fn referenced_children(payload: &DeleteTabPayload) -> Vec<ChildRef> {
        vec![ChildRef::Tab(payload.tab_id)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::DeltaId;

    fn ctx(doc: &WorkflowDocument) -> ApplyContext {
        ApplyContext {
            workflow_id: doc.id(),
            delta_id: DeltaId::new(1),
        }
    }

    fn add_tab(doc: &mut WorkflowDocument, slug: &str) -> AddTabPayload {
        let c = ctx(doc);
        let mut payload = AddTab::amend(
            AddTabArgs {
                slug: slug.to_string(),
                name: slug.to_uppercase(),
            },
            doc,
        )
        .unwrap()
        .unwrap();
        AddTab::forward(&mut payload, doc, &c).unwrap();
        payload
    }

    #[test]
    fn test_add_tab_rejects_duplicate_slug() {
        let doc = WorkflowDocument::new("w", false);
        let err = AddTab::amend(
            AddTabArgs {
                slug: "tab-1".into(),
                name: "again".into(),
            },
            &doc,
        )
        .unwrap_err();
        assert!(err.is_validation_error());
    }

    #[test]
    fn test_add_tab_undo_soft_deletes_and_redo_revives() {
        let mut doc = WorkflowDocument::new("w", false);
        let c = ctx(&doc);
        let mut payload = add_tab(&mut doc, "tab-2");
        assert_eq!(doc.live_tabs().len(), 2);
        assert_eq!(doc.live_tabs()[1].id, payload.tab_id);

        AddTab::backward(&mut payload, &mut doc, &c).unwrap();
        assert_eq!(doc.live_tabs().len(), 1);
        assert!(doc.tab(payload.tab_id).unwrap().is_deleted);

        AddTab::forward(&mut payload, &mut doc, &c).unwrap();
        assert_eq!(doc.tabs.len(), 2);
        assert!(!doc.tab(payload.tab_id).unwrap().is_deleted);
    }

    #[test]
    fn test_set_tab_name_missing_tab() {
        let doc = WorkflowDocument::new("w", false);
        let err = SetTabName::amend(
            SetTabNameArgs {
                tab_id: TabId::new(),
                name: "x".into(),
            },
            &doc,
        )
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_set_tab_name_same_name_aborts() {
        let doc = WorkflowDocument::new("w", false);
        let args = SetTabNameArgs {
            tab_id: doc.tabs[0].id,
            name: "Tab 1".into(),
        };
        assert!(SetTabName::amend(args, &doc).unwrap().is_none());
    }

    #[test]
    fn test_delete_tab_restores_order_on_undo() {
        let mut doc = WorkflowDocument::new("w", false);
        let c = ctx(&doc);
        let first = doc.tabs[0].id;
        let second = add_tab(&mut doc, "tab-2").tab_id;
        let third = add_tab(&mut doc, "tab-3").tab_id;

        let mut payload = DeleteTab::amend(second, &doc).unwrap().unwrap();
        DeleteTab::forward(&mut payload, &mut doc, &c).unwrap();
        assert_eq!(live_tab_ids(&doc), vec![first, third]);
        assert_eq!(doc.tab(third).unwrap().position, 1);

        DeleteTab::backward(&mut payload, &mut doc, &c).unwrap();
        assert_eq!(live_tab_ids(&doc), vec![first, second, third]);
    }

    #[test]
    fn test_cannot_delete_only_tab() {
        let doc = WorkflowDocument::new("w", false);
        let err = DeleteTab::amend(doc.tabs[0].id, &doc).unwrap_err();
        assert!(err.is_validation_error());
    }
}
