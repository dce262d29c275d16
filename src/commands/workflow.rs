// Copyright 2025 Cowboy AI, LLC.

//! Commands editing workflow-level fields

use super::{ApplyContext, ApplyOutcome, Command};
use crate::delta::OwnedTable;
use crate::document::WorkflowDocument;
use crate::errors::DeltaResult;
use serde::{Deserialize, Serialize};

/// Old and new value of a single field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueChange<T> {
    /// Value before the command
    pub old_value: T,
    /// Value after the command
    pub new_value: T,
}

/// Rename the workflow
pub struct ChangeWorkflowTitle;

impl Command for ChangeWorkflowTitle {
    const KIND: &'static str = "ChangeWorkflowTitle";
    const PAYLOAD_TABLE: OwnedTable = OwnedTable::new("change_workflow_title_deltas");
    type Args = String;
    type Payload = ValueChange<String>;

    fn amend(new_value: String, doc: &WorkflowDocument) -> DeltaResult<Option<Self::Payload>> {
        if doc.workflow.name == new_value {
            return Ok(None);
        }
        Ok(Some(ValueChange {
            old_value: doc.workflow.name.clone(),
            new_value,
        }))
    }

    fn forward(
        payload: &mut Self::Payload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        doc.workflow.name = payload.new_value.clone();
        Ok(ApplyOutcome::none())
    }

    fn backward(
        payload: &mut Self::Payload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        doc.workflow.name = payload.old_value.clone();
        Ok(ApplyOutcome::none())
    }

    fn describe(payload: &Self::Payload) -> String {
        format!(
            "Changed workflow name from {} to {}",
            payload.old_value, payload.new_value
        )
    }
}

/// Make the workflow public or private
pub struct SetWorkflowPublic;

impl Command for SetWorkflowPublic {
    const KIND: &'static str = "SetWorkflowPublic";
    const PAYLOAD_TABLE: OwnedTable = OwnedTable::new("set_workflow_public_deltas");
    type Args = bool;
    type Payload = ValueChange<bool>;

    fn amend(new_value: bool, doc: &WorkflowDocument) -> DeltaResult<Option<Self::Payload>> {
        Ok((doc.workflow.public != new_value).then(|| ValueChange {
            old_value: doc.workflow.public,
            new_value,
        }))
    }

    fn forward(
        payload: &mut Self::Payload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        doc.workflow.public = payload.new_value;
        Ok(ApplyOutcome::none())
    }

    fn backward(
        payload: &mut Self::Payload,
        doc: &mut WorkflowDocument,
        _ctx: &ApplyContext,
    ) -> DeltaResult<ApplyOutcome> {
        doc.workflow.public = payload.old_value;
        Ok(ApplyOutcome::none())
    }

    fn describe(payload: &Self::Payload) -> String {
        if payload.new_value {
            "Made workflow public".to_string()
        } else {
            "Made workflow private".to_string()
        }
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

    #[test]
    fn test_rename_to_same_title_aborts() {
        let doc = WorkflowDocument::new("title1", false);
        assert!(ChangeWorkflowTitle::amend("title1".into(), &doc)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_rename_forward_and_backward() {
        let mut doc = WorkflowDocument::new("title1", false);
        let c = ctx(&doc);
        let mut payload = ChangeWorkflowTitle::amend("title2".into(), &doc)
            .unwrap()
            .unwrap();

        ChangeWorkflowTitle::forward(&mut payload, &mut doc, &c).unwrap();
        assert_eq!(doc.workflow.name, "title2");
        ChangeWorkflowTitle::backward(&mut payload, &mut doc, &c).unwrap();
        assert_eq!(doc.workflow.name, "title1");
        assert_eq!(
            ChangeWorkflowTitle::describe(&payload),
            "Changed workflow name from title1 to title2"
        );
    }

    #[test]
    fn test_set_public_toggles() {
        let mut doc = WorkflowDocument::new("w", false);
        let c = ctx(&doc);
        assert!(SetWorkflowPublic::amend(false, &doc).unwrap().is_none());

        let mut payload = SetWorkflowPublic::amend(true, &doc).unwrap().unwrap();
        let outcome = SetWorkflowPublic::forward(&mut payload, &mut doc, &c).unwrap();
        assert!(doc.workflow.public);
        assert!(!outcome.needs_recompute());
        SetWorkflowPublic::backward(&mut payload, &mut doc, &c).unwrap();
        assert!(!doc.workflow.public);
    }
}
