// Copyright 2025 Cowboy AI, LLC.

//! Identifier types for workflows, their children and their history

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from a UUID
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Get the underlying UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_identifier!(
    /// Workflow ID - the document being edited
    WorkflowId
);

uuid_identifier!(
    /// Tab ID - only meaningful within a workflow
    TabId
);

uuid_identifier!(
    /// Step ID - a module instance placed in a tab
    StepId
);

/// Delta ID - position of a command in the global history sequence
///
/// Delta IDs are handed out by the store strictly in append order and are
/// never reused. Within one workflow a higher ID therefore always means a
/// later link in the chain, which lets truncation select "this delta and
/// everything after it" with a single range predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaId(u64);

impl DeltaId {
    /// Wrap a raw sequence number
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw sequence number
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeltaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<DeltaId> for u64 {
    fn from(id: DeltaId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_identifiers_are_unique() {
        let a = WorkflowId::new();
        let b = WorkflowId::new();
        assert_ne!(a, b);
        assert!(!a.as_uuid().is_nil());

        let uuid = Uuid::new_v4();
        assert_eq!(StepId::from_uuid(uuid).to_string(), uuid.to_string());
        assert_eq!(Uuid::from(TabId::from_uuid(uuid)), uuid);
    }

    #[test]
    fn test_delta_id_orders_by_sequence() {
        let first = DeltaId::new(4);
        let second = DeltaId::new(5);
        assert!(first < second);
        assert_eq!(second.get(), 5);
        assert_eq!(u64::from(first), 4);
        assert_eq!(first.to_string(), "4");
    }

    #[test]
    fn test_identifiers_serialize_transparently() {
        let id = DeltaId::new(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");

        let uuid = Uuid::new_v4();
        let tab = TabId::from_uuid(uuid);
        assert_eq!(serde_json::to_string(&tab).unwrap(), format!("\"{uuid}\""));
        let back: TabId = serde_json::from_str(&format!("\"{uuid}\"")).unwrap();
        assert_eq!(back, tab);
    }
}
