//! Operation vocabularies.
//!
//! Three related but distinct sets of names are used by the engine:
//! the top-level CRUD contract, the policy operations guards are keyed
//! by, and the nested-write actions a mutation payload can contain.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A top-level operation of the CRUD contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CrudAction {
    FindUnique,
    FindUniqueOrThrow,
    FindFirst,
    FindFirstOrThrow,
    FindMany,
    Create,
    CreateMany,
    CreateManyAndReturn,
    Update,
    UpdateMany,
    Upsert,
    Delete,
    DeleteMany,
    Aggregate,
    GroupBy,
    Count,
}

impl CrudAction {
    /// Get the wire name of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FindUnique => "findUnique",
            Self::FindUniqueOrThrow => "findUniqueOrThrow",
            Self::FindFirst => "findFirst",
            Self::FindFirstOrThrow => "findFirstOrThrow",
            Self::FindMany => "findMany",
            Self::Create => "create",
            Self::CreateMany => "createMany",
            Self::CreateManyAndReturn => "createManyAndReturn",
            Self::Update => "update",
            Self::UpdateMany => "updateMany",
            Self::Upsert => "upsert",
            Self::Delete => "delete",
            Self::DeleteMany => "deleteMany",
            Self::Aggregate => "aggregate",
            Self::GroupBy => "groupBy",
            Self::Count => "count",
        }
    }

    /// Whether this action never mutates data.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Self::FindUnique
                | Self::FindUniqueOrThrow
                | Self::FindFirst
                | Self::FindFirstOrThrow
                | Self::FindMany
                | Self::Aggregate
                | Self::GroupBy
                | Self::Count
        )
    }
}

impl fmt::Display for CrudAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation that access-policy guards are defined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyOperation {
    Create,
    Read,
    Update,
    PostUpdate,
    Delete,
}

impl PolicyOperation {
    /// Get the name of this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::PostUpdate => "postUpdate",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for PolicyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation that can appear inside a nested mutation payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NestedWriteAction {
    Create,
    CreateMany,
    Connect,
    ConnectOrCreate,
    Disconnect,
    Set,
    Update,
    UpdateMany,
    Upsert,
    Delete,
    DeleteMany,
}

impl NestedWriteAction {
    /// All nested-write actions, in payload processing order.
    pub const ALL: [NestedWriteAction; 11] = [
        Self::Create,
        Self::CreateMany,
        Self::Connect,
        Self::ConnectOrCreate,
        Self::Disconnect,
        Self::Set,
        Self::Update,
        Self::UpdateMany,
        Self::Upsert,
        Self::Delete,
        Self::DeleteMany,
    ];

    /// The payload key this action is written under.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::CreateMany => "createMany",
            Self::Connect => "connect",
            Self::ConnectOrCreate => "connectOrCreate",
            Self::Disconnect => "disconnect",
            Self::Set => "set",
            Self::Update => "update",
            Self::UpdateMany => "updateMany",
            Self::Upsert => "upsert",
            Self::Delete => "delete",
            Self::DeleteMany => "deleteMany",
        }
    }

    /// Parse a payload key.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.as_str() == key)
    }
}

impl fmt::Display for NestedWriteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_action_keys() {
        for action in NestedWriteAction::ALL {
            assert_eq!(NestedWriteAction::from_key(action.as_str()), Some(action));
        }
        assert_eq!(NestedWriteAction::from_key("where"), None);
    }

    #[test]
    fn test_serde_names() {
        let op: PolicyOperation = serde_json::from_str("\"postUpdate\"").unwrap();
        assert_eq!(op, PolicyOperation::PostUpdate);
        assert_eq!(
            serde_json::to_string(&CrudAction::CreateManyAndReturn).unwrap(),
            "\"createManyAndReturn\""
        );
        assert!(CrudAction::GroupBy.is_read());
        assert!(!CrudAction::Upsert.is_read());
    }
}
