use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an entity (node or relationship) in the host store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub i64);

impl EntityId {
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a mutation becomes visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Isolation {
    /// Staged in the caller's transaction, visible to others after its commit.
    #[default]
    SameTx,
    /// Applied in a private transaction that commits before the call returns.
    OtherTxSync,
}

/// One index mutation, as issued by the host.
///
/// The three removal shapes are separate variants so a caller never has to
/// signal "whole key" through a combination of absent arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Add {
        entity: EntityId,
        key: String,
        value: String,
    },
    RemoveValue {
        entity: EntityId,
        key: String,
        value: String,
    },
    RemoveEntity {
        entity: EntityId,
        key: String,
    },
    DropKey {
        key: String,
    },
}

impl Mutation {
    pub fn key(&self) -> &str {
        match self {
            Mutation::Add { key, .. }
            | Mutation::RemoveValue { key, .. }
            | Mutation::RemoveEntity { key, .. }
            | Mutation::DropKey { key } => key,
        }
    }
}
