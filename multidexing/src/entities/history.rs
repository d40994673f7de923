use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::{Entity, EntityKey, EntityMutation};
use crate::{ChainId, Event};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum HistoryAction {
    #[display("set")]
    Set,
    #[display("delete")]
    Delete,
}

impl FromStr for HistoryAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "set" => Ok(HistoryAction::Set),
            "delete" => Ok(HistoryAction::Delete),
            other => Err(format!("unknown history action {other}")),
        }
    }
}

/// Positional identity of a history record: the event that produced it.
/// Back-references between records are stored as this tuple and resolved by lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("({chain_id}, {block_number}, {block_timestamp}, {log_index})")]
pub struct HistoryIdentity {
    pub chain_id: ChainId,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub log_index: u64,
}

impl HistoryIdentity {
    /// Sentinel referenced by the first record of every entity
    pub fn genesis() -> Self {
        Self {
            chain_id: 0,
            block_number: 0,
            block_timestamp: 0,
            log_index: 0,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.chain_id == 0
    }

    pub fn of(event: &Event) -> Self {
        Self {
            chain_id: event.chain_id,
            block_number: event.block_number,
            block_timestamp: event.block_timestamp,
            log_index: event.log_index,
        }
    }
}

/// A history record before storage assigns its serial
#[derive(Clone, Debug, PartialEq)]
pub struct UnsavedHistoryRecord {
    pub entity_kind: String,
    pub entity_id: String,
    pub action: HistoryAction,
    /// Entity fields after the change, `None` for deletes
    pub snapshot: Option<serde_json::Value>,
    pub identity: HistoryIdentity,
    pub previous: HistoryIdentity,
}

impl UnsavedHistoryRecord {
    pub fn new(
        mutation: &EntityMutation,
        identity: HistoryIdentity,
        previous: HistoryIdentity,
    ) -> Self {
        let key = mutation.key();
        let (action, snapshot) = match mutation {
            EntityMutation::Set(entity) => (HistoryAction::Set, Some(entity.fields.clone())),
            EntityMutation::Delete(_key) => (HistoryAction::Delete, None),
        };

        Self {
            entity_kind: key.kind,
            entity_id: key.id,
            action,
            snapshot,
            identity,
            previous,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_kind, &self.entity_id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntityHistoryRecord {
    /// Global append order, assigned by storage
    pub serial: u64,
    pub entity_kind: String,
    pub entity_id: String,
    pub action: HistoryAction,
    pub snapshot: Option<serde_json::Value>,
    pub identity: HistoryIdentity,
    pub previous: HistoryIdentity,
}

impl EntityHistoryRecord {
    pub fn from_unsaved(serial: u64, record: &UnsavedHistoryRecord) -> Self {
        Self {
            serial,
            entity_kind: record.entity_kind.clone(),
            entity_id: record.entity_id.clone(),
            action: record.action,
            snapshot: record.snapshot.clone(),
            identity: record.identity,
            previous: record.previous,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_kind, &self.entity_id)
    }

    /// The entity state this record leaves behind
    pub fn to_mutation(&self) -> EntityMutation {
        match (&self.action, &self.snapshot) {
            (HistoryAction::Set, Some(fields)) => EntityMutation::Set(Entity {
                kind: self.entity_kind.clone(),
                id: self.entity_id.clone(),
                fields: fields.clone(),
            }),
            _ => EntityMutation::Delete(self.key()),
        }
    }
}
