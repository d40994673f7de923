use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::HandlerError;

/// A user-defined record indexed from events.
///
/// Usually derived:
/// ```ignore
/// #[derive(Serialize, Deserialize, EntityRecord)]
/// #[entity(kind = "Account")]
/// struct Account {
///     id: String,
///     balance: u64,
/// }
/// ```
pub trait EntityRecord: Serialize + DeserializeOwned + Send + Sync {
    /// Name shared by every record of this type, e.g. `Account`
    fn kind() -> &'static str;
    fn id(&self) -> String;
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: &str, id: &str) -> Self {
        Self {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}

/// Stored form of an entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: String,
    pub id: String,
    pub fields: serde_json::Value,
}

impl Entity {
    pub fn from_record<T: EntityRecord>(record: &T) -> Result<Self, HandlerError> {
        Ok(Self {
            kind: T::kind().to_string(),
            id: record.id(),
            fields: serde_json::to_value(record)?,
        })
    }

    pub fn to_record<T: EntityRecord>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(self.fields.clone())?)
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.kind, &self.id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EntityMutation {
    Set(Entity),
    Delete(EntityKey),
}

impl EntityMutation {
    pub fn key(&self) -> EntityKey {
        match self {
            EntityMutation::Set(entity) => entity.key(),
            EntityMutation::Delete(key) => key.clone(),
        }
    }

    /// The entity's value after this mutation, `None` once deleted
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            EntityMutation::Set(entity) => Some(entity),
            EntityMutation::Delete(_key) => None,
        }
    }
}
