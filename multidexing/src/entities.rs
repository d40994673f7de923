mod entity;
mod history;

pub use entity::{Entity, EntityKey, EntityMutation, EntityRecord};
pub use history::{EntityHistoryRecord, HistoryAction, HistoryIdentity, UnsavedHistoryRecord};
