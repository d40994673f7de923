use std::collections::BTreeMap;

use super::loader_context::LoadedEntities;
use super::HandlerError;
use crate::{Entity, EntityKey, EntityMutation, EntityRecord, Event, EventParams};

/// A dynamic contract address requested by a handler, validated by the registry after `handle`
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RequestedRegistration {
    pub contract_name: String,
    pub address: String,
}

/// Mutable view handed to `Handler::handle`.
///
/// Reads resolve against this event's own writes, then writes of earlier events in the unit,
/// then loaded values.
pub struct HandlerContext<'a> {
    event: &'a Event,
    loaded: &'a LoadedEntities,
    overlay: &'a BTreeMap<EntityKey, EntityMutation>,
    mutations: Vec<EntityMutation>,
    registrations: Vec<RequestedRegistration>,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        event: &'a Event,
        loaded: &'a LoadedEntities,
        overlay: &'a BTreeMap<EntityKey, EntityMutation>,
    ) -> Self {
        Self {
            event,
            loaded,
            overlay,
            mutations: vec![],
            registrations: vec![],
        }
    }

    pub fn event(&self) -> &'a Event {
        self.event
    }

    pub fn get_event_params(&self) -> EventParams<'a> {
        self.event.get_params()
    }

    pub fn get<T: EntityRecord>(&self, id: &str) -> Result<Option<T>, HandlerError> {
        let key = EntityKey::new(T::kind(), id);

        let current = if let Some(mutation) = self.own_mutation(&key) {
            mutation.entity()
        } else if let Some(mutation) = self.overlay.get(&key) {
            mutation.entity()
        } else if let Some(loaded) = self.loaded.get(&key) {
            loaded.as_ref()
        } else {
            return Err(HandlerError::NotLoaded {
                kind: key.kind,
                id: key.id,
            });
        };

        current.map(|entity| entity.to_record()).transpose()
    }

    pub fn set<T: EntityRecord>(&mut self, record: &T) -> Result<(), HandlerError> {
        let entity = Entity::from_record(record)?;
        self.push(EntityMutation::Set(entity));

        Ok(())
    }

    pub fn delete<T: EntityRecord>(&mut self, id: &str) {
        self.push(EntityMutation::Delete(EntityKey::new(T::kind(), id)));
    }

    /// Starts indexing `address` as `contract_name` on this event's chain,
    /// from this event onwards
    pub fn register_contract(&mut self, contract_name: &str, address: &str) {
        let registration = RequestedRegistration {
            contract_name: contract_name.to_string(),
            address: address.to_lowercase(),
        };

        if !self.registrations.contains(&registration) {
            self.registrations.push(registration);
        }
    }

    pub(crate) fn into_parts(self) -> (Vec<EntityMutation>, Vec<RequestedRegistration>) {
        (self.mutations, self.registrations)
    }

    fn own_mutation(&self, key: &EntityKey) -> Option<&EntityMutation> {
        self.mutations.iter().find(|mutation| &mutation.key() == key)
    }

    // Repeated writes to one entity collapse into the last one
    fn push(&mut self, mutation: EntityMutation) {
        let key = mutation.key();

        match self.mutations.iter_mut().find(|existing| existing.key() == key) {
            Some(existing) => *existing = mutation,
            None => self.mutations.push(mutation),
        }
    }
}
