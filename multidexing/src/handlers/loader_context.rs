use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::HandlerError;
use crate::{Entity, EntityKey, EntityRecord, Event, EventParams, Repo, RepoError};

pub(crate) type LoadedEntities = HashMap<EntityKey, Option<Entity>>;

/// Read-through cache shared by the loaders of one unit
pub(crate) struct EntityCache {
    repo: Arc<dyn Repo>,
    entities: Mutex<LoadedEntities>,
}

impl EntityCache {
    pub fn new(repo: Arc<dyn Repo>) -> Self {
        Self {
            repo,
            entities: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load(&self, key: &EntityKey) -> Result<Option<Entity>, RepoError> {
        if let Some(cached) = self.entities.lock().await.get(key) {
            return Ok(cached.clone());
        }

        let entity = self.repo.read_entity(&key.kind, &key.id).await?;
        self.entities.lock().await.insert(key.clone(), entity.clone());

        Ok(entity)
    }

    pub fn into_loaded(self) -> LoadedEntities {
        self.entities.into_inner()
    }
}

/// Read-only view handed to `Handler::load`
pub struct LoaderContext<'a> {
    event: &'a Event,
    cache: &'a EntityCache,
}

impl<'a> LoaderContext<'a> {
    pub(crate) fn new(event: &'a Event, cache: &'a EntityCache) -> Self {
        Self { event, cache }
    }

    pub fn event(&self) -> &'a Event {
        self.event
    }

    pub fn get_event_params(&self) -> EventParams<'a> {
        self.event.get_params()
    }

    /// Loads the committed value of an entity and makes it readable from `handle`.
    /// Values written by earlier events of the same unit are not visible here.
    pub async fn load<T: EntityRecord>(&self, id: &str) -> Result<Option<T>, HandlerError> {
        let key = EntityKey::new(T::kind(), id);

        match self.cache.load(&key).await? {
            Some(entity) => Ok(Some(entity.to_record()?)),
            None => Ok(None),
        }
    }
}
