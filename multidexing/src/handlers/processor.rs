use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::{stream, StreamExt, TryStreamExt};
use thiserror::Error;

use super::handler_context::RequestedRegistration;
use super::loader_context::EntityCache;
use super::{Handler, HandlerContext, HandlerError, Handlers, LoaderContext};
use crate::contract_registry::{ContractRegistration, ContractRegistry, RegistrationOutcome};
use crate::{
    EntityKey, EntityMutation, Event, HistoryIdentity, Repo, RepoError, UnsavedHistoryRecord,
};

#[derive(Debug)]
pub(crate) struct ProcessedUnit {
    /// Number of leading events of the input that were handled.
    /// Less than the input's length when an event registered a contract.
    pub applied_count: usize,
    /// Final value of every touched entity
    pub entity_changes: Vec<EntityMutation>,
    pub history: Vec<UnsavedHistoryRecord>,
    pub registrations: Vec<ContractRegistration>,
}

#[derive(Debug, Error)]
pub(crate) enum ProcessingError {
    #[error("handler failed: {error}")]
    Handler { event: Box<Event>, error: HandlerError },
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl ProcessingError {
    fn handler(event: &Event, error: HandlerError) -> Self {
        ProcessingError::Handler {
            event: Box::new(event.clone()),
            error,
        }
    }
}

pub(crate) struct Processor {
    repo: Arc<dyn Repo>,
    handlers: Arc<Handlers>,
    loader_concurrency: usize,
}

impl Processor {
    pub fn new(repo: Arc<dyn Repo>, handlers: Arc<Handlers>, loader_concurrency: usize) -> Self {
        Self {
            repo,
            handlers,
            loader_concurrency: loader_concurrency.max(1),
        }
    }

    /// Runs loaders then handlers over `events`. Nothing is persisted and
    /// any error abandons the whole unit.
    pub async fn process(
        &self,
        events: &[Event],
        registry: &ContractRegistry,
    ) -> Result<ProcessedUnit, ProcessingError> {
        let cache = EntityCache::new(self.repo.clone());
        self.run_loaders(events, &cache).await?;
        let loaded = cache.into_loaded();

        let mut overlay = BTreeMap::new();
        let mut latest_identities = HashMap::new();
        let mut history = vec![];
        let mut unresolved_history = vec![];
        let mut registrations = vec![];
        let mut applied_count = 0;

        for event in events {
            applied_count += 1;

            let Some(handler) = self.handlers.find(event) else {
                continue;
            };

            let mut context = HandlerContext::new(event, &loaded, &overlay);
            handler
                .handle(&mut context)
                .map_err(|error| ProcessingError::handler(event, error))?;
            let (mutations, requested_registrations) = context.into_parts();

            let identity = HistoryIdentity::of(event);
            for mutation in mutations {
                let key = mutation.key();

                match latest_identities.insert(key.clone(), identity) {
                    Some(previous) => {
                        history.push(UnsavedHistoryRecord::new(&mutation, identity, previous))
                    }
                    None => {
                        unresolved_history.push(history.len());
                        history.push(UnsavedHistoryRecord::new(
                            &mutation,
                            identity,
                            HistoryIdentity::genesis(),
                        ));
                    }
                }

                overlay.insert(key, mutation);
            }

            let new_registrations = register(registry, event, requested_registrations)?;
            if !new_registrations.is_empty() {
                registrations.extend(new_registrations);
                break;
            }
        }

        if !unresolved_history.is_empty() {
            let keys: Vec<EntityKey> =
                unresolved_history.iter().map(|index| history[*index].key()).collect();
            let stored = self.repo.load_latest_history_identities(&keys).await?;

            for index in unresolved_history {
                if let Some(previous) = stored.get(&history[index].key()) {
                    history[index].previous = *previous;
                }
            }
        }

        Ok(ProcessedUnit {
            applied_count,
            entity_changes: overlay.into_values().collect(),
            history,
            registrations,
        })
    }

    async fn run_loaders(&self, events: &[Event], cache: &EntityCache) -> Result<(), ProcessingError> {
        let jobs: Vec<(&Event, Arc<dyn Handler>)> = events
            .iter()
            .filter_map(|event| self.handlers.find(event).map(|handler| (event, handler.clone())))
            .collect();
        stream::iter(jobs)
            .map(|(event, handler)| load_event(event, handler, cache))
            .boxed()
            .buffered(self.loader_concurrency)
            .try_collect::<Vec<()>>()
            .await?;

        Ok(())
    }
}

async fn load_event(
    event: &Event,
    handler: Arc<dyn Handler>,
    cache: &EntityCache,
) -> Result<(), ProcessingError> {
    handler
        .load(&LoaderContext::new(event, cache))
        .await
        .map_err(|error| ProcessingError::handler(event, error))
}

fn register(
    registry: &ContractRegistry,
    event: &Event,
    requested_registrations: Vec<RequestedRegistration>,
) -> Result<Vec<ContractRegistration>, ProcessingError> {
    if let Some(unknown) = requested_registrations
        .iter()
        .find(|requested| !registry.has_contract(&requested.contract_name))
    {
        return Err(ProcessingError::handler(
            event,
            HandlerError::UnknownContract {
                contract_name: unknown.contract_name.clone(),
            },
        ));
    }

    let mut registrations = vec![];
    for RequestedRegistration {
        contract_name,
        address,
    } in requested_registrations
    {
        let outcome = registry
            .register(event.chain_id, &address, &contract_name, event)
            .map_err(|error| ProcessingError::handler(event, error))?;

        if let RegistrationOutcome::Registered(registration) = outcome {
            registrations.push(registration);
        }
    }

    Ok(registrations)
}
