use std::collections::HashMap;
use std::sync::Arc;

use super::{HandlerContext, HandlerError, LoaderContext};
use crate::{Contract, Event};

/// Turns one kind of event into entity mutations.
///
/// Indexing calls `load` for every event of a unit concurrently, then `handle`
/// for each event in order. `handle` only sees entities that `load` asked for
/// or that an earlier event of the same unit wrote.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Name of the decoded event, e.g. `Transfer`
    fn event_name(&self) -> &'static str;

    async fn load(&self, _context: &LoaderContext<'_>) -> Result<(), HandlerError> {
        Ok(())
    }

    fn handle(&self, context: &mut HandlerContext<'_>) -> Result<(), HandlerError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

/// Lookup table from contract name and event name to handler, resolved once at startup
#[derive(Clone, Default)]
pub struct Handlers {
    ids_by_contract: HashMap<String, HashMap<&'static str, HandlerId>>,
    handlers: Vec<Arc<dyn Handler>>,
}

impl Handlers {
    pub fn new(contracts: &[Contract]) -> Self {
        let mut table = Self::default();

        for contract in contracts {
            for handler in &contract.handlers {
                let id = HandlerId(table.handlers.len());
                table.handlers.push(handler.clone());
                table
                    .ids_by_contract
                    .entry(contract.name.clone())
                    .or_default()
                    .insert(handler.event_name(), id);
            }
        }

        table
    }

    pub fn get_id(&self, contract_name: &str, event_name: &str) -> Option<HandlerId> {
        self.ids_by_contract.get(contract_name)?.get(event_name).copied()
    }

    pub fn get(&self, HandlerId(index): HandlerId) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(index)
    }

    pub fn find(&self, event: &Event) -> Option<&Arc<dyn Handler>> {
        self.get_id(&event.contract_name, &event.event_name)
            .and_then(|id| self.get(id))
    }

    pub fn has_handler(&self, contract_name: &str, event_name: &str) -> bool {
        self.get_id(contract_name, event_name).is_some()
    }
}
