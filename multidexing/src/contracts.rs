use std::fmt::Debug;
use std::sync::Arc;

use crate::handlers::Handler;
use crate::ChainId;

/// A statically configured deployment of a contract
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractAddress {
    pub chain_id: ChainId,
    /// Always lowercased
    pub address: String,
    pub contract_name: String,
    pub start_block_number: u64,
}

impl ContractAddress {
    pub fn new(contract_name: &str, address: &str, chain_id: &ChainId, start_block_number: u64) -> Self {
        Self {
            chain_id: *chain_id,
            address: address.to_lowercase(),
            contract_name: contract_name.to_string(),
            start_block_number,
        }
    }
}

/// Human Readable name of a contract together with its handlers.
///
/// A contract without addresses is a template: its addresses are registered
/// at runtime by handlers, e.g. pairs created by a factory.
#[derive(Clone)]
pub struct Contract {
    pub name: String,
    pub addresses: Vec<ContractAddress>,
    pub handlers: Vec<Arc<dyn Handler>>,
}

impl Contract {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            addresses: vec![],
            handlers: vec![],
        }
    }

    pub fn add_address(mut self, address: &str, chain_id: &ChainId, start_block_number: u64) -> Self {
        self.addresses.push(ContractAddress::new(
            &self.name,
            address,
            chain_id,
            start_block_number,
        ));

        self
    }

    pub fn add_handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));

        self
    }

    pub fn get_event_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|handler| handler.event_name()).collect()
    }
}

impl Debug for Contract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contract")
            .field("name", &self.name)
            .field("addresses", &self.addresses)
            .field("event_names", &self.get_event_names())
            .finish()
    }
}
