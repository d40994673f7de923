use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::sources::WatchedAddress;
use crate::{ChainId, Contract, Event, EventPosition, HandlerError};

/// An address that started being indexed because a handler asked for it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRegistration {
    pub chain_id: ChainId,
    pub address: String,
    pub contract_name: String,
    pub block_number: u64,
    pub log_index: u64,
    pub block_timestamp: u64,
    pub registering_contract_address: String,
    pub registering_contract_name: String,
    pub registering_event_name: String,
}

impl ContractRegistration {
    /// Position of the registering event
    pub fn position(&self) -> EventPosition {
        EventPosition {
            block_number: self.block_number,
            log_index: self.log_index,
        }
    }

    fn watched_address(&self) -> WatchedAddress {
        WatchedAddress {
            address: self.address.clone(),
            contract_name: self.contract_name.clone(),
            start_block_number: self.block_number,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered(ContractRegistration),
    AlreadyKnown,
}

type WatchedByChain = HashMap<ChainId, BTreeMap<String, WatchedAddress>>;

/// Every address fetchers should ask their sources for, static and dynamic
pub struct ContractRegistry {
    contract_names: HashSet<String>,
    static_addresses: WatchedByChain,
    watched: RwLock<WatchedByChain>,
}

impl ContractRegistry {
    pub fn new(contracts: &[Contract]) -> Self {
        let mut static_addresses: WatchedByChain = HashMap::new();

        for contract_address in contracts.iter().flat_map(|contract| contract.addresses.iter()) {
            let watched = static_addresses
                .entry(contract_address.chain_id)
                .or_default()
                .entry(contract_address.address.clone())
                .or_insert_with(|| WatchedAddress {
                    address: contract_address.address.clone(),
                    contract_name: contract_address.contract_name.clone(),
                    start_block_number: contract_address.start_block_number,
                });

            watched.start_block_number =
                watched.start_block_number.min(contract_address.start_block_number);
        }

        Self {
            contract_names: contracts.iter().map(|contract| contract.name.clone()).collect(),
            watched: RwLock::new(static_addresses.clone()),
            static_addresses,
        }
    }

    /// Replaces dynamic addresses with `registrations`, as persisted by storage
    pub fn reload(&self, registrations: &[ContractRegistration]) {
        let mut watched = self.static_addresses.clone();

        for registration in registrations {
            watched
                .entry(registration.chain_id)
                .or_default()
                .entry(registration.address.clone())
                .or_insert_with(|| registration.watched_address());
        }

        *self.watched.write().unwrap_or_else(PoisonError::into_inner) = watched;
    }

    pub fn register(
        &self,
        chain_id: ChainId,
        address: &str,
        contract_name: &str,
        event: &Event,
    ) -> Result<RegistrationOutcome, HandlerError> {
        if !self.has_contract(contract_name) {
            return Err(HandlerError::UnknownContract {
                contract_name: contract_name.to_string(),
            });
        }

        let address = address.to_lowercase();
        let mut watched = self.watched.write().unwrap_or_else(PoisonError::into_inner);
        let addresses = watched.entry(chain_id).or_default();

        if addresses.contains_key(&address) {
            return Ok(RegistrationOutcome::AlreadyKnown);
        }

        let registration = ContractRegistration {
            chain_id,
            address: address.clone(),
            contract_name: contract_name.to_string(),
            block_number: event.block_number,
            log_index: event.log_index,
            block_timestamp: event.block_timestamp,
            registering_contract_address: event.contract_address.clone(),
            registering_contract_name: event.contract_name.clone(),
            registering_event_name: event.event_name.clone(),
        };
        addresses.insert(address, registration.watched_address());

        Ok(RegistrationOutcome::Registered(registration))
    }

    pub fn has_contract(&self, contract_name: &str) -> bool {
        self.contract_names.contains(contract_name)
    }

    pub fn watched_addresses(&self, chain_id: ChainId) -> Vec<WatchedAddress> {
        self.watched
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chain_id)
            .map(|addresses| addresses.values().cloned().collect())
            .unwrap_or_default()
    }
}
