use serde::{Deserialize, Serialize};

use super::EventParams;
use crate::ChainId;

/// A decoded on-chain log.
///
/// Identity is `(chain_id, block_number, log_index)`. Events are immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub chain_id: ChainId,
    /// Lowercased address of the emitting contract
    pub contract_address: String,
    pub contract_name: String,
    pub event_name: String,
    pub params: serde_json::Value,
    pub block_hash: String,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub transaction_hash: String,
    pub transaction_index: u64,
    pub log_index: u64,
}

impl Event {
    pub fn get_params(&self) -> EventParams<'_> {
        EventParams::new(self)
    }

    pub fn position(&self) -> EventPosition {
        EventPosition {
            block_number: self.block_number,
            log_index: self.log_index,
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            block_timestamp: self.block_timestamp,
            chain_id: self.chain_id,
            block_number: self.block_number,
            log_index: self.log_index,
        }
    }

    pub fn match_contract_address(&self, contract_address: &str) -> bool {
        self.contract_address.eq_ignore_ascii_case(contract_address)
    }
}

/// Position of an event within its own chain
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventPosition {
    pub block_number: u64,
    pub log_index: u64,
}

/// Global ordering key across chains.
/// Field order matters: the derived `Ord` compares timestamp, then chain id,
/// then block number, then log index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub block_timestamp: u64,
    pub chain_id: ChainId,
    pub block_number: u64,
    pub log_index: u64,
}
