use multidexing::{ChainId, Event};
use serde_json::{json, Value};

use super::{FACTORY_ADDRESS, JOURNAL_ADDRESS, TOKEN_ADDRESS};

/// Raw event at `(block_number, log_index)`. Block hash and timestamp are filled in by the source.
pub fn event(
    chain_id: ChainId,
    contract_address: &str,
    contract_name: &str,
    event_name: &str,
    params: Value,
    block_number: u64,
    log_index: u64,
) -> Event {
    Event {
        chain_id,
        contract_address: contract_address.to_string(),
        contract_name: contract_name.to_string(),
        event_name: event_name.to_string(),
        params,
        block_hash: String::new(),
        block_number,
        block_timestamp: 0,
        transaction_hash: format!("0x{chain_id:x}{block_number:06x}{log_index:04x}"),
        transaction_index: log_index,
        log_index,
    }
}

pub fn transfer_event(chain_id: ChainId, block_number: u64, log_index: u64, to: &str, amount: u64) -> Event {
    event(
        chain_id,
        TOKEN_ADDRESS,
        "Token",
        "Transfer",
        json!({ "to": to, "amount": amount }),
        block_number,
        log_index,
    )
}

pub fn pool_created_event(chain_id: ChainId, block_number: u64, log_index: u64, pool: &str) -> Event {
    event(
        chain_id,
        FACTORY_ADDRESS,
        "Factory",
        "PoolCreated",
        json!({ "pool": pool }),
        block_number,
        log_index,
    )
}

pub fn swap_event(chain_id: ChainId, pool: &str, block_number: u64, log_index: u64, amount: u64) -> Event {
    event(
        chain_id,
        pool,
        "Pool",
        "Swap",
        json!({ "amount": amount }),
        block_number,
        log_index,
    )
}

pub fn ping_event(chain_id: ChainId, block_number: u64, log_index: u64) -> Event {
    event(
        chain_id,
        JOURNAL_ADDRESS,
        "Journal",
        "Ping",
        json!({}),
        block_number,
        log_index,
    )
}

/// Transfer as a source would deliver it, with block hash and timestamp filled in
pub fn fetched_transfer_event(
    chain_id: ChainId,
    block_number: u64,
    log_index: u64,
    to: &str,
    amount: u64,
) -> Event {
    Event {
        block_hash: format!("0x{chain_id}-{block_number}-0"),
        block_timestamp: block_number * 10,
        ..transfer_event(chain_id, block_number, log_index, to, amount)
    }
}
