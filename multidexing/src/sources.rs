mod evm;

pub use evm::EvmJsonRpcSource;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ChainId, Event};

/// A block as reported by a chain data source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
}

/// An address a fetcher asks its data source for.
/// Events emitted by it before `start_block_number` are never indexed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedAddress {
    pub address: String,
    pub contract_name: String,
    pub start_block_number: u64,
}

/// Response for one requested block range
#[derive(Clone, Debug)]
pub struct EventsPage {
    pub events: Vec<Event>,
    /// The first block of the range, carrying the parent hash used for reorg detection
    pub first_block: BlockRef,
    /// The last block actually covered, which may be lower than the requested one near the head
    pub last_block: BlockRef,
    /// Further blocks of the range remembered for reorg detection. At least every block holding
    /// one of `events` and the block before it, so a fork is located to the block.
    pub blocks: Vec<BlockRef>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// Network blips, rate limits, timeouts. Retried by the fetcher.
    #[error("transient source failure: {0}")]
    Transient(String),
    /// Data that can never be decoded. Fatal for the chain.
    #[error("malformed source data: {0}")]
    Malformed(String),
}

/// Capability every chain data source provides, whether a batch API or plain JSON-RPC
#[async_trait::async_trait]
pub trait ChainDataSource: Send + Sync {
    async fn get_head_block(&self, chain_id: ChainId) -> Result<BlockRef, SourceError>;

    async fn get_block(&self, chain_id: ChainId, block_number: u64)
        -> Result<BlockRef, SourceError>;

    /// Returns events emitted by `watched_addresses` within `from_block_number..=to_block_number`,
    /// ordered by block number and log index
    async fn get_events(
        &self,
        chain_id: ChainId,
        from_block_number: u64,
        to_block_number: u64,
        watched_addresses: &[WatchedAddress],
    ) -> Result<EventsPage, SourceError>;
}
