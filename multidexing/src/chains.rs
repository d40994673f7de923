use std::fmt::Debug;
use std::sync::Arc;

use crate::sources::ChainDataSource;

/// Numeric network id of a chain, e.g. `1` for Ethereum mainnet.
pub type ChainId = u64;

/// Represents an indexed chain network together with the data source it is fetched from
#[derive(Clone)]
pub struct Chain {
    pub id: ChainId,
    pub start_block_number: u64,
    /// Indexing of this chain finishes once this block is processed
    pub end_block_number: Option<u64>,
    source: Arc<dyn ChainDataSource>,
}

impl Chain {
    /// Builds the chain network
    ///
    ///
    /// # Example
    /// ```ignore
    /// use multidexing::{Chain, EvmJsonRpcSource};
    ///
    /// let source = EvmJsonRpcSource::new("https://polygon-mainnet.g.alchemy.com/v2/...")?;
    /// Chain::new(137, source).with_start_block(50_000_000);
    /// ```
    pub fn new(id: ChainId, source: impl ChainDataSource + 'static) -> Self {
        Self::with_shared_source(id, Arc::new(source))
    }

    pub fn with_shared_source(id: ChainId, source: Arc<dyn ChainDataSource>) -> Self {
        Self {
            id,
            start_block_number: 0,
            end_block_number: None,
            source,
        }
    }

    pub fn with_start_block(mut self, start_block_number: u64) -> Self {
        self.start_block_number = start_block_number;

        self
    }

    pub fn with_end_block(mut self, end_block_number: u64) -> Self {
        self.end_block_number = Some(end_block_number);

        self
    }

    pub fn source(&self) -> &Arc<dyn ChainDataSource> {
        &self.source
    }
}

impl Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("id", &self.id)
            .field("start_block_number", &self.start_block_number)
            .field("end_block_number", &self.end_block_number)
            .finish_non_exhaustive()
    }
}
