use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use derive_more::Display;
use thiserror::Error;

use crate::pruning::PruningConfig;
use crate::{Chain, ChainId, Contract, Repo};

/// How events of different chains are interleaved. Fixed for the lifetime of an indexer,
/// because rollbacks depend on the commit order it upheld.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Display)]
pub enum MultiChainMode {
    /// Each chain commits independently. Entities should not be shared across chains.
    #[default]
    #[display("unordered")]
    Unordered,
    /// Events commit in global `(timestamp, chain id, block, log index)` order
    #[display("ordered")]
    Ordered,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one chain is required")]
    NoChains,
    #[error("chain {0} is configured more than once")]
    DuplicateChain(ChainId),
    #[error("chain id 0 is reserved")]
    ReservedChainId,
    #[error("chain {chain_id} starts after its end block")]
    StartAfterEnd { chain_id: ChainId },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("min_blocks_per_batch ({min}) exceeds max_blocks_per_batch ({max})")]
    InvalidBatchBounds { min: u64, max: u64 },
    #[error("contract {0} is configured more than once")]
    DuplicateContract(String),
    #[error("contract {contract_name} has an address on unknown chain {chain_id}")]
    UnknownChain {
        contract_name: String,
        chain_id: ChainId,
    },
}

#[derive(Clone)]
pub struct Config {
    pub chains: Vec<Chain>,
    pub repo: Arc<dyn Repo>,
    pub contracts: Vec<Contract>,
    pub multi_chain_mode: MultiChainMode,
    /// Initial batch size, adapted per chain at runtime
    pub blocks_per_batch: u64,
    pub min_blocks_per_batch: u64,
    pub max_blocks_per_batch: u64,
    /// Responses slower than this shrink the batch size
    pub target_batch_response_ms: u64,
    /// Responses with more events than this shrink the batch size
    pub max_events_per_response: usize,
    /// Batches buffered per chain between its fetcher and the orderer
    pub queue_depth: usize,
    pub max_events_per_unit: usize,
    pub loader_concurrency: usize,
    pub max_fetch_retries: u32,
    pub max_commit_retries: u32,
    pub retry_backoff_ms: u64,
    pub head_polling_rate_ms: u64,
    /// Size of the per-chain block window used to detect reorgs
    pub max_recorded_blocks: usize,
    pub pruning_config: Option<PruningConfig>,
    pub reset_count: u64,
}

impl Config {
    pub fn new(repo: impl Repo + 'static) -> Self {
        Self::with_shared_repo(Arc::new(repo))
    }

    pub fn with_shared_repo(repo: Arc<dyn Repo>) -> Self {
        Self {
            chains: vec![],
            repo,
            contracts: vec![],
            multi_chain_mode: MultiChainMode::default(),
            blocks_per_batch: 500,
            min_blocks_per_batch: 1,
            max_blocks_per_batch: 10_000,
            target_batch_response_ms: 1_000,
            max_events_per_response: 5_000,
            queue_depth: 8,
            max_events_per_unit: 1_000,
            loader_concurrency: 16,
            max_fetch_retries: 8,
            max_commit_retries: 5,
            retry_backoff_ms: 250,
            head_polling_rate_ms: 1_000,
            max_recorded_blocks: 200,
            pruning_config: None,
            reset_count: 0,
        }
    }

    pub fn add_chain(mut self, chain: Chain) -> Self {
        self.chains.push(chain);

        self
    }

    pub fn add_contract(mut self, contract: Contract) -> Self {
        self.contracts.push(contract);

        self
    }

    /// Drops all indexed data on the next start whenever `count` exceeds the previous resets
    pub fn reset(mut self, count: u64) -> Self {
        self.reset_count = count;

        self
    }

    pub fn with_multi_chain_mode(mut self, multi_chain_mode: MultiChainMode) -> Self {
        self.multi_chain_mode = multi_chain_mode;

        self
    }

    pub fn with_blocks_per_batch(mut self, blocks_per_batch: u64) -> Self {
        self.blocks_per_batch = blocks_per_batch;

        self
    }

    pub fn with_blocks_per_batch_bounds(mut self, min: u64, max: u64) -> Self {
        self.min_blocks_per_batch = min;
        self.max_blocks_per_batch = max;

        self
    }

    pub fn with_target_batch_response_ms(mut self, target_batch_response_ms: u64) -> Self {
        self.target_batch_response_ms = target_batch_response_ms;

        self
    }

    pub fn with_max_events_per_response(mut self, max_events_per_response: usize) -> Self {
        self.max_events_per_response = max_events_per_response;

        self
    }

    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;

        self
    }

    pub fn with_max_events_per_unit(mut self, max_events_per_unit: usize) -> Self {
        self.max_events_per_unit = max_events_per_unit;

        self
    }

    pub fn with_loader_concurrency(mut self, loader_concurrency: usize) -> Self {
        self.loader_concurrency = loader_concurrency;

        self
    }

    pub fn with_max_fetch_retries(mut self, max_fetch_retries: u32) -> Self {
        self.max_fetch_retries = max_fetch_retries;

        self
    }

    pub fn with_max_commit_retries(mut self, max_commit_retries: u32) -> Self {
        self.max_commit_retries = max_commit_retries;

        self
    }

    pub fn with_retry_backoff_ms(mut self, retry_backoff_ms: u64) -> Self {
        self.retry_backoff_ms = retry_backoff_ms;

        self
    }

    pub fn with_head_polling_rate_ms(mut self, head_polling_rate_ms: u64) -> Self {
        self.head_polling_rate_ms = head_polling_rate_ms;

        self
    }

    pub fn with_max_recorded_blocks(mut self, max_recorded_blocks: usize) -> Self {
        self.max_recorded_blocks = max_recorded_blocks;

        self
    }

    pub fn with_pruning(mut self) -> Self {
        self.pruning_config = Some(Default::default());

        self
    }

    pub fn with_prune_n_blocks_away(mut self, prune_n_blocks_away: u64) -> Self {
        self.pruning_config = Some(PruningConfig {
            prune_n_blocks_away,
            ..self.pruning_config.unwrap_or_default()
        });

        self
    }

    pub fn with_prune_interval(mut self, prune_interval: u64) -> Self {
        self.pruning_config = Some(PruningConfig {
            prune_interval,
            ..self.pruning_config.unwrap_or_default()
        });

        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chains.is_empty() {
            return Err(ConfigError::NoChains);
        }

        let mut chain_ids = HashSet::new();
        for chain in &self.chains {
            if chain.id == 0 {
                return Err(ConfigError::ReservedChainId);
            }
            if !chain_ids.insert(chain.id) {
                return Err(ConfigError::DuplicateChain(chain.id));
            }
            if chain.end_block_number.is_some_and(|end| end < chain.start_block_number) {
                return Err(ConfigError::StartAfterEnd { chain_id: chain.id });
            }
        }

        for (name, value) in [
            ("queue_depth", self.queue_depth),
            ("max_events_per_unit", self.max_events_per_unit),
            ("loader_concurrency", self.loader_concurrency),
            ("max_recorded_blocks", self.max_recorded_blocks),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.min_blocks_per_batch == 0 {
            return Err(ConfigError::Zero("min_blocks_per_batch"));
        }
        if self.min_blocks_per_batch > self.max_blocks_per_batch {
            return Err(ConfigError::InvalidBatchBounds {
                min: self.min_blocks_per_batch,
                max: self.max_blocks_per_batch,
            });
        }

        let mut contract_names = HashSet::new();
        for contract in &self.contracts {
            if !contract_names.insert(contract.name.as_str()) {
                return Err(ConfigError::DuplicateContract(contract.name.clone()));
            }

            if let Some(address) =
                contract.addresses.iter().find(|address| !chain_ids.contains(&address.chain_id))
            {
                return Err(ConfigError::UnknownChain {
                    contract_name: contract.name.clone(),
                    chain_id: address.chain_id,
                });
            }
        }

        Ok(())
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("chains", &self.chains)
            .field("contracts", &self.contracts)
            .field("multi_chain_mode", &self.multi_chain_mode)
            .field("blocks_per_batch", &self.blocks_per_batch)
            .field("queue_depth", &self.queue_depth)
            .field("max_events_per_unit", &self.max_events_per_unit)
            .field("pruning_config", &self.pruning_config)
            .field("reset_count", &self.reset_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::silent_chain;
    use crate::MemoryRepo;

    fn config() -> Config {
        Config::new(MemoryRepo::new())
            .add_chain(silent_chain(1))
            .add_chain(silent_chain(2))
            .add_contract(Contract::new("Token").add_address("0xaa", &1, 0))
    }

    #[test]
    fn accepts_a_sound_config() {
        assert_eq!(config().validate(), Ok(()));
    }

    #[test]
    fn rejects_configs_without_chains() {
        assert_eq!(
            Config::new(MemoryRepo::new()).validate(),
            Err(ConfigError::NoChains)
        );
    }

    #[test]
    fn rejects_duplicate_chains_and_contracts() {
        assert_eq!(
            config().add_chain(silent_chain(2)).validate(),
            Err(ConfigError::DuplicateChain(2))
        );
        assert_eq!(
            config().add_contract(Contract::new("Token")).validate(),
            Err(ConfigError::DuplicateContract("Token".to_string()))
        );
    }

    #[test]
    fn rejects_addresses_on_unknown_chains() {
        let config = config().add_contract(Contract::new("Pair").add_address("0xbb", &9, 0));

        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownChain { chain_id: 9, .. })
        ));
    }

    #[test]
    fn rejects_inverted_batch_bounds_and_zero_sizes() {
        assert_eq!(
            config().with_blocks_per_batch_bounds(10, 5).validate(),
            Err(ConfigError::InvalidBatchBounds { min: 10, max: 5 })
        );
        assert_eq!(
            config().with_queue_depth(0).validate(),
            Err(ConfigError::Zero("queue_depth"))
        );
    }

    #[test]
    fn displays_modes_in_lowercase() {
        assert_eq!(MultiChainMode::Ordered.to_string(), "ordered");
        assert_eq!(MultiChainMode::default().to_string(), "unordered");
    }
}
