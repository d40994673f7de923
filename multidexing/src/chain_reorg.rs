mod rollback;

pub use rollback::{ChainRewind, RollbackEngine, RollbackPlan};

use serde::{Deserialize, Serialize};

use crate::sources::BlockRef;
use crate::{ChainId, MultiChainMode};

/// Emitted by a fetcher once it found the highest block a reorg left untouched
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgCheckpoint {
    pub chain_id: ChainId,
    pub safe_block: BlockRef,
}

/// Which committed rows a reorg invalidates.
///
/// The variant follows the commit order the indexer upheld, so it is fixed by
/// `MultiChainMode` and never mixed within one instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RollbackScope {
    /// Everything the reorged chain committed above the safe block
    Chain {
        chain_id: ChainId,
        safe_block_number: u64,
    },
    /// Everything committed after the safe block in the global
    /// `(timestamp, chain id, block number)` order, on any chain
    Global {
        chain_id: ChainId,
        safe_block_number: u64,
        safe_block_timestamp: u64,
    },
}

impl RollbackScope {
    pub fn new(mode: MultiChainMode, reorg: &ReorgCheckpoint) -> Self {
        match mode {
            MultiChainMode::Unordered => RollbackScope::Chain {
                chain_id: reorg.chain_id,
                safe_block_number: reorg.safe_block.number,
            },
            MultiChainMode::Ordered => RollbackScope::Global {
                chain_id: reorg.chain_id,
                safe_block_number: reorg.safe_block.number,
                safe_block_timestamp: reorg.safe_block.timestamp,
            },
        }
    }

    pub fn chain_id(&self) -> ChainId {
        match self {
            RollbackScope::Chain { chain_id, .. } | RollbackScope::Global { chain_id, .. } => {
                *chain_id
            }
        }
    }

    pub fn safe_block_number(&self) -> u64 {
        match self {
            RollbackScope::Chain {
                safe_block_number, ..
            }
            | RollbackScope::Global {
                safe_block_number, ..
            } => *safe_block_number,
        }
    }

    pub fn invalidates(&self, chain_id: ChainId, block_number: u64, block_timestamp: u64) -> bool {
        match *self {
            RollbackScope::Chain {
                chain_id: reorged_chain_id,
                safe_block_number,
            } => chain_id == reorged_chain_id && block_number > safe_block_number,
            RollbackScope::Global {
                chain_id: reorged_chain_id,
                safe_block_number,
                safe_block_timestamp,
            } => {
                (block_timestamp, chain_id, block_number)
                    > (safe_block_timestamp, reorged_chain_id, safe_block_number)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reorg(safe_block_number: u64, timestamp: u64) -> ReorgCheckpoint {
        ReorgCheckpoint {
            chain_id: 2,
            safe_block: BlockRef {
                number: safe_block_number,
                hash: "0xsafe".to_string(),
                parent_hash: "0xparent".to_string(),
                timestamp,
            },
        }
    }

    #[test]
    fn chain_scope_only_touches_the_reorged_chain() {
        let scope = RollbackScope::new(MultiChainMode::Unordered, &reorg(40, 400));

        assert!(scope.invalidates(2, 41, 0));
        assert!(!scope.invalidates(2, 40, 1_000));
        assert!(!scope.invalidates(1, 90, 900));
    }

    #[test]
    fn global_scope_follows_the_cross_chain_order() {
        let scope = RollbackScope::new(MultiChainMode::Ordered, &reorg(40, 400));

        assert!(scope.invalidates(2, 41, 410));
        assert!(scope.invalidates(1, 7, 401));
        assert!(scope.invalidates(3, 1, 400));
        assert!(!scope.invalidates(1, 900, 400));
        assert!(!scope.invalidates(2, 40, 400));
        assert!(!scope.invalidates(3, 900, 399));
    }
}
