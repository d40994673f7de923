use std::collections::HashMap;

use chrono::Utc;

use crate::ChainId;

#[derive(Clone, Debug)]
pub struct PruningConfig {
    /// Retains raw events, recorded blocks and history within this many
    /// blocks of the processed cursor
    pub prune_n_blocks_away: u64,
    /// How often stale data gets pruned per chain.
    /// Unit in seconds.
    pub prune_interval: u64,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            prune_n_blocks_away: 30 * 1_000,   // Blocks in the last 30 days ish
            prune_interval: 30 * 24 * 60 * 60, // 30 days,
        }
    }
}

impl PruningConfig {
    pub fn get_min_block_number(&self, current_block_number: u64) -> u64 {
        current_block_number.saturating_sub(self.prune_n_blocks_away)
    }
}

/// Remembers when each chain was last pruned
#[derive(Clone, Debug, Default)]
pub(crate) struct PruningSchedule {
    last_pruned_at_per_chain_id: HashMap<ChainId, i64>,
}

impl PruningSchedule {
    pub fn is_due(&self, pruning_config: &PruningConfig, chain_id: ChainId) -> bool {
        let now = Utc::now().timestamp();

        match self.last_pruned_at_per_chain_id.get(&chain_id) {
            Some(last_pruned_at) => now - last_pruned_at >= pruning_config.prune_interval as i64,
            None => true,
        }
    }

    pub fn mark_pruned(&mut self, chain_id: ChainId) {
        self.last_pruned_at_per_chain_id.insert(chain_id, Utc::now().timestamp());
    }
}
