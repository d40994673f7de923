use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::{ReorgCheckpoint, RollbackScope};
use crate::{
    ChainCheckpoint, ChainId, CheckpointTracker, EntityMutation, MultiChainMode, Repo, RepoError,
};

/// New processed cursor of a chain after a rollback. `None` means nothing stays processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainRewind {
    pub chain_id: ChainId,
    pub block_number: Option<u64>,
}

/// Everything a rollback changes, applied by storage in one transaction
#[derive(Clone, Debug, PartialEq)]
pub struct RollbackPlan {
    pub scope: RollbackScope,
    pub restores: Vec<EntityMutation>,
    pub rewinds: Vec<ChainRewind>,
    pub checkpoints: Vec<ChainCheckpoint>,
}

pub struct RollbackEngine {
    repo: Arc<dyn Repo>,
    mode: MultiChainMode,
}

impl RollbackEngine {
    pub fn new(repo: Arc<dyn Repo>, mode: MultiChainMode) -> Self {
        Self { repo, mode }
    }

    /// Diffs committed history against the safe block.
    ///
    /// Each touched entity goes back to the value its earliest invalidated record replaced.
    pub async fn plan(
        &self,
        reorg: &ReorgCheckpoint,
        tracker: &CheckpointTracker,
    ) -> Result<RollbackPlan, RepoError> {
        let scope = RollbackScope::new(self.mode, reorg);

        // Records arrive in serial order, so the first one per entity is the earliest
        let mut earliest_invalidated = BTreeMap::new();
        for record in self.repo.load_history_records_in_scope(&scope).await? {
            earliest_invalidated.entry(record.key()).or_insert(record);
        }

        let mut restores = Vec::with_capacity(earliest_invalidated.len());
        for (key, record) in earliest_invalidated {
            if record.previous.is_genesis() {
                restores.push(EntityMutation::Delete(key));
                continue;
            }

            match self.repo.load_history_record_at(&key, &record.previous).await? {
                Some(previous) => restores.push(previous.to_mutation()),
                None => {
                    return Err(RepoError::MissingHistory {
                        kind: key.kind,
                        id: key.id,
                        identity: record.previous,
                    })
                }
            }
        }

        let mut rewinds = vec![ChainRewind {
            chain_id: reorg.chain_id,
            block_number: tracker
                .processed_block(reorg.chain_id)
                .min(Some(reorg.safe_block.number)),
        }];

        if let RollbackScope::Global { .. } = scope {
            let first_invalidated_blocks =
                self.repo.load_first_invalidated_event_blocks(&scope).await?;

            for (chain_id, first_invalidated_block) in first_invalidated_blocks {
                if chain_id == reorg.chain_id {
                    continue;
                }

                rewinds.push(ChainRewind {
                    chain_id,
                    block_number: tracker
                        .processed_block(chain_id)
                        .min(first_invalidated_block.checked_sub(1)),
                });
            }
        }

        info!(
            chain_id = reorg.chain_id,
            safe_block_number = reorg.safe_block.number,
            restores = restores.len(),
            rewound_chains = rewinds.len(),
            "planned rollback"
        );

        Ok(RollbackPlan {
            checkpoints: tracker.rewound(&rewinds),
            scope,
            restores,
            rewinds,
        })
    }
}
