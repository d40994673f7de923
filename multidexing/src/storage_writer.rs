use std::sync::Arc;

use futures_core::future::BoxFuture;
use tracing::{debug, warn};

use crate::chain_reorg::RollbackPlan;
use crate::contract_registry::ContractRegistration;
use crate::ingester::backoff;
use crate::sources::BlockRef;
use crate::{
    ChainCheckpoint, ChainId, EntityMutation, Event, MultidexingError, Repo, RepoError,
    UnsavedHistoryRecord,
};

/// A block seen by a fetcher, kept for reorg detection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedBlock {
    pub chain_id: ChainId,
    pub block: BlockRef,
}

/// Everything one commit persists. Applied in a single transaction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteUnit {
    pub raw_events: Vec<Event>,
    /// At most one change per entity key
    pub entity_changes: Vec<EntityMutation>,
    /// In append order, which becomes serial order
    pub history: Vec<UnsavedHistoryRecord>,
    pub contract_registrations: Vec<ContractRegistration>,
    pub checkpoints: Vec<ChainCheckpoint>,
    pub block_refs: Vec<RecordedBlock>,
}

impl WriteUnit {
    pub fn is_empty(&self) -> bool {
        self.raw_events.is_empty()
            && self.entity_changes.is_empty()
            && self.history.is_empty()
            && self.contract_registrations.is_empty()
            && self.checkpoints.is_empty()
            && self.block_refs.is_empty()
    }
}

pub(crate) struct StorageWriter {
    repo: Arc<dyn Repo>,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl StorageWriter {
    pub fn new(repo: Arc<dyn Repo>, max_retries: u32, retry_backoff_ms: u64) -> Self {
        Self {
            repo,
            max_retries,
            retry_backoff_ms,
        }
    }

    pub async fn commit(&self, unit: &WriteUnit) -> Result<(), MultidexingError> {
        debug!(
            raw_events = unit.raw_events.len(),
            entity_changes = unit.entity_changes.len(),
            history = unit.history.len(),
            registrations = unit.contract_registrations.len(),
            "committing unit"
        );

        self.with_retries("commit", || self.repo.commit(unit)).await
    }

    pub async fn apply_rollback(&self, plan: &RollbackPlan) -> Result<(), MultidexingError> {
        self.with_retries("rollback", || self.repo.apply_rollback(plan)).await
    }

    async fn with_retries<'a, F>(&self, operation: &str, mut run: F) -> Result<(), MultidexingError>
    where
        F: FnMut() -> BoxFuture<'a, Result<(), RepoError>>,
    {
        let mut retries_so_far = 0;

        loop {
            match run().await {
                Ok(()) => return Ok(()),
                Err(error) if retries_so_far < self.max_retries => {
                    warn!(operation, retries_so_far, %error, "storage write failed, retrying");

                    backoff(self.retry_backoff_ms, retries_so_far).await;
                    retries_so_far += 1;
                }
                Err(source) => {
                    return Err(MultidexingError::Storage {
                        attempts: retries_so_far + 1,
                        source,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FlakyRepo;
    use crate::MemoryRepo;

    #[tokio::test]
    async fn retries_failed_commits() {
        let memory_repo = MemoryRepo::new();
        let repo = FlakyRepo::new(memory_repo.clone(), 2);
        let writer = StorageWriter::new(Arc::new(repo.clone()), 3, 1);

        writer.commit(&WriteUnit::default()).await.unwrap();

        assert_eq!(repo.attempts(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_configured_retries() {
        let repo = FlakyRepo::new(MemoryRepo::new(), 10);
        let writer = StorageWriter::new(Arc::new(repo.clone()), 2, 1);

        let result = writer.commit(&WriteUnit::default()).await;

        assert!(matches!(
            result,
            Err(MultidexingError::Storage { attempts: 3, .. })
        ));
    }
}
