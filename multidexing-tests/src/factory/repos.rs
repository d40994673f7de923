use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use multidexing::chain_reorg::{RollbackPlan, RollbackScope};
use multidexing::{
    BlockRef, Chain, ChainCheckpoint, ChainId, ContractRegistration, Entity, EntityHistoryRecord,
    EntityKey, EntityMutation, Event, HistoryIdentity, MemoryRepo, Repo, RepoError,
    UnsavedHistoryRecord, WriteUnit,
};

use super::{Balance, MockChainSource};

/// What committing a transfer writes: the raw event, the new balance, its history record
/// and the chain's checkpoint. `previous` is the prior transfer to the same account and the
/// balance it left behind.
pub fn transfer_unit(event: &Event, previous: Option<(&Event, u64)>) -> WriteUnit {
    let params = event.get_params();
    let to = params.get_string("to").unwrap();
    let amount = params.get_u64("amount").unwrap();
    let prior_amount = previous.map_or(0, |(_event, amount)| amount);

    let mutation = EntityMutation::Set(
        Entity::from_record(&Balance {
            id: to,
            amount: prior_amount + amount,
        })
        .unwrap(),
    );
    let previous_identity =
        previous.map_or(HistoryIdentity::genesis(), |(event, _amount)| HistoryIdentity::of(event));

    let chain = Chain::new(event.chain_id, MockChainSource::new(event.chain_id, 0));
    let mut checkpoint = ChainCheckpoint::new(&chain);
    checkpoint.latest_fetched_block_number = Some(event.block_number);
    checkpoint.latest_processed_block_number = Some(event.block_number);
    checkpoint.processed_position = Some(event.position());
    checkpoint.events_processed = 1;
    checkpoint.first_event_block_number = Some(event.block_number);

    WriteUnit {
        raw_events: vec![event.clone()],
        history: vec![UnsavedHistoryRecord::new(
            &mutation,
            HistoryIdentity::of(event),
            previous_identity,
        )],
        entity_changes: vec![mutation],
        checkpoints: vec![checkpoint],
        ..Default::default()
    }
}

/// Memory repo whose commits fail while `failing_commits` lasts
#[derive(Clone)]
pub struct UnreliableRepo {
    repo: MemoryRepo,
    failing_commits: Arc<AtomicU32>,
    commit_attempts: Arc<AtomicU32>,
}

impl UnreliableRepo {
    pub fn new(repo: MemoryRepo) -> Self {
        Self {
            repo,
            failing_commits: Arc::new(AtomicU32::new(0)),
            commit_attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    pub fn commit_attempts(&self) -> u32 {
        self.commit_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Repo for UnreliableRepo {
    async fn migrate(&self) -> Result<(), RepoError> {
        self.repo.migrate().await
    }

    async fn reset(&self) -> Result<(), RepoError> {
        self.repo.reset().await
    }

    async fn get_last_reset_count(&self) -> Result<u64, RepoError> {
        self.repo.get_last_reset_count().await
    }

    async fn create_reset_count(&self) -> Result<(), RepoError> {
        self.repo.create_reset_count().await
    }

    async fn commit(&self, unit: &WriteUnit) -> Result<(), RepoError> {
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RepoError::Query("could not serialize access".to_string()));
        }

        self.repo.commit(unit).await
    }

    async fn read_entity(&self, kind: &str, id: &str) -> Result<Option<Entity>, RepoError> {
        self.repo.read_entity(kind, id).await
    }

    async fn read_chain_checkpoints(&self) -> Result<Vec<ChainCheckpoint>, RepoError> {
        self.repo.read_chain_checkpoints().await
    }

    async fn load_contract_registrations(&self) -> Result<Vec<ContractRegistration>, RepoError> {
        self.repo.load_contract_registrations().await
    }

    async fn load_recent_blocks(&self, chain_id: ChainId, limit: usize) -> Result<Vec<BlockRef>, RepoError> {
        self.repo.load_recent_blocks(chain_id, limit).await
    }

    async fn load_latest_history_identities(
        &self,
        keys: &[EntityKey],
    ) -> Result<HashMap<EntityKey, HistoryIdentity>, RepoError> {
        self.repo.load_latest_history_identities(keys).await
    }

    async fn load_history_records_in_scope(
        &self,
        scope: &RollbackScope,
    ) -> Result<Vec<EntityHistoryRecord>, RepoError> {
        self.repo.load_history_records_in_scope(scope).await
    }

    async fn load_history_record_at(
        &self,
        key: &EntityKey,
        identity: &HistoryIdentity,
    ) -> Result<Option<EntityHistoryRecord>, RepoError> {
        self.repo.load_history_record_at(key, identity).await
    }

    async fn load_first_invalidated_event_blocks(
        &self,
        scope: &RollbackScope,
    ) -> Result<HashMap<ChainId, u64>, RepoError> {
        self.repo.load_first_invalidated_event_blocks(scope).await
    }

    async fn apply_rollback(&self, plan: &RollbackPlan) -> Result<(), RepoError> {
        self.repo.apply_rollback(plan).await
    }

    async fn prune(&self, chain_id: ChainId, min_block_number: u64) -> Result<(), RepoError> {
        self.repo.prune(chain_id, min_block_number).await
    }
}
