use std::collections::HashMap;

use thiserror::Error;

use crate::chain_reorg::{RollbackPlan, RollbackScope};
use crate::contract_registry::ContractRegistration;
use crate::sources::BlockRef;
use crate::storage_writer::WriteUnit;
use crate::{
    ChainCheckpoint, ChainId, Entity, EntityHistoryRecord, EntityKey, HistoryIdentity,
};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("repo is not connected")]
    NotConnected,
    #[error("query failed: {0}")]
    Query(String),
    #[error("could not (de)serialize stored data: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Two history records claim the same entity and event
    #[error("conflicting write: {0}")]
    Conflict(String),
    /// A back-reference points at a record that no longer exists, e.g. pruned too aggressively
    #[error("{kind} {id} has no history record at {identity}")]
    MissingHistory {
        kind: String,
        id: String,
        identity: HistoryIdentity,
    },
}

/// Storage capability of the indexer. Every method that writes is atomic.
#[async_trait::async_trait]
pub trait Repo: Send + Sync {
    async fn migrate(&self) -> Result<(), RepoError>;
    /// Drops every indexed row, keeping reset counts
    async fn reset(&self) -> Result<(), RepoError>;
    async fn get_last_reset_count(&self) -> Result<u64, RepoError>;
    async fn create_reset_count(&self) -> Result<(), RepoError>;

    async fn commit(&self, unit: &WriteUnit) -> Result<(), RepoError>;

    async fn read_entity(&self, kind: &str, id: &str) -> Result<Option<Entity>, RepoError>;
    async fn read_chain_checkpoints(&self) -> Result<Vec<ChainCheckpoint>, RepoError>;
    async fn load_contract_registrations(&self) -> Result<Vec<ContractRegistration>, RepoError>;
    /// Most recent recorded blocks of a chain, highest first
    async fn load_recent_blocks(
        &self,
        chain_id: ChainId,
        limit: usize,
    ) -> Result<Vec<BlockRef>, RepoError>;

    /// Identity of the latest history record of each key that has one
    async fn load_latest_history_identities(
        &self,
        keys: &[EntityKey],
    ) -> Result<HashMap<EntityKey, HistoryIdentity>, RepoError>;
    /// History records invalidated by `scope`, in serial order
    async fn load_history_records_in_scope(
        &self,
        scope: &RollbackScope,
    ) -> Result<Vec<EntityHistoryRecord>, RepoError>;
    async fn load_history_record_at(
        &self,
        key: &EntityKey,
        identity: &HistoryIdentity,
    ) -> Result<Option<EntityHistoryRecord>, RepoError>;
    /// Lowest invalidated raw-event block per chain
    async fn load_first_invalidated_event_blocks(
        &self,
        scope: &RollbackScope,
    ) -> Result<HashMap<ChainId, u64>, RepoError>;
    async fn apply_rollback(&self, plan: &RollbackPlan) -> Result<(), RepoError>;

    /// Drops raw events, recorded blocks and superseded history below `min_block_number`
    async fn prune(&self, chain_id: ChainId, min_block_number: u64) -> Result<(), RepoError>;
}
