extern crate self as multidexing;

mod booting;
pub mod chain_reorg;
mod chains;
mod checkpoints;
mod config;
pub mod contract_registry;
mod contracts;
mod entities;
pub mod event_queue;
mod events;
mod handlers;
mod ingester;
mod ordering;
mod pipeline;
mod pruning;
mod repos;
pub mod sources;
pub mod storage_writer;

#[cfg(test)]
mod test_support;

pub use chains::{Chain, ChainId};
pub use checkpoints::{ChainCheckpoint, ChainProgress, CheckpointTracker};
pub use config::{Config, ConfigError, MultiChainMode};
pub use contract_registry::{ContractRegistration, ContractRegistry};
pub use contracts::{Contract, ContractAddress};
pub use entities::{
    Entity, EntityHistoryRecord, EntityKey, EntityMutation, EntityRecord, HistoryAction,
    HistoryIdentity, UnsavedHistoryRecord,
};
pub use events::{Event, EventKey, EventParams, EventPosition};
pub use handlers::{Handler, HandlerContext, HandlerError, LoaderContext};
pub use ingester::IngesterError;
pub use multidexing_macros::EntityRecord;
pub use pipeline::IndexingSummary;
pub use pruning::PruningConfig;
pub use repos::{MemoryRepo, Repo, RepoError};
pub use sources::{BlockRef, ChainDataSource, EventsPage, EvmJsonRpcSource, SourceError, WatchedAddress};
pub use storage_writer::WriteUnit;

#[cfg(feature = "postgres")]
pub use repos::PostgresRepo;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum MultidexingError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    /// A commit or rollback kept failing. Nothing of the failed unit was persisted.
    #[error("storage write failed after {attempts} attempts: {source}")]
    Storage {
        attempts: u32,
        #[source]
        source: RepoError,
    },
    #[error("chain {chain_id} failed: {source}")]
    ChainFailed {
        chain_id: ChainId,
        #[source]
        source: IngesterError,
    },
    #[error("handler failed on chain {chain_id} at block {block_number}, log {log_index}: {source}")]
    Handler {
        chain_id: ChainId,
        block_number: u64,
        log_index: u64,
        #[source]
        source: HandlerError,
    },
    #[error("could not roll back chain {chain_id}: {source}")]
    RollbackFailed {
        chain_id: ChainId,
        #[source]
        source: RepoError,
    },
    #[error("indexing task failed: {0}")]
    TaskFailed(String),
}

/// Starts indexing every configured chain in the background.
///
/// Storage is migrated (and reset, when `Config::reset` asks for it) before this returns.
///
/// # Example
/// ```ignore
/// let config = Config::new(PostgresRepo::new(&database_url).await?)
///     .add_chain(Chain::new(1, source))
///     .add_contract(token_contract);
///
/// let handle = multidexing::index_chains(config).await?;
/// // ...
/// let summary = handle.stop().await?;
/// ```
pub async fn index_chains(config: Config) -> Result<IndexerHandle, MultidexingError> {
    let (stop, stop_receiver) = watch::channel(false);
    let pipeline = booting::boot(config, stop_receiver).await?;

    Ok(IndexerHandle {
        stop,
        task: tokio::spawn(pipeline.run()),
    })
}

/// Handle to a running indexer
pub struct IndexerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<IndexingSummary, MultidexingError>>,
}

impl IndexerHandle {
    /// Asks the indexer to stop once the unit in flight is committed
    pub fn request_stop(&self) {
        // Errors once the indexer already returned
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn stop(self) -> Result<IndexingSummary, MultidexingError> {
        self.request_stop();

        self.wait().await
    }

    /// Waits until every chain finished, a fatal error or a stop
    pub async fn wait(self) -> Result<IndexingSummary, MultidexingError> {
        let IndexerHandle { stop: _stop, task } = self;

        task.await
            .map_err(|join_error| MultidexingError::TaskFailed(join_error.to_string()))?
    }
}
