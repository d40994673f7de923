use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::chain_reorg::RollbackEngine;
use crate::contract_registry::ContractRegistry;
use crate::handlers::{Handlers, Processor};
use crate::ingester::FetcherTasks;
use crate::ordering::Orderer;
use crate::pipeline::Pipeline;
use crate::storage_writer::StorageWriter;
use crate::{CheckpointTracker, Config, MultidexingError, Repo, RepoError};

/// Prepares storage and restores every piece of persisted state the pipeline resumes from
pub(crate) async fn boot(
    config: Config,
    stop: watch::Receiver<bool>,
) -> Result<Pipeline, MultidexingError> {
    config.validate()?;

    let repo = config.repo.clone();
    repo.migrate().await?;
    maybe_reset(config.reset_count, repo.as_ref()).await?;

    let tracker = CheckpointTracker::new(&config.chains, repo.read_chain_checkpoints().await?);

    let registry = Arc::new(ContractRegistry::new(&config.contracts));
    let registrations = repo.load_contract_registrations().await?;
    registry.reload(&registrations);

    let handlers = Arc::new(Handlers::new(&config.contracts));
    let (failures_sender, failures) = mpsc::unbounded_channel();

    info!(
        chains = config.chains.len(),
        contracts = config.contracts.len(),
        dynamic_contracts = registrations.len(),
        mode = %config.multi_chain_mode,
        "booted indexer"
    );

    Ok(Pipeline {
        chains: config.chains.iter().map(|chain| (chain.id, chain.clone())).collect::<BTreeMap<_, _>>(),
        mode: config.multi_chain_mode,
        processor: Processor::new(repo.clone(), handlers.clone(), config.loader_concurrency),
        writer: StorageWriter::new(repo.clone(), config.max_commit_retries, config.retry_backoff_ms),
        rollback_engine: RollbackEngine::new(repo.clone(), config.multi_chain_mode),
        tasks: FetcherTasks::new(&config, registry.clone(), handlers, failures_sender),
        orderer: Orderer::new(
            config.multi_chain_mode,
            config.max_events_per_unit,
            stop.clone(),
            failures,
        ),
        pruning_config: config.pruning_config.clone(),
        pruning_schedule: Default::default(),
        summary: Default::default(),
        registry,
        tracker,
        repo,
        stop,
    })
}

/// Drops all indexed data once for every reset requested since the last run
async fn maybe_reset(reset_count: u64, repo: &dyn Repo) -> Result<(), RepoError> {
    let previous_reset_count = repo.get_last_reset_count().await?;

    if reset_count > previous_reset_count {
        info!(reset_count, previous_reset_count, "resetting indexed data");

        repo.reset().await?;
        for _ in previous_reset_count..reset_count {
            repo.create_reset_count().await?;
        }
    }

    Ok(())
}
