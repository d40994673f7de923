use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chain_reorg::{ReorgCheckpoint, RollbackEngine};
use crate::contract_registry::ContractRegistry;
use crate::handlers::{HandlerError, ProcessedUnit, ProcessingError, Processor};
use crate::ingester::{ChainFailure, FetcherTasks};
use crate::ordering::{Orderer, OrdererStep};
use crate::pruning::{PruningConfig, PruningSchedule};
use crate::storage_writer::{StorageWriter, WriteUnit};
use crate::{
    Chain, ChainCheckpoint, ChainId, CheckpointTracker, Event, MultiChainMode, MultidexingError,
    Repo,
};

/// Outcome of an indexing run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexingSummary {
    pub checkpoints: Vec<ChainCheckpoint>,
    /// Chains that stopped after a fatal error while the others went on. Unordered mode only.
    pub degraded_chains: Vec<ChainId>,
    pub units_committed: u64,
    pub events_processed: u64,
    pub rollbacks: u64,
    /// Whether the run ended on a stop request rather than every chain finishing
    pub stopped: bool,
}

/// The single processing path: orders, processes, commits and rolls back
pub(crate) struct Pipeline {
    pub chains: BTreeMap<ChainId, Chain>,
    pub mode: MultiChainMode,
    pub repo: Arc<dyn Repo>,
    pub registry: Arc<ContractRegistry>,
    pub processor: Processor,
    pub writer: StorageWriter,
    pub rollback_engine: RollbackEngine,
    pub tracker: CheckpointTracker,
    pub tasks: FetcherTasks,
    pub orderer: Orderer,
    pub pruning_config: Option<PruningConfig>,
    pub pruning_schedule: PruningSchedule,
    pub summary: IndexingSummary,
    pub stop: watch::Receiver<bool>,
}

impl Pipeline {
    pub async fn run(mut self) -> Result<IndexingSummary, MultidexingError> {
        let result = self.run_until_done().await;
        self.tasks.abort_all();

        if let Err(run_error) = &result {
            error!(
                checkpoints = ?self.last_processed_blocks(),
                %run_error,
                "indexing halted"
            );
        }

        result.map(|()| {
            let mut summary = std::mem::take(&mut self.summary);
            summary.checkpoints = self.tracker.all();

            summary
        })
    }

    async fn run_until_done(&mut self) -> Result<(), MultidexingError> {
        let chain_ids: Vec<ChainId> = self.chains.keys().copied().collect();
        for chain_id in chain_ids {
            self.start_fetcher(chain_id).await?;
        }

        loop {
            if *self.stop.borrow() {
                self.summary.stopped = true;
                break;
            }

            match self.orderer.next_step().await {
                OrdererStep::Unit(events) => self.handle_unit(events).await?,
                OrdererStep::Reorg(reorg) => self.handle_reorg(reorg).await?,
                OrdererStep::Failure(failure) => self.handle_failure(failure)?,
                OrdererStep::Stopped => {
                    self.summary.stopped = true;
                    break;
                }
                OrdererStep::Finished => {
                    info!("every chain finished");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn start_fetcher(&mut self, chain_id: ChainId) -> Result<(), MultidexingError> {
        let (Some(chain), Some(checkpoint)) = (self.chains.get(&chain_id), self.tracker.get(chain_id))
        else {
            return Ok(());
        };

        let (receiver, _generation) = self
            .tasks
            .spawn(chain, checkpoint)
            .await
            .map_err(|source| MultidexingError::ChainFailed { chain_id, source })?;
        self.orderer.add_lane(receiver);

        Ok(())
    }

    async fn handle_unit(&mut self, mut events: Vec<Event>) -> Result<(), MultidexingError> {
        let ProcessedUnit {
            applied_count,
            entity_changes,
            history,
            registrations,
        } = match self.processor.process(&events, &self.registry).await {
            Ok(processed) => processed,
            Err(ProcessingError::Repo(repo_error)) => return Err(repo_error.into()),
            Err(ProcessingError::Handler { event, error }) => {
                return self.handle_handler_failure(*event, error)
            }
        };

        let rest = events.split_off(applied_count);
        self.orderer.restore(rest);

        let (mut progress, mut block_refs) = self.orderer.progress(&events);

        // A new registration refetches its chain from the registering block
        let registering_event = events.last().filter(|_event| !registrations.is_empty()).cloned();
        if let Some(registering_event) = &registering_event {
            let resume_cap = registering_event.block_number.checked_sub(1);

            for chain_progress in &mut progress {
                if chain_progress.chain_id == registering_event.chain_id {
                    chain_progress.latest_processed_block_number =
                        chain_progress.latest_processed_block_number.min(resume_cap);
                    chain_progress.is_live = false;
                    chain_progress.is_finished = false;
                }
            }
            block_refs.retain(|recorded| {
                recorded.chain_id != registering_event.chain_id
                    || recorded.block.number < registering_event.block_number
            });
        }

        let checkpoints = self.tracker.updated(&progress);
        let unit = WriteUnit {
            raw_events: events,
            entity_changes,
            history,
            contract_registrations: registrations,
            checkpoints: checkpoints.clone(),
            block_refs,
        };
        if unit.is_empty() {
            return Ok(());
        }

        self.writer.commit(&unit).await?;
        self.tracker.replace(checkpoints);
        self.summary.units_committed += 1;
        self.summary.events_processed += unit.raw_events.len() as u64;

        debug!(
            events = unit.raw_events.len(),
            entity_changes = unit.entity_changes.len(),
            chains = progress.len(),
            "committed unit"
        );

        for checkpoint in &unit.checkpoints {
            if checkpoint.is_finished
                && progress.iter().any(|chain_progress| {
                    chain_progress.chain_id == checkpoint.chain_id && chain_progress.is_finished
                })
            {
                info!(
                    chain_id = checkpoint.chain_id,
                    latest_processed_block_number = ?checkpoint.latest_processed_block_number,
                    "chain finished"
                );
            }
        }

        if let Some(registering_event) = registering_event {
            info!(
                chain_id = registering_event.chain_id,
                block_number = registering_event.block_number,
                registrations = unit.contract_registrations.len(),
                "registered contracts, refetching"
            );

            self.start_fetcher(registering_event.chain_id).await?;
        }

        let chain_ids: Vec<ChainId> = progress.iter().map(|chain_progress| chain_progress.chain_id).collect();
        self.maybe_prune(&chain_ids).await
    }

    fn handle_handler_failure(&mut self, event: Event, source: HandlerError) -> Result<(), MultidexingError> {
        error!(
            chain_id = event.chain_id,
            block_number = event.block_number,
            log_index = event.log_index,
            event_name = %event.event_name,
            latest_processed_block_number = ?self.tracker.processed_block(event.chain_id),
            %source,
            "handler failed"
        );

        match self.mode {
            MultiChainMode::Ordered => Err(MultidexingError::Handler {
                chain_id: event.chain_id,
                block_number: event.block_number,
                log_index: event.log_index,
                source,
            }),
            MultiChainMode::Unordered => {
                self.degrade(event.chain_id);

                Ok(())
            }
        }
    }

    async fn handle_reorg(&mut self, reorg: ReorgCheckpoint) -> Result<(), MultidexingError> {
        let chain_id = reorg.chain_id;

        let plan = self
            .rollback_engine
            .plan(&reorg, &self.tracker)
            .await
            .map_err(|source| MultidexingError::RollbackFailed { chain_id, source })?;
        self.writer.apply_rollback(&plan).await?;

        self.tracker.replace(plan.checkpoints);
        self.registry.reload(&self.repo.load_contract_registrations().await?);
        self.summary.rollbacks += 1;

        warn!(
            chain_id,
            safe_block_number = reorg.safe_block.number,
            restored_entities = plan.restores.len(),
            rewound_chains = plan.rewinds.len(),
            "rolled back reorged blocks"
        );

        for rewind in plan.rewinds {
            if self.orderer.has_lane(rewind.chain_id) {
                self.start_fetcher(rewind.chain_id).await?;
            }
        }

        Ok(())
    }

    fn handle_failure(&mut self, failure: ChainFailure) -> Result<(), MultidexingError> {
        let ChainFailure {
            chain_id,
            generation,
            error: source,
        } = failure;

        if !self.tasks.is_current(chain_id, generation) {
            debug!(chain_id, generation, "ignoring failure of a replaced fetcher");
            return Ok(());
        }

        error!(
            chain_id,
            latest_processed_block_number = ?self.tracker.processed_block(chain_id),
            %source,
            "chain failed"
        );

        match self.mode {
            MultiChainMode::Ordered => Err(MultidexingError::ChainFailed { chain_id, source }),
            MultiChainMode::Unordered => {
                self.degrade(chain_id);

                Ok(())
            }
        }
    }

    fn degrade(&mut self, chain_id: ChainId) {
        self.tasks.abort(chain_id);
        self.orderer.remove_lane(chain_id);

        if !self.summary.degraded_chains.contains(&chain_id) {
            self.summary.degraded_chains.push(chain_id);
        }
    }

    async fn maybe_prune(&mut self, chain_ids: &[ChainId]) -> Result<(), MultidexingError> {
        let Some(pruning_config) = &self.pruning_config else {
            return Ok(());
        };

        for chain_id in chain_ids {
            let Some(processed) = self.tracker.processed_block(*chain_id) else {
                continue;
            };
            if !self.pruning_schedule.is_due(pruning_config, *chain_id) {
                continue;
            }

            let min_block_number = pruning_config.get_min_block_number(processed);
            self.repo.prune(*chain_id, min_block_number).await?;
            self.pruning_schedule.mark_pruned(*chain_id);

            info!(chain_id, min_block_number, "pruned stale data");
        }

        Ok(())
    }

    fn last_processed_blocks(&self) -> Vec<(ChainId, Option<u64>)> {
        self.tracker
            .all()
            .into_iter()
            .map(|checkpoint| (checkpoint.chain_id, checkpoint.latest_processed_block_number))
            .collect()
    }
}
