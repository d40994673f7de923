mod batch_size;
mod error;
mod recorded_blocks;

pub use batch_size::BatchSize;
pub use error::IngesterError;
pub use recorded_blocks::RecordedBlocks;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::chain_reorg::ReorgCheckpoint;
use crate::contract_registry::ContractRegistry;
use crate::event_queue::{self, FetchedBatch, QueueItem, QueueReceiver, QueueSender};
use crate::handlers::Handlers;
use crate::sources::{BlockRef, ChainDataSource, EventsPage, SourceError, WatchedAddress};
use crate::{Chain, ChainCheckpoint, ChainId, Config, Event, EventPosition, Repo};

const MAX_BACKOFF_MS: u64 = 30_000;

/// Sleeps `base_ms * 2^retries_so_far`, capped
pub(crate) async fn backoff(base_ms: u64, retries_so_far: u32) {
    let delay_ms = base_ms
        .saturating_mul(2u64.saturating_pow(retries_so_far))
        .min(MAX_BACKOFF_MS);

    sleep(Duration::from_millis(delay_ms)).await;
}

#[derive(Clone, Debug)]
pub(crate) struct FetchSettings {
    pub blocks_per_batch: u64,
    pub min_blocks_per_batch: u64,
    pub max_blocks_per_batch: u64,
    pub target_batch_response_ms: u64,
    pub max_events_per_response: usize,
    pub max_fetch_retries: u32,
    pub retry_backoff_ms: u64,
    pub head_polling_rate_ms: u64,
    pub max_recorded_blocks: usize,
    pub queue_depth: usize,
}

impl FetchSettings {
    pub fn new(config: &Config) -> Self {
        Self {
            blocks_per_batch: config.blocks_per_batch,
            min_blocks_per_batch: config.min_blocks_per_batch,
            max_blocks_per_batch: config.max_blocks_per_batch,
            target_batch_response_ms: config.target_batch_response_ms,
            max_events_per_response: config.max_events_per_response,
            max_fetch_retries: config.max_fetch_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            head_polling_rate_ms: config.head_polling_rate_ms,
            max_recorded_blocks: config.max_recorded_blocks,
            queue_depth: config.queue_depth,
        }
    }

    fn batch_size(&self) -> BatchSize {
        BatchSize::new(
            self.blocks_per_batch,
            self.min_blocks_per_batch,
            self.max_blocks_per_batch,
            Duration::from_millis(self.target_batch_response_ms),
            self.max_events_per_response,
        )
    }
}

/// Cursor of one chain's fetcher. Only the fetcher task touches it.
#[derive(Clone, Debug)]
pub struct FetchState {
    pub chain_id: ChainId,
    pub next_block_number: u64,
    pub end_block_number: Option<u64>,
    pub head: Option<BlockRef>,
    pub batch_size: BatchSize,
    pub batches_fetched: u64,
}

#[derive(Debug)]
pub(crate) enum FetchOutcome {
    Batch(FetchedBatch),
    Reorg(ReorgCheckpoint),
    AtHead,
    Finished,
}

/// Reported by a fetcher right before its task ends
#[derive(Debug)]
pub(crate) struct ChainFailure {
    pub chain_id: ChainId,
    /// Which spawn of the chain's fetcher failed, so reports of aborted fetchers can be ignored
    pub generation: u64,
    pub error: IngesterError,
}

pub(crate) struct Fetcher {
    source: Arc<dyn ChainDataSource>,
    registry: Arc<ContractRegistry>,
    handlers: Arc<Handlers>,
    settings: FetchSettings,
    state: FetchState,
    recorded_blocks: RecordedBlocks,
    skip_through: Option<EventPosition>,
}

impl Fetcher {
    pub fn new(
        chain: &Chain,
        checkpoint: &ChainCheckpoint,
        recorded_blocks: RecordedBlocks,
        registry: Arc<ContractRegistry>,
        handlers: Arc<Handlers>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            source: chain.source().clone(),
            registry,
            handlers,
            state: FetchState {
                chain_id: chain.id,
                next_block_number: checkpoint.resume_block_number(),
                end_block_number: chain.end_block_number,
                head: None,
                batch_size: settings.batch_size(),
                batches_fetched: checkpoint.batches_fetched,
            },
            settings,
            recorded_blocks,
            skip_through: checkpoint.skip_through(),
        }
    }

    pub fn state(&self) -> &FetchState {
        &self.state
    }

    pub async fn fetch_next(&mut self) -> Result<FetchOutcome, IngesterError> {
        let chain_id = self.state.chain_id;
        let from_block_number = self.state.next_block_number;

        if self
            .state
            .end_block_number
            .is_some_and(|end_block_number| from_block_number > end_block_number)
        {
            return Ok(FetchOutcome::Finished);
        }

        let head_block_number = match &self.state.head {
            Some(head) if head.number >= from_block_number => head.number,
            _ => {
                let source = self.source.clone();
                let head = self
                    .retry("get_head_block", || source.get_head_block(chain_id))
                    .await?;
                let head_block_number = head.number;
                self.state.head = Some(head);

                head_block_number
            }
        };

        if head_block_number < from_block_number {
            return Ok(FetchOutcome::AtHead);
        }

        let watched_addresses = self.registry.watched_addresses(chain_id);
        let started_at = Instant::now();
        let page = self
            .fetch_events(from_block_number, head_block_number, &watched_addresses)
            .await?;
        let elapsed = started_at.elapsed();

        if let Some(recorded_parent) = from_block_number
            .checked_sub(1)
            .and_then(|parent_number| self.recorded_blocks.get(parent_number))
        {
            if recorded_parent.hash != page.first_block.parent_hash {
                warn!(
                    chain_id,
                    block_number = from_block_number,
                    "parent hash changed, locating safe block"
                );

                return self.locate_safe_block().await.map(FetchOutcome::Reorg);
            }
        }

        let events_count = page.events.len();
        let batch = self.to_batch(from_block_number, head_block_number, page, &watched_addresses);
        self.state.batch_size.adjust(elapsed, events_count);

        debug!(
            chain_id,
            from_block_number,
            to_block_number = batch.last_block.number,
            events = batch.events.len(),
            batch_size = self.state.batch_size.get(),
            "fetched batch"
        );

        Ok(FetchOutcome::Batch(batch))
    }

    fn to_batch(
        &mut self,
        from_block_number: u64,
        head_block_number: u64,
        EventsPage {
            mut events,
            first_block,
            last_block,
            blocks,
        }: EventsPage,
        watched_addresses: &[WatchedAddress],
    ) -> FetchedBatch {
        let start_blocks: HashMap<&str, u64> = watched_addresses
            .iter()
            .map(|watched| (watched.address.as_str(), watched.start_block_number))
            .collect();
        let skip_through = self.skip_through;

        events.retain(|event| {
            self.handlers.has_handler(&event.contract_name, &event.event_name)
                && start_blocks
                    .get(event.contract_address.to_lowercase().as_str())
                    .is_some_and(|start_block_number| *start_block_number <= event.block_number)
                && skip_through.map_or(true, |position| event.position() > position)
        });
        events.sort_by_key(|event| event.position());

        if skip_through.is_some_and(|position| last_block.number >= position.block_number) {
            self.skip_through = None;
        }

        let block_refs = self.block_refs_to_record(first_block, &last_block, blocks, &events);
        for block in &block_refs {
            self.recorded_blocks.record(block.clone());
        }

        self.state.next_block_number = last_block.number + 1;
        self.state.batches_fetched += 1;

        FetchedBatch {
            chain_id: self.state.chain_id,
            from_block_number,
            last_block,
            head_block_number,
            events,
            batches_fetched: self.state.batches_fetched,
            block_refs,
        }
    }

    /// Blocks of a batch worth remembering: the range edges, the blocks around kept events and the
    /// latest `max_recorded_blocks`. The processed cursor of the batch is always among them.
    fn block_refs_to_record(
        &self,
        first_block: BlockRef,
        last_block: &BlockRef,
        blocks: Vec<BlockRef>,
        events: &[Event],
    ) -> Vec<BlockRef> {
        let window_start = last_block
            .number
            .saturating_sub(self.settings.max_recorded_blocks as u64);
        let around_events: HashSet<u64> = events
            .iter()
            .flat_map(|event| [event.block_number.checked_sub(1), Some(event.block_number)])
            .flatten()
            .collect();

        let mut block_refs: BTreeMap<u64, BlockRef> = blocks
            .into_iter()
            .filter(|block| (first_block.number..=last_block.number).contains(&block.number))
            .filter(|block| block.number > window_start || around_events.contains(&block.number))
            .map(|block| (block.number, block))
            .collect();
        block_refs.insert(first_block.number, first_block);
        block_refs.insert(last_block.number, last_block.clone());

        block_refs.into_values().collect()
    }

    /// Requests events, halving the range before every retry of a transient failure
    async fn fetch_events(
        &mut self,
        from_block_number: u64,
        head_block_number: u64,
        watched_addresses: &[WatchedAddress],
    ) -> Result<EventsPage, IngesterError> {
        let chain_id = self.state.chain_id;
        let mut retries_so_far = 0;

        loop {
            let to_block_number = (from_block_number + self.state.batch_size.get() - 1)
                .min(head_block_number)
                .min(self.state.end_block_number.unwrap_or(u64::MAX));

            match self
                .source
                .get_events(chain_id, from_block_number, to_block_number, watched_addresses)
                .await
            {
                Ok(page) => return Ok(page),
                Err(SourceError::Malformed(message)) => return Err(IngesterError::Malformed(message)),
                Err(source_error) if retries_so_far < self.settings.max_fetch_retries => {
                    warn!(chain_id, retries_so_far, %source_error, "fetching events failed, retrying");

                    self.state.batch_size.shrink();
                    backoff(self.settings.retry_backoff_ms, retries_so_far).await;
                    retries_so_far += 1;
                }
                Err(last_error) => {
                    return Err(IngesterError::RetriesExhausted {
                        operation: "get_events",
                        attempts: retries_so_far + 1,
                        last_error,
                    })
                }
            }
        }
    }

    /// Walks recorded blocks downwards until one still has the hash the source reports
    async fn locate_safe_block(&mut self) -> Result<ReorgCheckpoint, IngesterError> {
        let chain_id = self.state.chain_id;
        let source = self.source.clone();

        for recorded in self.recorded_blocks.descending() {
            let current = self
                .retry("get_block", || source.get_block(chain_id, recorded.number))
                .await?;

            if current.hash == recorded.hash {
                self.recorded_blocks.truncate_above(recorded.number);
                self.state.next_block_number = recorded.number + 1;
                self.state.head = None;

                return Ok(ReorgCheckpoint {
                    chain_id,
                    safe_block: current,
                });
            }
        }

        Err(IngesterError::ReorgBeyondWindow {
            lowest_recorded_block: self.recorded_blocks.lowest_block_number().unwrap_or_default(),
        })
    }

    async fn retry<T, F, Fut>(&self, operation: &'static str, mut request: F) -> Result<T, IngesterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut retries_so_far = 0;

        loop {
            match request().await {
                Ok(value) => return Ok(value),
                Err(SourceError::Malformed(message)) => return Err(IngesterError::Malformed(message)),
                Err(source_error) if retries_so_far < self.settings.max_fetch_retries => {
                    warn!(
                        chain_id = self.state.chain_id,
                        operation,
                        retries_so_far,
                        %source_error,
                        "source request failed, retrying"
                    );

                    backoff(self.settings.retry_backoff_ms, retries_so_far).await;
                    retries_so_far += 1;
                }
                Err(last_error) => {
                    return Err(IngesterError::RetriesExhausted {
                        operation,
                        attempts: retries_so_far + 1,
                        last_error,
                    })
                }
            }
        }
    }

    /// Fetches until the chain finishes, reorgs or fails, pushing everything into `sender`
    pub async fn run(
        mut self,
        sender: QueueSender,
        failures: mpsc::UnboundedSender<ChainFailure>,
        generation: u64,
    ) {
        let chain_id = self.state.chain_id;

        loop {
            let item = match self.fetch_next().await {
                Ok(FetchOutcome::Batch(batch)) => QueueItem::Batch(batch),
                Ok(FetchOutcome::AtHead) => {
                    sleep(Duration::from_millis(self.settings.head_polling_rate_ms)).await;
                    continue;
                }
                Ok(FetchOutcome::Reorg(reorg)) => {
                    warn!(chain_id, safe_block_number = reorg.safe_block.number, "chain reorganized");

                    let _ = sender.push(QueueItem::Reorg(reorg)).await;
                    return;
                }
                Ok(FetchOutcome::Finished) => {
                    info!(chain_id, "reached end block");

                    let _ = sender.push(QueueItem::Finished).await;
                    return;
                }
                Err(fetch_error) => {
                    error!(
                        chain_id,
                        next_block_number = self.state.next_block_number,
                        %fetch_error,
                        "fetcher failed"
                    );

                    let _ = failures.send(ChainFailure {
                        chain_id,
                        generation,
                        error: fetch_error,
                    });
                    return;
                }
            };

            if sender.push(item).await.is_err() {
                return;
            }
        }
    }
}

/// Fetcher tasks of every chain, restartable one chain at a time
pub(crate) struct FetcherTasks {
    repo: Arc<dyn Repo>,
    registry: Arc<ContractRegistry>,
    handlers: Arc<Handlers>,
    settings: FetchSettings,
    failures: mpsc::UnboundedSender<ChainFailure>,
    handles: HashMap<ChainId, JoinHandle<()>>,
    generations: HashMap<ChainId, u64>,
}

impl FetcherTasks {
    pub fn new(
        config: &Config,
        registry: Arc<ContractRegistry>,
        handlers: Arc<Handlers>,
        failures: mpsc::UnboundedSender<ChainFailure>,
    ) -> Self {
        Self {
            repo: config.repo.clone(),
            registry,
            handlers,
            settings: FetchSettings::new(config),
            failures,
            handles: HashMap::new(),
            generations: HashMap::new(),
        }
    }

    /// Starts a fresh fetcher from `checkpoint`, replacing any running one
    pub async fn spawn(
        &mut self,
        chain: &Chain,
        checkpoint: &ChainCheckpoint,
    ) -> Result<(QueueReceiver, u64), IngesterError> {
        self.abort(chain.id);

        let recent_blocks =
            self.repo.load_recent_blocks(chain.id, self.settings.max_recorded_blocks).await?;
        let fetcher = Fetcher::new(
            chain,
            checkpoint,
            RecordedBlocks::new(self.settings.max_recorded_blocks, recent_blocks),
            self.registry.clone(),
            self.handlers.clone(),
            self.settings.clone(),
        );

        let generation = self.generations.entry(chain.id).or_default();
        *generation += 1;
        let generation = *generation;

        let (sender, receiver) = event_queue::channel(chain.id, self.settings.queue_depth);
        let handle = tokio::spawn(fetcher.run(sender, self.failures.clone(), generation));
        self.handles.insert(chain.id, handle);

        info!(
            chain_id = chain.id,
            generation,
            from_block_number = checkpoint.resume_block_number(),
            "started fetcher"
        );

        Ok((receiver, generation))
    }

    pub fn is_current(&self, chain_id: ChainId, generation: u64) -> bool {
        self.generations.get(&chain_id) == Some(&generation)
    }

    pub fn abort(&mut self, chain_id: ChainId) {
        if let Some(handle) = self.handles.remove(&chain_id) {
            handle.abort();
        }
    }

    pub fn abort_all(&mut self) {
        for (_chain_id, handle) in self.handles.drain() {
            handle.abort();
        }
    }
}

impl Drop for FetcherTasks {
    fn drop(&mut self) {
        self.abort_all();
    }
}
