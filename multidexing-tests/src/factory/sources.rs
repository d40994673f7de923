use std::sync::{Arc, Mutex};
use std::time::Duration;

use multidexing::{BlockRef, ChainDataSource, ChainId, Event, EventsPage, SourceError, WatchedAddress};

struct MockChain {
    head_block_number: u64,
    genesis_timestamp: u64,
    block_time: u64,
    events: Vec<Event>,
    /// First block of every fork so far
    forks: Vec<u64>,
    latency: Duration,
    transient_failures_left: u32,
    malformed: bool,
    event_requests: u32,
}

/// Scripted chain data source. Every part of it can be replaced while an indexer reads from it.
#[derive(Clone)]
pub struct MockChainSource {
    chain_id: ChainId,
    chain: Arc<Mutex<MockChain>>,
}

impl MockChainSource {
    pub fn new(chain_id: ChainId, head_block_number: u64) -> Self {
        Self {
            chain_id,
            chain: Arc::new(Mutex::new(MockChain {
                head_block_number,
                genesis_timestamp: 0,
                block_time: 10,
                events: vec![],
                forks: vec![],
                latency: Duration::ZERO,
                transient_failures_left: 0,
                malformed: false,
                event_requests: 0,
            })),
        }
    }

    /// Shifts every block timestamp of this chain
    pub fn with_genesis_timestamp(self, genesis_timestamp: u64) -> Self {
        self.chain.lock().unwrap().genesis_timestamp = genesis_timestamp;

        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);

        self
    }

    pub fn with_events(self, events: Vec<Event>) -> Self {
        self.add_events(events);

        self
    }

    pub fn add_events(&self, events: Vec<Event>) {
        self.chain.lock().unwrap().events.extend(events);
    }

    pub fn set_head(&self, head_block_number: u64) {
        self.chain.lock().unwrap().head_block_number = head_block_number;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.chain.lock().unwrap().latency = latency;
    }

    /// Forks the chain: blocks from `block_number` on get new hashes and `replacements`
    /// take the place of their events
    pub fn reorg_from(&self, block_number: u64, replacements: Vec<Event>) {
        let mut chain = self.chain.lock().unwrap();

        chain.forks.push(block_number);
        chain.events.retain(|event| event.block_number < block_number);
        chain.events.extend(replacements);
    }

    pub fn fail_next_requests(&self, count: u32) {
        self.chain.lock().unwrap().transient_failures_left = count;
    }

    /// Every later event request returns undecodable data
    pub fn break_permanently(&self) {
        self.chain.lock().unwrap().malformed = true;
    }

    pub fn event_requests(&self) -> u32 {
        self.chain.lock().unwrap().event_requests
    }

    pub fn block(&self, block_number: u64) -> BlockRef {
        to_block(self.chain_id, &self.chain.lock().unwrap(), block_number)
    }

    async fn wait_latency(&self) {
        let latency = self.chain.lock().unwrap().latency;

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

fn to_block(chain_id: ChainId, chain: &MockChain, block_number: u64) -> BlockRef {
    let hash = |block_number: u64| {
        let fork = chain.forks.iter().filter(|fork| block_number >= **fork).count();

        format!("0x{chain_id}-{block_number}-{fork}")
    };

    BlockRef {
        number: block_number,
        hash: hash(block_number),
        parent_hash: match block_number.checked_sub(1) {
            Some(parent_number) => hash(parent_number),
            None => format!("0x{chain_id}-genesis"),
        },
        timestamp: chain.genesis_timestamp + block_number * chain.block_time,
    }
}

#[async_trait::async_trait]
impl ChainDataSource for MockChainSource {
    async fn get_head_block(&self, _chain_id: ChainId) -> Result<BlockRef, SourceError> {
        self.wait_latency().await;

        let chain = self.chain.lock().unwrap();
        Ok(to_block(self.chain_id, &chain, chain.head_block_number))
    }

    async fn get_block(&self, _chain_id: ChainId, block_number: u64) -> Result<BlockRef, SourceError> {
        self.wait_latency().await;

        Ok(self.block(block_number))
    }

    async fn get_events(
        &self,
        _chain_id: ChainId,
        from_block_number: u64,
        to_block_number: u64,
        watched_addresses: &[WatchedAddress],
    ) -> Result<EventsPage, SourceError> {
        self.wait_latency().await;

        let mut chain = self.chain.lock().unwrap();
        chain.event_requests += 1;

        if chain.malformed {
            return Err(SourceError::Malformed("undecodable log".to_string()));
        }
        if chain.transient_failures_left > 0 {
            chain.transient_failures_left -= 1;
            return Err(SourceError::Transient("connection reset by peer".to_string()));
        }

        let to_block_number = to_block_number.min(chain.head_block_number);
        let mut events: Vec<Event> = chain
            .events
            .iter()
            .filter(|event| (from_block_number..=to_block_number).contains(&event.block_number))
            .filter(|event| {
                watched_addresses
                    .iter()
                    .any(|watched| event.match_contract_address(&watched.address))
            })
            .map(|event| {
                let block = to_block(self.chain_id, &chain, event.block_number);

                Event {
                    chain_id: self.chain_id,
                    block_hash: block.hash,
                    block_timestamp: block.timestamp,
                    ..event.clone()
                }
            })
            .collect();
        events.sort_by_key(|event| event.position());

        Ok(EventsPage {
            events,
            first_block: to_block(self.chain_id, &chain, from_block_number),
            last_block: to_block(self.chain_id, &chain, to_block_number),
            blocks: (from_block_number..=to_block_number)
                .map(|block_number| to_block(self.chain_id, &chain, block_number))
                .collect(),
        })
    }
}
