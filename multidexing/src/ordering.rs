mod chain_lane;

use std::collections::BTreeMap;
use std::future::pending;

use futures_util::future::select_all;
use tokio::sync::{mpsc, watch};

use crate::chain_reorg::ReorgCheckpoint;
use crate::event_queue::QueueReceiver;
use crate::ingester::ChainFailure;
use crate::storage_writer::RecordedBlock;
use crate::{ChainId, ChainProgress, Event, MultiChainMode};

use chain_lane::ChainLane;

#[derive(Debug)]
pub(crate) enum OrdererStep {
    /// Events to process as one commit unit. Empty when only progress changed.
    Unit(Vec<Event>),
    Reorg(ReorgCheckpoint),
    Failure(ChainFailure),
    Stopped,
    /// Every lane finished and nothing is pending
    Finished,
}

/// Merges per-chain queues into commit units
pub(crate) struct Orderer {
    mode: MultiChainMode,
    max_events_per_unit: usize,
    lanes: BTreeMap<ChainId, ChainLane>,
    last_served_chain_id: Option<ChainId>,
    stop: watch::Receiver<bool>,
    failures: mpsc::UnboundedReceiver<ChainFailure>,
}

impl Orderer {
    pub fn new(
        mode: MultiChainMode,
        max_events_per_unit: usize,
        stop: watch::Receiver<bool>,
        failures: mpsc::UnboundedReceiver<ChainFailure>,
    ) -> Self {
        Self {
            mode,
            max_events_per_unit: max_events_per_unit.max(1),
            lanes: BTreeMap::new(),
            last_served_chain_id: None,
            stop,
            failures,
        }
    }

    /// Starts reading from a (re)spawned fetcher. Pending events of a replaced lane are dropped.
    pub fn add_lane(&mut self, receiver: QueueReceiver) {
        self.lanes.insert(receiver.chain_id(), ChainLane::new(receiver));
    }

    pub fn remove_lane(&mut self, chain_id: ChainId) {
        self.lanes.remove(&chain_id);
    }

    pub fn has_lane(&self, chain_id: ChainId) -> bool {
        self.lanes.contains_key(&chain_id)
    }

    /// Returns events of an unfinished unit to their lanes
    pub fn restore(&mut self, events: Vec<Event>) {
        let mut events_per_chain: BTreeMap<ChainId, Vec<Event>> = BTreeMap::new();
        for event in events {
            events_per_chain.entry(event.chain_id).or_default().push(event);
        }

        for (chain_id, events) in events_per_chain {
            if let Some(lane) = self.lanes.get_mut(&chain_id) {
                lane.restore(events);
            }
        }
    }

    /// Progress of every lane that changed since the last call, given the committed events
    pub fn progress(&mut self, committed: &[Event]) -> (Vec<ChainProgress>, Vec<RecordedBlock>) {
        let mut progress = vec![];
        let mut recorded_blocks = vec![];

        for lane in self.lanes.values_mut() {
            let lane_events: Vec<_> = committed
                .iter()
                .filter(|event| event.chain_id == lane.chain_id())
                .cloned()
                .collect();

            if let Some((lane_progress, lane_blocks)) = lane.progress(&lane_events) {
                progress.push(lane_progress);
                recorded_blocks.extend(lane_blocks);
            }
        }

        (progress, recorded_blocks)
    }

    pub async fn next_step(&mut self) -> OrdererStep {
        loop {
            for lane in self.lanes.values_mut() {
                lane.drain_ready();
            }

            if let Some(reorg) = self.lanes.values_mut().find_map(ChainLane::take_reorg) {
                return OrdererStep::Reorg(reorg);
            }
            if let Ok(failure) = self.failures.try_recv() {
                return OrdererStep::Failure(failure);
            }

            let (events, awaited_chain_ids) = match self.mode {
                MultiChainMode::Unordered => self.take_unordered(),
                MultiChainMode::Ordered => self.take_ordered(),
            };

            if !events.is_empty() || self.lanes.values().any(ChainLane::has_new_progress) {
                return OrdererStep::Unit(events);
            }
            if self.lanes.values().all(ChainLane::is_done) {
                return OrdererStep::Finished;
            }

            if let Some(step) = self.wait(&awaited_chain_ids).await {
                return step;
            }
        }
    }

    /// Events of the next chain with pending events, round robin
    fn take_unordered(&mut self) -> (Vec<Event>, Vec<ChainId>) {
        let ready: Vec<ChainId> = self
            .lanes
            .values()
            .filter(|lane| lane.has_pending())
            .map(ChainLane::chain_id)
            .collect();

        let next_chain_id = ready
            .iter()
            .find(|chain_id| Some(**chain_id) > self.last_served_chain_id)
            .or_else(|| ready.first())
            .copied();

        let Some(chain_id) = next_chain_id else {
            return (vec![], self.waitable_chain_ids());
        };
        self.last_served_chain_id = Some(chain_id);

        let max_events_per_unit = self.max_events_per_unit;
        let events = self
            .lanes
            .get_mut(&chain_id)
            .map(|lane| lane.take_front(max_events_per_unit))
            .unwrap_or_default();

        (events, vec![])
    }

    /// Takes events in global key order while no lane could still produce an earlier one
    fn take_ordered(&mut self) -> (Vec<Event>, Vec<ChainId>) {
        let mut events = vec![];

        while events.len() < self.max_events_per_unit {
            let Some((chain_id, key)) = self
                .lanes
                .values()
                .filter_map(|lane| lane.front_key().map(|key| (lane.chain_id(), key)))
                .min_by_key(|(_chain_id, key)| *key)
            else {
                return (events, self.waitable_chain_ids());
            };

            let blocking: Vec<ChainId> = self
                .lanes
                .values()
                .filter(|lane| {
                    lane.chain_id() != chain_id && !lane.has_pending() && !lane.cannot_precede(&key)
                })
                .map(ChainLane::chain_id)
                .collect();
            if !blocking.is_empty() {
                return (events, blocking);
            }

            if let Some(event) = self.lanes.get_mut(&chain_id).and_then(ChainLane::pop_front) {
                events.push(event);
            }
        }

        (events, vec![])
    }

    fn waitable_chain_ids(&self) -> Vec<ChainId> {
        self.lanes
            .values()
            .filter(|lane| lane.is_waitable())
            .map(ChainLane::chain_id)
            .collect()
    }

    /// Waits until one of `chain_ids` yields an item, a fetcher fails or a stop is requested
    async fn wait(&mut self, chain_ids: &[ChainId]) -> Option<OrdererStep> {
        let Self {
            lanes,
            stop,
            failures,
            ..
        } = self;

        let waits: Vec<_> = lanes
            .values_mut()
            .filter(|lane| chain_ids.contains(&lane.chain_id()) && lane.is_waitable())
            .map(|lane| Box::pin(lane.wait_item()))
            .collect();
        let lane_item = async move {
            if waits.is_empty() {
                pending::<()>().await;
            } else {
                select_all(waits).await;
            }
        };

        tokio::select! {
            () = stop_requested(stop) => Some(OrdererStep::Stopped),
            Some(failure) = failures.recv() => Some(OrdererStep::Failure(failure)),
            () = lane_item => None,
        }
    }
}

/// Resolves once a stop is requested. A dropped sender never requests one.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::event_queue::{self, FetchedBatch, QueueItem, QueueSender};
    use crate::test_support::{block, deposit};

    struct Harness {
        orderer: Orderer,
        senders: BTreeMap<ChainId, QueueSender>,
        stop: watch::Sender<bool>,
        failures: mpsc::UnboundedSender<ChainFailure>,
    }

    fn harness(mode: MultiChainMode, chain_ids: &[ChainId], max_events_per_unit: usize) -> Harness {
        let (stop, stop_receiver) = watch::channel(false);
        let (failures, failures_receiver) = mpsc::unbounded_channel();
        let mut orderer = Orderer::new(mode, max_events_per_unit, stop_receiver, failures_receiver);
        let mut senders = BTreeMap::new();

        for chain_id in chain_ids {
            let (sender, receiver) = event_queue::channel(*chain_id, 8);
            orderer.add_lane(receiver);
            senders.insert(*chain_id, sender);
        }

        Harness {
            orderer,
            senders,
            stop,
            failures,
        }
    }

    fn batch(chain_id: ChainId, from: u64, to: u64, head: u64, events: Vec<Event>) -> QueueItem {
        QueueItem::Batch(FetchedBatch {
            chain_id,
            from_block_number: from,
            last_block: block(chain_id, to),
            head_block_number: head,
            events,
            batches_fetched: 1,
            block_refs: vec![block(chain_id, to)],
        })
    }

    impl Harness {
        async fn push_batch(&self, chain_id: ChainId, from: u64, to: u64, head: u64, events: Vec<Event>) {
            self.senders[&chain_id]
                .push(batch(chain_id, from, to, head, events))
                .await
                .unwrap();
        }

        async fn next_events(&mut self) -> Vec<Event> {
            match self.orderer.next_step().await {
                OrdererStep::Unit(events) => {
                    self.orderer.progress(&events);
                    events
                }
                other => panic!("expected a unit, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn serves_chains_round_robin_when_unordered() {
        let mut harness = harness(MultiChainMode::Unordered, &[1, 2], 10);
        harness
            .push_batch(1, 0, 9, 100, vec![deposit(1, 1, 0, "alice", 1), deposit(1, 2, 0, "alice", 1)])
            .await;
        harness.push_batch(2, 0, 9, 100, vec![deposit(2, 1, 0, "bob", 1)]).await;

        let first = harness.next_events().await;
        let second = harness.next_events().await;

        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|event| event.chain_id == 1));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].chain_id, 2);
    }

    #[tokio::test]
    async fn a_silent_chain_never_blocks_unordered_mode() {
        let mut harness = harness(MultiChainMode::Unordered, &[1, 2], 10);
        harness.push_batch(2, 0, 9, 100, vec![deposit(2, 4, 0, "bob", 1)]).await;

        let events = tokio::time::timeout(Duration::from_secs(1), harness.next_events())
            .await
            .unwrap();

        assert_eq!(events[0].chain_id, 2);
    }

    #[tokio::test]
    async fn releases_events_in_global_key_order() {
        let mut harness = harness(MultiChainMode::Ordered, &[1, 2], 10);
        harness
            .push_batch(1, 0, 9, 100, vec![deposit(1, 2, 0, "alice", 1), deposit(1, 6, 0, "alice", 1)])
            .await;
        harness.push_batch(2, 0, 9, 100, vec![deposit(2, 4, 0, "bob", 1)]).await;

        let events = harness.next_events().await;

        assert_eq!(
            events.iter().map(|event| (event.chain_id, event.block_number)).collect::<Vec<_>>(),
            vec![(1, 2), (2, 4), (1, 6)]
        );
    }

    #[tokio::test]
    async fn waits_for_a_lagging_chain_when_ordered() {
        let mut harness = harness(MultiChainMode::Ordered, &[1, 2], 10);
        harness.push_batch(1, 0, 9, 100, vec![deposit(1, 8, 0, "alice", 1)]).await;
        harness.push_batch(2, 0, 4, 100, vec![]).await;

        // Chain 2 only proved blocks up to 4, so chain 1's block 8 event waits
        assert!(harness.next_events().await.is_empty());
        assert!(tokio::time::timeout(Duration::from_millis(50), harness.orderer.next_step())
            .await
            .is_err());

        harness.push_batch(2, 5, 9, 100, vec![deposit(2, 7, 0, "bob", 1)]).await;
        let events = harness.next_events().await;

        assert_eq!(
            events.iter().map(|event| (event.chain_id, event.block_number)).collect::<Vec<_>>(),
            vec![(2, 7), (1, 8)]
        );
    }

    #[tokio::test]
    async fn a_full_queue_holds_back_a_chain_waiting_on_another() {
        let (_stop, stop_receiver) = watch::channel(false);
        let (_failures, failures_receiver) = mpsc::unbounded_channel();
        let mut orderer = Orderer::new(MultiChainMode::Ordered, 10, stop_receiver, failures_receiver);
        let (ahead, ahead_receiver) = event_queue::channel(1, 1);
        let (lagging, lagging_receiver) = event_queue::channel(2, 1);
        orderer.add_lane(ahead_receiver);
        orderer.add_lane(lagging_receiver);

        let pushed = Arc::new(AtomicU64::new(0));
        let producer = tokio::spawn({
            let pushed = pushed.clone();
            async move {
                for batch_number in 0u64.. {
                    let from = 1_000 + batch_number * 10;
                    let events = vec![deposit(1, from, 0, "alice", 1)];
                    if ahead.push(batch(1, from, from + 9, 100_000, events)).await.is_err() {
                        return;
                    }
                    pushed.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        // Chain 2 only ever proves blocks far below chain 1's first event
        for block_number in 0..50 {
            lagging
                .push(batch(2, block_number, block_number, 100_000, vec![]))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;

            match orderer.next_step().await {
                OrdererStep::Unit(events) => {
                    assert!(events.is_empty());
                    orderer.progress(&events);
                }
                other => panic!("expected a unit, got {other:?}"),
            }
        }

        // One batch pending in the lane and one in the queue
        assert_eq!(pushed.load(Ordering::SeqCst), 2);
        producer.abort();
    }

    #[tokio::test]
    async fn a_live_chain_does_not_block_ordered_mode() {
        let mut harness = harness(MultiChainMode::Ordered, &[1, 2], 10);
        harness.push_batch(1, 0, 9, 100, vec![deposit(1, 8, 0, "alice", 1)]).await;
        harness.push_batch(2, 0, 4, 4, vec![]).await;

        let events = harness.next_events().await;

        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn caps_units_at_the_configured_size() {
        let mut harness = harness(MultiChainMode::Ordered, &[1], 2);
        let events = (1..=5).map(|block_number| deposit(1, block_number, 0, "alice", 1)).collect();
        harness.push_batch(1, 0, 9, 100, events).await;

        assert_eq!(harness.next_events().await.len(), 2);
        assert_eq!(harness.next_events().await.len(), 2);
        assert_eq!(harness.next_events().await.len(), 1);
    }

    #[tokio::test]
    async fn restored_events_come_back_first() {
        let mut harness = harness(MultiChainMode::Unordered, &[1], 10);
        harness
            .push_batch(1, 0, 9, 100, vec![deposit(1, 1, 0, "alice", 1), deposit(1, 2, 0, "alice", 1)])
            .await;

        let OrdererStep::Unit(mut events) = harness.orderer.next_step().await else {
            panic!("expected a unit");
        };
        let rest = events.split_off(1);
        harness.orderer.restore(rest);
        harness.orderer.progress(&events);

        let next = harness.next_events().await;
        assert_eq!(next[0].block_number, 2);
    }

    #[tokio::test]
    async fn surfaces_reorgs_failures_and_stops() {
        let mut harness = harness(MultiChainMode::Unordered, &[1, 2], 10);

        harness.senders[&1]
            .push(QueueItem::Reorg(ReorgCheckpoint {
                chain_id: 1,
                safe_block: block(1, 3),
            }))
            .await
            .unwrap();
        assert!(matches!(harness.orderer.next_step().await, OrdererStep::Reorg(_)));

        harness
            .failures
            .send(ChainFailure {
                chain_id: 2,
                generation: 1,
                error: crate::IngesterError::Malformed("bad log".to_string()),
            })
            .unwrap();
        assert!(matches!(harness.orderer.next_step().await, OrdererStep::Failure(_)));

        harness.stop.send(true).unwrap();
        assert!(matches!(harness.orderer.next_step().await, OrdererStep::Stopped));
    }

    #[tokio::test]
    async fn finishes_once_every_lane_is_done() {
        let mut harness = harness(MultiChainMode::Unordered, &[1], 10);
        harness.push_batch(1, 0, 9, 9, vec![]).await;
        harness.senders[&1].push(QueueItem::Finished).await.unwrap();

        assert!(harness.next_events().await.is_empty());
        assert!(matches!(harness.orderer.next_step().await, OrdererStep::Finished));
    }
}
