use std::collections::VecDeque;

use crate::chain_reorg::ReorgCheckpoint;
use crate::event_queue::{QueueItem, QueueReceiver};
use crate::sources::BlockRef;
use crate::storage_writer::RecordedBlock;
use crate::{ChainId, ChainProgress, Event, EventKey};

/// The orderer's view of one chain: its queue and the events popped from it but not yet committed
#[derive(Debug)]
pub(crate) struct ChainLane {
    chain_id: ChainId,
    receiver: QueueReceiver,
    pending: VecDeque<Event>,
    fetched_through: Option<BlockRef>,
    batches_fetched: u64,
    unrecorded_blocks: Vec<BlockRef>,
    has_new_progress: bool,
    is_live: bool,
    is_finished: bool,
    is_closed: bool,
    reorg: Option<ReorgCheckpoint>,
}

impl ChainLane {
    pub fn new(receiver: QueueReceiver) -> Self {
        Self {
            chain_id: receiver.chain_id(),
            receiver,
            pending: VecDeque::new(),
            fetched_through: None,
            batches_fetched: 0,
            unrecorded_blocks: vec![],
            has_new_progress: false,
            is_live: false,
            is_finished: false,
            is_closed: false,
            reorg: None,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn absorb(&mut self, item: QueueItem) {
        match item {
            QueueItem::Batch(batch) => {
                self.is_live = batch.reached_head();
                self.batches_fetched = batch.batches_fetched;
                self.pending.extend(batch.events);
                self.unrecorded_blocks.extend(batch.block_refs);
                self.fetched_through = Some(batch.last_block);
                self.has_new_progress = true;
            }
            QueueItem::Reorg(reorg) => self.reorg = Some(reorg),
            QueueItem::Finished => {
                self.is_finished = true;
                self.has_new_progress = true;
            }
        }
    }

    /// Absorbs queued items until a batch of events is pending or a reorg shows up.
    /// Items behind pending events stay queued, so a full queue holds back the fetcher.
    pub fn drain_ready(&mut self) {
        while self.pending.is_empty() && self.reorg.is_none() && !self.is_closed {
            match self.receiver.try_pop() {
                Ok(Some(item)) => self.absorb(item),
                Ok(None) => break,
                Err(_closed) => self.is_closed = true,
            }
        }
    }

    /// Waits for one more item
    pub async fn wait_item(&mut self) {
        match self.receiver.pop().await {
            Some(item) => self.absorb(item),
            None => self.is_closed = true,
        }
    }

    pub fn take_reorg(&mut self) -> Option<ReorgCheckpoint> {
        self.reorg.take()
    }

    pub fn front_key(&self) -> Option<EventKey> {
        self.pending.front().map(Event::key)
    }

    pub fn pop_front(&mut self) -> Option<Event> {
        self.pending.pop_front()
    }

    pub fn take_front(&mut self, max_events: usize) -> Vec<Event> {
        let count = max_events.min(self.pending.len());

        self.pending.drain(..count).collect()
    }

    /// Puts events back in front of the pending ones, keeping their order
    pub fn restore(&mut self, events: Vec<Event>) {
        for event in events.into_iter().rev() {
            self.pending.push_front(event);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn has_new_progress(&self) -> bool {
        self.has_new_progress
    }

    pub fn is_done(&self) -> bool {
        self.is_finished && self.pending.is_empty()
    }

    /// Whether waiting on the queue can yield anything. Never while events are pending.
    pub fn is_waitable(&self) -> bool {
        self.pending.is_empty() && !self.is_finished && !self.is_closed && self.reorg.is_none()
    }

    /// Whether this lane can no longer produce an event ordered before `key`
    pub fn cannot_precede(&self, key: &EventKey) -> bool {
        if self.is_finished || self.is_live {
            return true;
        }

        self.fetched_through.as_ref().is_some_and(|block| {
            *key < EventKey {
                block_timestamp: block.timestamp,
                chain_id: self.chain_id,
                block_number: block.number + 1,
                log_index: 0,
            }
        })
    }

    /// Progress made since the last call, `committed` being this lane's events of the unit
    pub fn progress(&mut self, committed: &[Event]) -> Option<(ChainProgress, Vec<RecordedBlock>)> {
        if committed.is_empty() && !self.has_new_progress {
            return None;
        }
        self.has_new_progress = false;

        let latest_processed_block_number = match self.pending.front() {
            Some(next_event) => next_event.block_number.checked_sub(1),
            None => self.fetched_through.as_ref().map(|block| block.number),
        };
        let recorded_blocks = match latest_processed_block_number {
            Some(processed) => {
                let (recorded, unrecorded) = std::mem::take(&mut self.unrecorded_blocks)
                    .into_iter()
                    .partition(|block| block.number <= processed);
                self.unrecorded_blocks = unrecorded;

                recorded
            }
            None => vec![],
        };

        let progress = ChainProgress {
            chain_id: self.chain_id,
            latest_fetched_block_number: self.fetched_through.as_ref().map(|block| block.number),
            latest_processed_block_number,
            processed_position: committed.last().map(Event::position),
            events_processed: committed.len() as u64,
            batches_fetched: self.batches_fetched,
            first_event_block_number: committed.first().map(|event| event.block_number),
            is_live: self.is_live && self.pending.is_empty(),
            is_finished: self.is_done(),
        };
        let recorded_blocks = recorded_blocks
            .into_iter()
            .map(|block| RecordedBlock {
                chain_id: self.chain_id,
                block,
            })
            .collect();

        Some((progress, recorded_blocks))
    }
}
