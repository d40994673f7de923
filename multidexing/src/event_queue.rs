use thiserror::Error;
use tokio::sync::mpsc;

use crate::chain_reorg::ReorgCheckpoint;
use crate::sources::BlockRef;
use crate::{ChainId, Event};

/// Events of one fetched block range, in `(block_number, log_index)` order
#[derive(Clone, Debug, PartialEq)]
pub struct FetchedBatch {
    pub chain_id: ChainId,
    pub from_block_number: u64,
    /// Last block the range actually covered
    pub last_block: BlockRef,
    pub head_block_number: u64,
    pub events: Vec<Event>,
    /// Batches this chain's fetcher produced so far, this one included
    pub batches_fetched: u64,
    /// Blocks to remember for reorg detection once this batch commits
    pub block_refs: Vec<BlockRef>,
}

impl FetchedBatch {
    pub fn reached_head(&self) -> bool {
        self.last_block.number >= self.head_block_number
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueueItem {
    Batch(FetchedBatch),
    /// Everything fetched above the safe block is stale
    Reorg(ReorgCheckpoint),
    /// The chain reached its end block
    Finished,
}

#[derive(Debug, Error)]
#[error("event queue of chain {chain_id} is closed")]
pub struct QueueClosed {
    pub chain_id: ChainId,
}

/// Creates a bounded single-producer single-consumer queue for one chain.
/// Pushing waits while `depth` items are buffered.
pub fn channel(chain_id: ChainId, depth: usize) -> (QueueSender, QueueReceiver) {
    let (sender, receiver) = mpsc::channel(depth.max(1));

    (
        QueueSender { chain_id, sender },
        QueueReceiver { chain_id, receiver },
    )
}

#[derive(Clone, Debug)]
pub struct QueueSender {
    chain_id: ChainId,
    sender: mpsc::Sender<QueueItem>,
}

impl QueueSender {
    pub async fn push(&self, item: QueueItem) -> Result<(), QueueClosed> {
        self.sender.send(item).await.map_err(|_error| QueueClosed {
            chain_id: self.chain_id,
        })
    }
}

#[derive(Debug)]
pub struct QueueReceiver {
    chain_id: ChainId,
    receiver: mpsc::Receiver<QueueItem>,
}

impl QueueReceiver {
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Waits for the next item. `None` once the fetcher is gone and the queue drained.
    pub async fn pop(&mut self) -> Option<QueueItem> {
        self.receiver.recv().await
    }

    pub fn try_pop(&mut self) -> Result<Option<QueueItem>, QueueClosed> {
        match self.receiver.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(QueueClosed {
                chain_id: self.chain_id,
            }),
        }
    }
}
