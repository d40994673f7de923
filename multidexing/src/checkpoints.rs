use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::chain_reorg::ChainRewind;
use crate::{Chain, ChainId, EventPosition};

/// Persisted progress of one chain, used for observability and as the resumption point
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCheckpoint {
    pub chain_id: ChainId,
    pub start_block_number: u64,
    pub end_block_number: Option<u64>,
    pub latest_fetched_block_number: Option<u64>,
    /// Highest block whose events are all committed
    pub latest_processed_block_number: Option<u64>,
    /// Last committed event. Lies in a later block than the processed cursor
    /// when a unit ended in the middle of a block.
    pub processed_position: Option<EventPosition>,
    pub events_processed: u64,
    pub batches_fetched: u64,
    pub first_event_block_number: Option<u64>,
    /// Unix seconds of the first time the chain was live or finished
    pub caught_up_at: Option<i64>,
    pub is_live: bool,
    pub is_finished: bool,
}

impl ChainCheckpoint {
    pub fn new(chain: &Chain) -> Self {
        Self {
            chain_id: chain.id,
            start_block_number: chain.start_block_number,
            end_block_number: chain.end_block_number,
            latest_fetched_block_number: None,
            latest_processed_block_number: None,
            processed_position: None,
            events_processed: 0,
            batches_fetched: 0,
            first_event_block_number: None,
            caught_up_at: None,
            is_live: false,
            is_finished: false,
        }
    }

    pub fn resume_block_number(&self) -> u64 {
        match (self.skip_through(), self.latest_processed_block_number) {
            (Some(position), _) => position.block_number,
            (None, Some(processed)) => (processed + 1).max(self.start_block_number),
            (None, None) => self.start_block_number,
        }
    }

    /// Events at or before this position in the resume block were already committed
    pub fn skip_through(&self) -> Option<EventPosition> {
        self.processed_position.filter(|position| {
            self.latest_processed_block_number
                .map_or(true, |processed| position.block_number > processed)
        })
    }

    pub fn is_caught_up(&self) -> bool {
        self.caught_up_at.is_some()
    }
}

/// What one committed unit did to a chain
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainProgress {
    pub chain_id: ChainId,
    pub latest_fetched_block_number: Option<u64>,
    pub latest_processed_block_number: Option<u64>,
    pub processed_position: Option<EventPosition>,
    pub events_processed: u64,
    pub batches_fetched: u64,
    pub first_event_block_number: Option<u64>,
    pub is_live: bool,
    pub is_finished: bool,
}

impl ChainProgress {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            ..Default::default()
        }
    }

    pub fn merge(&mut self, other: &ChainProgress) {
        self.latest_fetched_block_number =
            self.latest_fetched_block_number.max(other.latest_fetched_block_number);
        self.latest_processed_block_number =
            self.latest_processed_block_number.max(other.latest_processed_block_number);
        self.processed_position = self.processed_position.max(other.processed_position);
        self.events_processed += other.events_processed;
        self.batches_fetched = self.batches_fetched.max(other.batches_fetched);
        self.first_event_block_number =
            self.first_event_block_number.or(other.first_event_block_number);
        self.is_live |= other.is_live;
        self.is_finished |= other.is_finished;
    }
}

#[derive(Clone, Debug, Default)]
pub struct CheckpointTracker {
    checkpoints: BTreeMap<ChainId, ChainCheckpoint>,
}

impl CheckpointTracker {
    /// Starts from stored checkpoints, falling back to fresh ones for new chains
    pub fn new(chains: &[Chain], stored: Vec<ChainCheckpoint>) -> Self {
        let mut stored: BTreeMap<_, _> =
            stored.into_iter().map(|checkpoint| (checkpoint.chain_id, checkpoint)).collect();

        let checkpoints = chains
            .iter()
            .map(|chain| {
                let checkpoint = match stored.remove(&chain.id) {
                    Some(mut checkpoint) => {
                        checkpoint.end_block_number = chain.end_block_number;
                        checkpoint.is_finished = checkpoint.is_finished
                            && chain.end_block_number.is_some_and(|end| {
                                checkpoint.latest_processed_block_number >= Some(end)
                            });
                        checkpoint
                    }
                    None => ChainCheckpoint::new(chain),
                };

                (chain.id, checkpoint)
            })
            .collect();

        Self { checkpoints }
    }

    pub fn get(&self, chain_id: ChainId) -> Option<&ChainCheckpoint> {
        self.checkpoints.get(&chain_id)
    }

    pub fn processed_block(&self, chain_id: ChainId) -> Option<u64> {
        self.get(chain_id)
            .and_then(|checkpoint| checkpoint.latest_processed_block_number)
    }

    pub fn all(&self) -> Vec<ChainCheckpoint> {
        self.checkpoints.values().cloned().collect()
    }

    /// Checkpoints after applying `progress`, without changing the tracker
    pub fn updated(&self, progress: &[ChainProgress]) -> Vec<ChainCheckpoint> {
        progress
            .iter()
            .filter_map(|progress| {
                let mut checkpoint = self.checkpoints.get(&progress.chain_id)?.clone();
                apply(&mut checkpoint, progress);

                Some(checkpoint)
            })
            .collect()
    }

    /// Checkpoints after moving each chain's processed cursor back to its rewind target
    pub fn rewound(&self, rewinds: &[ChainRewind]) -> Vec<ChainCheckpoint> {
        rewinds
            .iter()
            .filter_map(|rewind| {
                let mut checkpoint = self.checkpoints.get(&rewind.chain_id)?.clone();

                checkpoint.latest_processed_block_number = checkpoint
                    .latest_processed_block_number
                    .min(rewind.block_number);
                checkpoint.latest_fetched_block_number =
                    checkpoint.latest_fetched_block_number.min(rewind.block_number);
                checkpoint.processed_position = checkpoint.processed_position.filter(|position| {
                    rewind.block_number.is_some_and(|block_number| position.block_number <= block_number)
                });
                checkpoint.is_live = false;
                checkpoint.is_finished = false;

                Some(checkpoint)
            })
            .collect()
    }

    pub fn replace(&mut self, checkpoints: Vec<ChainCheckpoint>) {
        for checkpoint in checkpoints {
            self.checkpoints.insert(checkpoint.chain_id, checkpoint);
        }
    }
}

fn apply(checkpoint: &mut ChainCheckpoint, progress: &ChainProgress) {
    checkpoint.latest_fetched_block_number = checkpoint
        .latest_fetched_block_number
        .max(progress.latest_fetched_block_number);
    checkpoint.latest_processed_block_number = checkpoint
        .latest_processed_block_number
        .max(progress.latest_processed_block_number);
    checkpoint.processed_position = checkpoint.processed_position.max(progress.processed_position);
    checkpoint.events_processed += progress.events_processed;
    checkpoint.batches_fetched = checkpoint.batches_fetched.max(progress.batches_fetched);

    if checkpoint.first_event_block_number.is_none() {
        checkpoint.first_event_block_number = progress.first_event_block_number;
    }

    checkpoint.is_live |= progress.is_live;
    checkpoint.is_finished |= progress.is_finished;

    if checkpoint.caught_up_at.is_none() && (checkpoint.is_live || checkpoint.is_finished) {
        checkpoint.caught_up_at = Some(Utc::now().timestamp());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::silent_chain;

    fn tracker() -> CheckpointTracker {
        CheckpointTracker::new(&[silent_chain(1).with_start_block(5)], vec![])
    }

    fn progress(processed: u64, events_processed: u64) -> ChainProgress {
        ChainProgress {
            chain_id: 1,
            latest_fetched_block_number: Some(processed + 10),
            latest_processed_block_number: Some(processed),
            processed_position: Some(EventPosition {
                block_number: processed,
                log_index: 0,
            }),
            events_processed,
            batches_fetched: 1,
            first_event_block_number: Some(processed),
            ..ChainProgress::new(1)
        }
    }

    #[test]
    fn resumes_at_the_start_block_without_progress() {
        assert_eq!(tracker().get(1).unwrap().resume_block_number(), 5);
    }

    #[test]
    fn accumulates_counters_and_keeps_the_first_event_block() {
        let mut tracker = tracker();

        let updated = tracker.updated(&[progress(8, 2)]);
        tracker.replace(updated);
        let updated = tracker.updated(&[progress(12, 3)]);
        tracker.replace(updated);

        let checkpoint = tracker.get(1).unwrap();
        assert_eq!(checkpoint.events_processed, 5);
        assert_eq!(checkpoint.first_event_block_number, Some(8));
        assert_eq!(checkpoint.latest_processed_block_number, Some(12));
        assert_eq!(checkpoint.resume_block_number(), 13);
        assert!(!checkpoint.is_caught_up());
    }

    #[test]
    fn sets_caught_up_at_once() {
        let mut tracker = tracker();
        let live = ChainProgress {
            is_live: true,
            ..progress(8, 1)
        };

        let updated = tracker.updated(&[live.clone()]);
        tracker.replace(updated);
        let caught_up_at = tracker.get(1).unwrap().caught_up_at;
        let mut rewound = tracker.rewound(&[ChainRewind {
            chain_id: 1,
            block_number: Some(6),
        }]);
        rewound[0].caught_up_at = caught_up_at.map(|at| at - 100);
        tracker.replace(rewound);
        let updated = tracker.updated(&[live]);
        tracker.replace(updated);

        assert!(caught_up_at.is_some());
        assert_eq!(tracker.get(1).unwrap().caught_up_at, caught_up_at.map(|at| at - 100));
    }

    #[test]
    fn resumes_inside_a_partially_processed_block() {
        let mut checkpoint = tracker().get(1).unwrap().clone();
        checkpoint.latest_processed_block_number = Some(9);
        checkpoint.processed_position = Some(EventPosition {
            block_number: 10,
            log_index: 3,
        });

        assert_eq!(checkpoint.resume_block_number(), 10);
        assert_eq!(checkpoint.skip_through(), checkpoint.processed_position);
    }

    #[test]
    fn rewinds_never_move_the_cursor_forward() {
        let mut tracker = tracker();
        let updated = tracker.updated(&[progress(8, 1)]);
        tracker.replace(updated);

        let rewound = tracker.rewound(&[ChainRewind {
            chain_id: 1,
            block_number: Some(40),
        }]);

        assert_eq!(rewound[0].latest_processed_block_number, Some(8));
        assert_eq!(rewound[0].resume_block_number(), 9);
    }
}
