use std::collections::BTreeMap;

use crate::sources::BlockRef;

/// Sliding window of the latest blocks a fetcher saw
#[derive(Clone, Debug)]
pub struct RecordedBlocks {
    blocks: BTreeMap<u64, BlockRef>,
    capacity: usize,
}

impl RecordedBlocks {
    pub fn new(capacity: usize, blocks: Vec<BlockRef>) -> Self {
        let mut recorded = Self {
            blocks: BTreeMap::new(),
            capacity: capacity.max(1),
        };
        for block in blocks {
            recorded.record(block);
        }

        recorded
    }

    pub fn get(&self, block_number: u64) -> Option<&BlockRef> {
        self.blocks.get(&block_number)
    }

    pub fn record(&mut self, block: BlockRef) {
        self.blocks.insert(block.number, block);

        while self.blocks.len() > self.capacity {
            self.blocks.pop_first();
        }
    }

    pub fn truncate_above(&mut self, block_number: u64) {
        self.blocks.retain(|number, _block| *number <= block_number);
    }

    /// Highest first
    pub fn descending(&self) -> Vec<BlockRef> {
        self.blocks.values().rev().cloned().collect()
    }

    pub fn lowest_block_number(&self) -> Option<u64> {
        self.blocks.keys().next().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64) -> BlockRef {
        BlockRef {
            number,
            hash: format!("0x{number}"),
            parent_hash: format!("0x{}", number.saturating_sub(1)),
            timestamp: number * 10,
        }
    }

    #[test]
    fn evicts_the_lowest_blocks_beyond_capacity() {
        let recorded = RecordedBlocks::new(2, vec![block(1), block(2), block(3)]);

        assert!(recorded.get(1).is_none());
        assert_eq!(recorded.lowest_block_number(), Some(2));
        assert_eq!(
            recorded.descending().iter().map(|block| block.number).collect::<Vec<_>>(),
            vec![3, 2]
        );
    }

    #[test]
    fn truncates_everything_above_a_block() {
        let mut recorded = RecordedBlocks::new(10, vec![block(1), block(2), block(3)]);

        recorded.truncate_above(1);

        assert_eq!(recorded.descending(), vec![block(1)]);
    }
}
