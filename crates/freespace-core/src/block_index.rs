//! Block-boundary index.
//!
//! The space reports every boundary change (a chunk carved, split, handed
//! out or freed) through [`BlockIndex`] so an external index can answer
//! "which block starts at or before this address" without scanning.
//! [`BlockStartTable`] is an ordered in-process implementation.

use std::collections::BTreeMap;

use parking_lot::RwLock;

/// Receiver of block-boundary events. Implementations must tolerate
/// concurrent calls from collector workers.
pub trait BlockIndex: Send + Sync {
    /// `[start, start + size)` is now a single block.
    fn mark_block(&self, start: usize, size: usize);

    /// The block at `start` shrank from `old_size` to `new_size`; the tail
    /// starts a new block.
    fn split_block(&self, start: usize, old_size: usize, new_size: usize);

    /// `[start, start + size)` was handed out.
    fn allocated(&self, start: usize, size: usize);

    /// `[start, start + size)` became free.
    fn freed(&self, start: usize, size: usize);

    /// `[start, start + size)` is recorded as exactly one block.
    fn single_block(&self, start: usize, size: usize) -> bool {
        let _ = (start, size);
        true
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBlockIndex;

impl BlockIndex for NoBlockIndex {
    fn mark_block(&self, _start: usize, _size: usize) {}
    fn split_block(&self, _start: usize, _old_size: usize, _new_size: usize) {}
    fn allocated(&self, _start: usize, _size: usize) {}
    fn freed(&self, _start: usize, _size: usize) {}
}

/// Ordered map of block starts to block sizes.
#[derive(Debug, Default)]
pub struct BlockStartTable {
    starts: RwLock<BTreeMap<usize, usize>>,
}

impl BlockStartTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start of the block covering `addr`.
    #[must_use]
    pub fn block_start(&self, addr: usize) -> Option<usize> {
        let starts = self.starts.read();
        let (&start, &size) = starts.range(..=addr).next_back()?;
        (addr < start + size).then_some(start)
    }

    /// Size recorded for the block starting at `start`.
    #[must_use]
    pub fn block_size(&self, start: usize) -> Option<usize> {
        self.starts.read().get(&start).copied()
    }

    /// `[start, start + size)` is one recorded block with no interior starts.
    #[must_use]
    pub fn verify_single_block(&self, start: usize, size: usize) -> bool {
        let starts = self.starts.read();
        starts.get(&start) == Some(&size)
            && starts.range(start + 1..start + size.max(1)).next().is_none()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.starts.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_block(starts: &mut BTreeMap<usize, usize>, start: usize, size: usize) {
        let interior: Vec<usize> = starts
            .range(start + 1..start + size.max(1))
            .map(|(&s, _)| s)
            .collect();
        for s in interior {
            starts.remove(&s);
        }
        starts.insert(start, size);
    }
}

impl BlockIndex for BlockStartTable {
    fn mark_block(&self, start: usize, size: usize) {
        Self::set_block(&mut self.starts.write(), start, size);
    }

    fn split_block(&self, start: usize, old_size: usize, new_size: usize) {
        debug_assert!(new_size < old_size);
        let mut starts = self.starts.write();
        Self::set_block(&mut starts, start, new_size);
        Self::set_block(&mut starts, start + new_size, old_size - new_size);
    }

    fn allocated(&self, start: usize, size: usize) {
        self.mark_block(start, size);
    }

    fn freed(&self, start: usize, size: usize) {
        self.mark_block(start, size);
    }

    fn single_block(&self, start: usize, size: usize) -> bool {
        self.verify_single_block(start, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_covering_block() {
        let table = BlockStartTable::new();
        table.mark_block(0, 100);
        assert_eq!(table.block_start(0), Some(0));
        assert_eq!(table.block_start(99), Some(0));
        assert_eq!(table.block_start(100), None);
    }

    #[test]
    fn split_creates_tail_block() {
        let table = BlockStartTable::new();
        table.mark_block(0, 100);
        table.split_block(0, 100, 30);
        assert_eq!(table.block_start(29), Some(0));
        assert_eq!(table.block_start(30), Some(30));
        assert!(table.verify_single_block(0, 30));
        assert!(table.verify_single_block(30, 70));
        assert!(!table.verify_single_block(0, 100));
    }

    #[test]
    fn marking_absorbs_interior_starts() {
        let table = BlockStartTable::new();
        table.mark_block(0, 10);
        table.mark_block(10, 10);
        table.mark_block(20, 10);
        table.freed(0, 30);
        assert_eq!(table.len(), 1);
        assert!(table.single_block(0, 30));
    }

    #[test]
    fn no_index_accepts_everything() {
        let index = NoBlockIndex;
        index.mark_block(0, 10);
        index.split_block(0, 10, 4);
        assert!(index.single_block(0, 10));
    }
}
