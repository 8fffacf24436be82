//! Linear allocation block: a bump-pointer region for small requests.
//!
//! The block is itself a free chunk flagged so external coalescing leaves it
//! alone; its header is rewritten after every bump. A bump never leaves a
//! remainder smaller than the minimum chunk size, so retiring the block can
//! always hand back a well-formed chunk.

use crate::arena::ChunkArena;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearAllocationBlock {
    start: usize,
    remaining: usize,
    refill_size: usize,
    allocation_size_limit: usize,
    min_chunk: usize,
}

impl LinearAllocationBlock {
    #[must_use]
    pub fn new(refill_size: usize, allocation_size_limit: usize, min_chunk: usize) -> Self {
        Self {
            start: 0,
            remaining: 0,
            refill_size,
            allocation_size_limit,
            min_chunk,
        }
    }

    #[must_use]
    pub fn start(&self) -> usize {
        self.start
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    #[must_use]
    pub fn refill_size(&self) -> usize {
        self.refill_size
    }

    #[must_use]
    pub fn allocation_size_limit(&self) -> usize {
        self.allocation_size_limit
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Whether the block is configured at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.refill_size > 0
    }

    /// `[start, start + remaining)` contains `addr`.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.start + self.remaining
    }

    /// Bumps `n` words off the front. Fails for requests at or above the
    /// size limit, and for bumps that would strand a sub-minimum tail.
    pub fn allocate(&mut self, arena: &ChunkArena, n: usize) -> Option<usize> {
        if n >= self.allocation_size_limit || n > self.remaining {
            return None;
        }
        let rest = self.remaining - n;
        if rest != 0 && rest < self.min_chunk {
            return None;
        }
        let addr = self.start;
        self.start += n;
        self.remaining = rest;
        if rest == 0 {
            self.start = 0;
        } else {
            self.repair(arena);
        }
        Some(addr)
    }

    /// Installs a fresh block. The previous block must already be retired.
    pub fn install(&mut self, arena: &ChunkArena, start: usize, size: usize) {
        debug_assert!(self.is_empty(), "installing over a live LAB");
        self.start = start;
        self.remaining = size;
        self.repair(arena);
    }

    /// Takes the unused tail out of the block.
    pub fn retire(&mut self) -> Option<(usize, usize)> {
        if self.remaining == 0 {
            return None;
        }
        let out = (self.start, self.remaining);
        self.start = 0;
        self.remaining = 0;
        Some(out)
    }

    /// Rewrites the block's header as an uncoalescable free chunk.
    pub fn repair(&self, arena: &ChunkArena) {
        if self.remaining > 0 {
            arena.write_uncoalescable_header(self.start, self.remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab() -> LinearAllocationBlock {
        LinearAllocationBlock::new(64, 16, 3)
    }

    #[test]
    fn empty_lab_never_allocates() {
        let arena = ChunkArena::new(128);
        let mut lab = lab();
        assert!(lab.is_empty());
        assert_eq!(lab.allocate(&arena, 4), None);
    }

    #[test]
    fn bumps_and_repairs_header() {
        let arena = ChunkArena::new(128);
        let mut lab = lab();
        lab.install(&arena, 10, 64);
        assert_eq!(lab.allocate(&arena, 4), Some(10));
        assert_eq!(lab.allocate(&arena, 4), Some(14));
        assert_eq!(lab.start(), 18);
        assert_eq!(lab.remaining(), 56);
        assert!(arena.is_free(18));
        assert!(arena.cant_coalesce(18));
        assert_eq!(arena.chunk_size(18), 56);
    }

    #[test]
    fn refuses_requests_at_size_limit() {
        let arena = ChunkArena::new(128);
        let mut lab = lab();
        lab.install(&arena, 0, 64);
        assert_eq!(lab.allocate(&arena, 16), None);
        assert_eq!(lab.allocate(&arena, 15), Some(0));
    }

    #[test]
    fn never_strands_sub_minimum_tail() {
        let arena = ChunkArena::new(128);
        let mut lab = LinearAllocationBlock::new(19, 16, 3);
        lab.install(&arena, 0, 10);
        // 10 - 8 = 2 would be an orphan fragment.
        assert_eq!(lab.allocate(&arena, 8), None);
        assert_eq!(lab.allocate(&arena, 7), Some(0));
        assert_eq!(lab.remaining(), 3);
        // Exact exhaustion is fine.
        assert_eq!(lab.allocate(&arena, 3), Some(7));
        assert!(lab.is_empty());
        assert_eq!(lab.retire(), None);
    }

    #[test]
    fn retire_hands_back_tail() {
        let arena = ChunkArena::new(128);
        let mut lab = lab();
        lab.install(&arena, 32, 64);
        lab.allocate(&arena, 5);
        assert_eq!(lab.retire(), Some((37, 59)));
        assert!(lab.is_empty());
        assert!(!lab.contains(37));
    }
}
