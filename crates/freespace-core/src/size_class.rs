//! Segregated free lists, one per small word size.
//!
//! Class `i` holds chunks of exactly `i` words for every aligned
//! `i` in `[min_chunk, index_limit)`. Each class sits behind its own ranked
//! lock, so operations that touch several classes take them one at a time or
//! in strictly increasing size.

use crate::arena::ChunkArena;
use crate::block_index::BlockIndex;
use crate::free_list::{FreeList, InsertAt};
use crate::stats::{CensusEvent, CensusStats, DemandPolicy};
use crate::sync::{RankedGuard, RankedMutex, class_rank};

/// A chunk carved from a larger class. The remainder
/// `[addr + size, addr + from_size)` is already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarvedChunk {
    pub addr: usize,
    pub size: usize,
    pub from_size: usize,
}

/// A larger chunk cut into `pieces` chunks of `size` words; the first piece
/// at `addr` is returned, the rest are queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replenished {
    pub addr: usize,
    pub size: usize,
    pub pieces: usize,
}

pub struct SizeClassFreeLists {
    lists: Box<[RankedMutex<FreeList>]>,
    index_limit: usize,
    min_chunk: usize,
    alignment: usize,
    policy: DemandPolicy,
}

impl SizeClassFreeLists {
    pub(crate) fn new(index_limit: usize, min_chunk: usize, alignment: usize, policy: DemandPolicy) -> Self {
        let lists = (0..index_limit)
            .map(|size| RankedMutex::new(class_rank(size), FreeList::new(size, index_limit, &policy)))
            .collect();
        Self {
            lists,
            index_limit,
            min_chunk,
            alignment,
            policy,
        }
    }

    #[must_use]
    pub fn index_limit(&self) -> usize {
        self.index_limit
    }

    /// Whether `size` has its own class.
    #[must_use]
    pub fn is_indexed(&self, size: usize) -> bool {
        size >= self.min_chunk && size < self.index_limit && size % self.alignment == 0
    }

    pub(crate) fn lock(&self, size: usize) -> RankedGuard<'_, FreeList> {
        self.lists[size].lock()
    }

    /// Every class guard, ascending.
    pub(crate) fn lock_all(&self) -> Vec<RankedGuard<'_, FreeList>> {
        self.lists.iter().map(RankedMutex::lock).collect()
    }

    fn classes(&self) -> impl DoubleEndedIterator<Item = usize> + '_ {
        (self.min_chunk..self.index_limit).step_by(self.alignment)
    }

    /// Pops a chunk of exactly `size` words. Never touches other classes.
    pub fn get_exact(&self, arena: &ChunkArena, size: usize) -> Option<usize> {
        debug_assert!(self.is_indexed(size));
        self.lock(size).pop_head(arena)
    }

    /// Queues a chunk on its class.
    pub fn return_chunk(&self, arena: &ChunkArena, addr: usize, size: usize, at: InsertAt) {
        debug_assert!(self.is_indexed(size));
        self.lock(size).insert(arena, addr, at);
    }

    /// Unlinks a specific chunk from its class. `false` if it is not queued
    /// there.
    pub fn remove_chunk(&self, arena: &ChunkArena, addr: usize, size: usize) -> bool {
        self.lock(size).remove(arena, addr)
    }

    /// Refills an empty class by cutting one chunk of `factor * size` words
    /// into `factor` pieces. Only a source class with a surplus is raided.
    /// Every piece is reported to `index` before any of them is queued.
    pub fn replenish(
        &self,
        arena: &ChunkArena,
        index: &dyn BlockIndex,
        size: usize,
        factor: usize,
    ) -> Option<Replenished> {
        if factor < 2 {
            return None;
        }
        let source_size = size.checked_mul(factor)?;
        if !self.is_indexed(source_size) {
            return None;
        }
        let source = {
            let mut source_list = self.lock(source_size);
            if source_list.stats().surplus() <= 0 {
                return None;
            }
            let addr = source_list.pop_head(arena)?;
            source_list.stats_mut().record(CensusEvent::SplitDeath, 1);
            addr
        };
        for piece in 0..factor {
            index.mark_block(source + piece * size, size);
        }
        let mut target = self.lock(size);
        // The first piece goes to the caller; the rest queue behind existing
        // chunks.
        for piece in 1..factor {
            target.insert(arena, source + piece * size, InsertAt::Tail);
        }
        target.stats_mut().record(CensusEvent::SplitBirth, factor);
        drop(target);
        arena.write_free_header(source, size);
        Some(Replenished {
            addr: source,
            size,
            pieces: factor,
        })
    }

    /// Carves `size` words from the smallest class on the hint chain that has
    /// a surplus and leaves a remainder of at least the minimum chunk size.
    pub fn best_fit_from_larger(&self, arena: &ChunkArena, index: &dyn BlockIndex, size: usize) -> Option<CarvedChunk> {
        let start = align_to(size + self.min_chunk, self.alignment);
        if start >= self.index_limit {
            return None;
        }
        let mut candidate = start;
        while candidate < self.index_limit {
            let mut list = self.lock(candidate);
            if list.stats().surplus() > 0 && !list.is_empty() {
                let addr = list.pop_head(arena)?;
                list.stats_mut().record(CensusEvent::SplitDeath, 1);
                drop(list);
                if candidate != start {
                    self.lock(start).set_hint(candidate);
                }
                return Some(self.split_and_queue(arena, index, addr, candidate, size));
            }
            let next = list.hint();
            drop(list);
            if next <= candidate {
                break;
            }
            candidate = next;
        }
        None
    }

    /// Carves `size` words from any larger class, surplus or not.
    pub fn raid_larger(&self, arena: &ChunkArena, index: &dyn BlockIndex, size: usize) -> Option<CarvedChunk> {
        let start = align_to(size + self.min_chunk, self.alignment);
        for candidate in (start..self.index_limit).step_by(self.alignment) {
            let mut list = self.lock(candidate);
            if let Some(addr) = list.pop_head(arena) {
                list.stats_mut().record(CensusEvent::SplitDeath, 1);
                drop(list);
                return Some(self.split_and_queue(arena, index, addr, candidate, size));
            }
        }
        None
    }

    fn split_and_queue(
        &self,
        arena: &ChunkArena,
        index: &dyn BlockIndex,
        addr: usize,
        from_size: usize,
        size: usize,
    ) -> CarvedChunk {
        let rem = from_size - size;
        debug_assert!(self.is_indexed(rem));
        // The index must see the split before another thread can take the
        // remainder and split it further.
        index.split_block(addr, from_size, size);
        // Tail: carved remainders queue behind chunks freed earlier.
        let mut rem_list = self.lock(rem);
        rem_list.insert(arena, addr + size, InsertAt::Tail);
        rem_list.stats_mut().record(CensusEvent::SplitBirth, 1);
        drop(rem_list);
        self.record(size, CensusEvent::SplitBirth, 1);
        arena.set_size(addr, size);
        CarvedChunk {
            addr,
            size,
            from_size,
        }
    }

    pub fn record(&self, size: usize, event: CensusEvent, n: usize) {
        self.lock(size).stats_mut().record(event, n);
    }

    #[must_use]
    pub fn count(&self, size: usize) -> usize {
        self.lock(size).count()
    }

    #[must_use]
    pub fn census(&self, size: usize) -> CensusStats {
        self.lock(size).census()
    }

    /// Snapshot; classes are read one lock at a time.
    #[must_use]
    pub fn total_words(&self) -> usize {
        self.classes().map(|size| self.lock(size).total_words()).sum()
    }

    /// Snapshot; classes are read one lock at a time.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.classes().map(|size| self.lock(size).count()).sum()
    }

    /// Largest non-empty class, or 0.
    #[must_use]
    pub fn max_chunk_size(&self) -> usize {
        self.classes()
            .rev()
            .find(|&size| !self.lock(size).is_empty())
            .unwrap_or(0)
    }

    pub(crate) fn valid_classes(&self) -> Vec<usize> {
        self.classes().collect()
    }

    /// Sweep-end hints: each class points at the next larger class whose
    /// surplus is positive. Expects every class guard, ascending.
    pub(crate) fn set_hints(&self, guards: &mut [RankedGuard<'_, FreeList>]) {
        let mut hint = self.index_limit;
        for size in self.classes().collect::<Vec<_>>().into_iter().rev() {
            let list = &mut guards[size];
            list.set_hint(hint);
            if list.stats().surplus() > 0 {
                hint = size;
            }
        }
    }

    /// Empties every class. Queued chunks are marked allocated so their
    /// stale headers never read free.
    pub(crate) fn reset(&self, arena: &ChunkArena) {
        for mut list in self.lock_all() {
            let size = list.size();
            let queued: Vec<usize> = list.iter(arena).collect();
            for addr in queued {
                arena.mark_not_free(addr, size);
            }
            list.reset(self.index_limit);
        }
    }

    pub(crate) fn policy(&self) -> &DemandPolicy {
        &self.policy
    }
}

fn align_to(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}
