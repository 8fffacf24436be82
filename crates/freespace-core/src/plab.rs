//! Per-worker batch buffers for parallel collector allocation.
//!
//! A [`ParallelAllocationBuffer`] caches chunks per size so a worker takes a
//! shared class lock once per batch instead of once per block. Batch sizes
//! come from the context's per-size claim averages; retiring a buffer folds
//! what it actually consumed back into those averages and returns what it
//! did not use.

use crate::dictionary::Dither;
use crate::free_list::{FreeList, InsertAt};
use crate::lifecycle::LogLevel;
use crate::metrics::SpaceMetrics;
use crate::space::FreeListSpace;
use crate::stats::CensusEvent;

pub struct ParallelAllocationBuffer<'a> {
    space: &'a FreeListSpace,
    lists: Vec<FreeList>,
    /// Chunks claimed per size since the last retire.
    num_blocks: Vec<usize>,
}

impl<'a> ParallelAllocationBuffer<'a> {
    #[must_use]
    pub fn new(space: &'a FreeListSpace) -> Self {
        let global = space.context().lists();
        let limit = global.index_limit();
        let policy = *global.policy();
        Self {
            space,
            lists: (0..limit).map(|size| FreeList::new(size, limit, &policy)).collect(),
            num_blocks: vec![0; limit],
        }
    }

    /// Allocates `size` words for a collector worker. Sizes at or above the
    /// index limit go straight to the dictionary; smaller sizes come from the
    /// local cache, refilled in batches from the shared pool.
    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        let space = self.space;
        if size > space.capacity() {
            return None;
        }
        let size = space.adjust_object_size(size);
        let addr = if size >= self.lists.len() {
            let _serial = space.serial_guard();
            space.take_from_dictionary(size)?.0
        } else {
            if self.lists[size].is_empty() {
                self.get_from_global_pool(size);
            }
            self.lists[size].pop_head(space.arena())?
        };
        space.arena().mark_not_free(addr, size);
        space.block_index().allocated(addr, size);
        Some(addr)
    }

    /// Refills the local list for `size` with a batch from the shared pool.
    /// Returns the number of chunks obtained.
    pub fn get_from_global_pool(&mut self, size: usize) -> usize {
        let space = self.space;
        let ctx = space.context();
        let tuning = *ctx.plab_tuning();
        let mut n = ctx.blocks_to_claim(size);
        if tuning.resize_quicker && self.num_blocks[size] > 0 {
            // Heavy local demand grows the batch beyond the epoch average.
            let multiple = self.num_blocks[size] / (tuning.tolerance_factor * tuning.num_refills * n);
            n += tuning.reactivity_factor * multiple * n;
            n = n.min(tuning.max_blocks);
        }
        let got = {
            let _serial = space.serial_guard();
            space.par_get_chunk_of_blocks(size, n, &mut self.lists[size])
        };
        self.num_blocks[size] += got;
        SpaceMetrics::inc(&space.metrics().plab_refills);
        space.log().record(
            LogLevel::Debug,
            "plab",
            "refill",
            None,
            Some(size),
            if got == 0 { "exhausted" } else { "refilled" },
            format_args!("wanted={n} got={got}"),
        );
        got
    }

    /// Returns unused chunks to the shared lists and records what this
    /// buffer consumed per size.
    pub fn retire(&mut self) {
        let space = self.space;
        let ctx = space.context();
        let mut returned = 0usize;
        for size in 0..self.lists.len() {
            let claimed = self.num_blocks[size];
            if claimed == 0 {
                debug_assert!(self.lists[size].is_empty());
                continue;
            }
            let unused = self.lists[size].count();
            ctx.record_retire(size, claimed - unused);
            if unused > 0 {
                let _serial = space.serial_guard();
                ctx.lists().lock(size).prepend(space.arena(), &mut self.lists[size]);
                returned += unused;
            }
            self.num_blocks[size] = 0;
        }
        if returned > 0 {
            SpaceMetrics::add(&space.metrics().plab_retired_chunks, returned as u64);
        }
        space.log().record(
            LogLevel::Debug,
            "plab",
            "retire",
            None,
            None,
            "retired",
            format_args!("returned={returned}"),
        );
    }

    /// Chunks of `size` words cached locally.
    #[must_use]
    pub fn cached(&self, size: usize) -> usize {
        self.lists.get(size).map_or(0, FreeList::count)
    }

    /// Words cached locally across every size.
    #[must_use]
    pub fn total_cached(&self) -> usize {
        self.lists.iter().map(FreeList::total_words).sum()
    }
}

impl Drop for ParallelAllocationBuffer<'_> {
    fn drop(&mut self) {
        self.retire();
    }
}

impl FreeListSpace {
    /// Moves up to `n` chunks of `size` words onto `local`: exact chunks or
    /// chunks of a multiple of `size` first, then one dictionary chunk split
    /// `n` ways. Returns the number of chunks added.
    pub(crate) fn par_get_chunk_of_blocks(&self, size: usize, n: usize, local: &mut FreeList) -> usize {
        debug_assert!(self.context().lists().is_indexed(size));
        debug_assert!(n > 0);
        let before = local.count();
        if !self.par_get_chunk_of_blocks_ifl(size, n, local) {
            self.par_get_chunk_of_blocks_dictionary(size, n, local);
        }
        local.count() - before
    }

    /// Takes from class `k * size` for the smallest `k` with a non-empty
    /// class, splitting each chunk `k` ways.
    fn par_get_chunk_of_blocks_ifl(&self, size: usize, n: usize, local: &mut FreeList) -> bool {
        let lists = self.context().lists();
        let arena = self.arena();
        let mut k = 1;
        while k * size < lists.index_limit() {
            let cur = k * size;
            let mut global = lists.lock(cur);
            if global.is_empty() {
                drop(global);
                k += 1;
                continue;
            }
            let mut taken = global.take_first_n(arena, (n / k).max(1));
            if k > 1 {
                global.stats_mut().record(CensusEvent::SplitDeath, taken.count());
            }
            drop(global);
            if k == 1 {
                local.prepend(arena, &mut taken);
                return true;
            }
            let chunks: Vec<usize> = taken.iter(arena).collect();
            for &addr in &chunks {
                for piece in (0..k).rev() {
                    let start = addr + piece * size;
                    local.insert(arena, start, InsertAt::Head);
                    self.block_index().mark_block(start, size);
                }
            }
            lists.record(size, CensusEvent::SplitBirth, chunks.len() * k);
            return true;
        }
        false
    }

    fn par_get_chunk_of_blocks_dictionary(&self, size: usize, n: usize, local: &mut FreeList) {
        let Some((addr, n)) = self.get_n_way_chunk_to_split(size, n) else {
            return;
        };
        let arena = self.arena();
        // Reverse order leaves the lowest address at the head.
        for piece in (0..n).rev() {
            let start = addr + piece * size;
            local.insert(arena, start, InsertAt::Head);
            self.block_index().mark_block(start, size);
        }
        self.context().lists().record(size, CensusEvent::SplitBirth, n);
    }

    /// Finds a dictionary chunk that splits into up to `n` pieces of `size`,
    /// shrinking `n` until one fits. The remainder past the pieces is
    /// requeued; a remainder too small to stand alone is avoided by handing
    /// back one piece's worth. Returns the chunk start and the piece count.
    pub(crate) fn get_n_way_chunk_to_split(&self, size: usize, mut n: usize) -> Option<(usize, usize)> {
        let lists = self.context().lists();
        let limit = lists.index_limit();
        let arena = self.arena();
        let mut dict = self.context().dictionary();
        let (addr, chunk_size) = loop {
            if n == 0 {
                return None;
            }
            let want = n.checked_mul(size)?.max(limit);
            if let Some(found) = dict.remove_at_least(arena, want, Dither::AtLeast) {
                break found;
            }
            let largest = dict.max_chunk_size();
            if largest < limit {
                return None;
            }
            n = (n - 1).min(largest / size);
        };

        n = n.min(chunk_size / size);
        let mut rem = chunk_size - n * size;
        if rem > 0 && rem < self.min_chunk_size() {
            n -= 1;
            rem += size;
        }
        if n == 0 {
            dict.insert(arena, addr, chunk_size);
            return None;
        }
        dict.census_update(chunk_size, CensusEvent::SplitDeath);

        if rem > 0 {
            let rem_addr = addr + n * size;
            self.block_index().split_block(addr, chunk_size, n * size);
            if rem >= limit {
                dict.insert(arena, rem_addr, rem);
                dict.census_update(rem, CensusEvent::SplitBirth);
                drop(dict);
            } else {
                drop(dict);
                // Head: the remainder is the next chunk of its size workers
                // reach.
                lists.return_chunk(arena, rem_addr, rem, InsertAt::Head);
                lists.record(rem, CensusEvent::SplitBirth, 1);
            }
        }
        SpaceMetrics::inc(&self.metrics().splits);
        self.log().record(
            LogLevel::Debug,
            "split",
            "n_way",
            Some(addr),
            Some(size),
            "split",
            format_args!("from={chunk_size} pieces={n} remainder={rem}"),
        );
        Some((addr, n))
    }
}
