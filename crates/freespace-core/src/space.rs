//! The free-list space.
//!
//! [`FreeListSpace`] ties the size-class lists, the dictionary, the linear
//! allocation block and the block index together. Mutator allocation walks a
//! fixed fallback chain:
//!
//! 1. the LAB, for requests under its size limit;
//! 2. the exact size class, then replenishment of that class from a class
//!    `replenish` times larger;
//! 3. best fit from a larger class along the hint chain;
//! 4. the dictionary, exact then at least `size + MinChunkSize` with a split;
//! 5. any larger class, surplus or not.
//!
//! Every split requeues its remainder before the call returns. Failure is
//! `None`.
//!
//! Lock order: the space-wide lock, then size classes ascending, then the
//! dictionary. Mutator and sweeper operations always take the space-wide
//! lock; collector workers take it only under [`LockingRegime::Serial`].

use std::ops::Range;
use std::sync::Arc;

use crate::arena::ChunkArena;
use crate::block_index::{BlockIndex, BlockStartTable};
use crate::census::SweepClock;
use crate::config::{LockingRegime, SpaceConfig};
use crate::context::AllocatorContext;
use crate::dictionary::Dither;
use crate::error::{CorruptionError, SpaceError};
use crate::free_list::InsertAt;
use crate::lab::LinearAllocationBlock;
use crate::lifecycle::{LogLevel, SpaceLog};
use crate::metrics::{AllocPath, SpaceMetrics};
use crate::stats::CensusEvent;
use crate::sync::{GLOBAL_RANK, RankedGuard, RankedMutex, holds_rank};

/// State guarded by the space-wide lock.
pub(crate) struct GlobalState {
    pub(crate) lab: LinearAllocationBlock,
    pub(crate) clock: SweepClock,
}

pub struct FreeListSpace {
    config: SpaceConfig,
    min_chunk: usize,
    arena: ChunkArena,
    ctx: AllocatorContext,
    global: RankedMutex<GlobalState>,
    block_index: Arc<dyn BlockIndex>,
    log: SpaceLog,
    metrics: SpaceMetrics,
}

impl FreeListSpace {
    /// A space of `capacity` words, all of it one free chunk, indexed by a
    /// [`BlockStartTable`].
    pub fn new(config: SpaceConfig, capacity: usize) -> Result<Self, SpaceError> {
        Self::with_block_index(config, capacity, Arc::new(BlockStartTable::new()))
    }

    pub fn with_block_index(
        config: SpaceConfig,
        capacity: usize,
        block_index: Arc<dyn BlockIndex>,
    ) -> Result<Self, SpaceError> {
        config.validate()?;
        let min_chunk = config.min_chunk_size();
        let refill = if config.lab_refill_words == 0 {
            0
        } else {
            config.adjust_object_size(config.lab_refill_words)
        };
        let global = GlobalState {
            lab: LinearAllocationBlock::new(refill, config.lab_allocation_size_limit, min_chunk),
            clock: SweepClock::new(config.census_weight, config.census_padding),
        };
        let space = Self {
            min_chunk,
            arena: ChunkArena::new(capacity),
            ctx: AllocatorContext::new(&config),
            global: RankedMutex::new(GLOBAL_RANK, global),
            block_index,
            log: SpaceLog::new(config.log_level, config.log_capacity),
            metrics: SpaceMetrics::new(),
            config,
        };
        space.reset(0..capacity)?;
        Ok(space)
    }

    #[must_use]
    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    #[must_use]
    pub fn min_chunk_size(&self) -> usize {
        self.min_chunk
    }

    #[must_use]
    pub fn adjust_object_size(&self, size: usize) -> usize {
        self.config.adjust_object_size(size)
    }

    #[must_use]
    pub fn context(&self) -> &AllocatorContext {
        &self.ctx
    }

    #[must_use]
    pub fn metrics(&self) -> &SpaceMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn log(&self) -> &SpaceLog {
        &self.log
    }

    #[must_use]
    pub fn block_index(&self) -> &Arc<dyn BlockIndex> {
        &self.block_index
    }

    pub(crate) fn arena(&self) -> &ChunkArena {
        &self.arena
    }

    pub(crate) fn lock_global(&self) -> RankedGuard<'_, GlobalState> {
        self.global.lock()
    }

    /// The space-wide guard collector workers take under the serial regime.
    pub(crate) fn serial_guard(&self) -> Option<RankedGuard<'_, GlobalState>> {
        match self.config.locking {
            LockingRegime::Serial => Some(self.global.lock()),
            LockingRegime::Parallel => None,
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates a block of at least `size` words. The returned block is
    /// marked allocated and reported to the block index.
    pub fn allocate(&self, size: usize) -> Option<usize> {
        if size > self.capacity() {
            return self.allocation_failed(size);
        }
        let size = self.adjust_object_size(size);
        let found = {
            let mut global = self.global.lock();
            self.allocate_locked(&mut global, size)
        };
        match found {
            Some((addr, path)) => {
                self.arena.mark_not_free(addr, size);
                self.block_index.allocated(addr, size);
                self.metrics.record_path(path);
                self.log.record(
                    LogLevel::Trace,
                    "allocate",
                    "alloc",
                    Some(addr),
                    Some(size),
                    path.as_str(),
                    format_args!("path={}", path.as_str()),
                );
                Some(addr)
            }
            None => self.allocation_failed(size),
        }
    }

    fn allocation_failed(&self, size: usize) -> Option<usize> {
        SpaceMetrics::inc(&self.metrics.allocation_failures);
        self.log.record(
            LogLevel::Info,
            "allocate",
            "alloc",
            None,
            Some(size),
            "exhausted",
            format_args!("free_words={}", self.free_words_unlocked()),
        );
        None
    }

    fn allocate_locked(&self, global: &mut GlobalState, size: usize) -> Option<(usize, AllocPath)> {
        debug_assert!(holds_rank(GLOBAL_RANK), "allocation without the space lock");
        let lists = self.ctx.lists();
        let arena = &self.arena;

        if size < global.lab.allocation_size_limit() {
            let before = global.lab.remaining();
            if let Some(addr) = global.lab.allocate(arena, size) {
                if before > size {
                    self.block_index.split_block(addr, before, size);
                }
                lists.record(size, CensusEvent::SplitBirth, 1);
                return Some((addr, AllocPath::Lab));
            }
        }

        if lists.is_indexed(size) {
            if let Some(addr) = lists.get_exact(arena, size) {
                return Some((addr, AllocPath::ExactList));
            }
            if let Some(got) = lists.replenish(arena, &*self.block_index, size, self.config.indexed_list_replenish) {
                SpaceMetrics::inc(&self.metrics.splits);
                return Some((got.addr, AllocPath::Replenish));
            }
            if self.config.best_fit_first {
                if let Some(carved) = lists.best_fit_from_larger(arena, &*self.block_index, size) {
                    SpaceMetrics::inc(&self.metrics.splits);
                    return Some((carved.addr, AllocPath::BestFit));
                }
            }
        }

        if let Some(found) = self.take_from_dictionary(size) {
            return Some(found);
        }

        if lists.is_indexed(size) {
            if let Some(carved) = lists.raid_larger(arena, &*self.block_index, size) {
                SpaceMetrics::inc(&self.metrics.splits);
                return Some((carved.addr, AllocPath::RaidLarger));
            }
        }
        None
    }

    /// Takes `size` words from the dictionary: an exact chunk, else a chunk
    /// of at least `size + MinChunkSize` split with its remainder requeued.
    /// The returned chunk still reads free.
    pub(crate) fn take_from_dictionary(&self, size: usize) -> Option<(usize, AllocPath)> {
        let lists = self.ctx.lists();
        let mut dict = self.ctx.dictionary();
        if let Some(addr) = dict.remove_exact(&self.arena, size) {
            return Some((addr, AllocPath::DictionaryExact));
        }
        let (addr, chunk_size) = dict.remove_at_least(&self.arena, size + self.min_chunk, Dither::AtLeast)?;
        dict.census_update(chunk_size, CensusEvent::SplitDeath);
        let rem_addr = addr + size;
        let rem = chunk_size - size;
        self.arena.set_size(addr, size);
        // Reported while the dictionary lock still hides the remainder.
        self.block_index.split_block(addr, chunk_size, size);
        if rem >= lists.index_limit() {
            dict.insert(&self.arena, rem_addr, rem);
            dict.census_update(rem, CensusEvent::SplitBirth);
            drop(dict);
        } else {
            drop(dict);
            // Tail: a split remainder queues behind chunks freed earlier.
            lists.return_chunk(&self.arena, rem_addr, rem, InsertAt::Tail);
            lists.record(rem, CensusEvent::SplitBirth, 1);
        }
        self.record_census(size, CensusEvent::SplitBirth);
        SpaceMetrics::inc(&self.metrics.splits);
        self.log.record(
            LogLevel::Debug,
            "split",
            "dictionary_split",
            Some(addr),
            Some(size),
            "split",
            format_args!("from={chunk_size} remainder={rem}@{rem_addr}"),
        );
        Some((addr, AllocPath::DictionarySplit))
    }

    /// Takes a dictionary chunk of `size` words and flags it so external
    /// coalescing leaves it alone. The chunk stays free.
    pub fn allocate_scratch(&self, size: usize) -> Option<usize> {
        if size > self.capacity() {
            return None;
        }
        let size = self.adjust_object_size(size);
        let addr = {
            let _global = self.global.lock();
            self.take_from_dictionary(size)?.0
        };
        self.arena.write_uncoalescable_header(addr, size);
        self.block_index.mark_block(addr, size);
        self.log.record(
            LogLevel::Debug,
            "allocate",
            "scratch",
            Some(addr),
            Some(size),
            "scratch",
            format_args!(""),
        );
        Some(addr)
    }

    // ------------------------------------------------------------------
    // Returning chunks
    // ------------------------------------------------------------------

    /// Returns a block the caller owns. Small chunks go to the head of their
    /// class so the next request of that size reuses them first.
    pub fn return_chunk(&self, addr: usize, size: usize) -> Result<(), SpaceError> {
        self.check_chunk(addr, size)?;
        let global = self.global.lock();
        self.check_returnable(&global, addr, size)?;
        self.block_index.freed(addr, size);
        self.queue_free(addr, size, InsertAt::Head);
        drop(global);
        SpaceMetrics::inc(&self.metrics.returns);
        self.log.record(
            LogLevel::Trace,
            "return_chunk",
            "free",
            Some(addr),
            Some(size),
            "queued",
            format_args!("at=head"),
        );
        Ok(())
    }

    /// Sweeper entry point for a garbage range. Chunks queue at the tail so
    /// every earlier chunk of that size is reached first.
    pub fn add_chunk_to_free_lists(&self, addr: usize, size: usize) -> Result<(), SpaceError> {
        self.check_chunk(addr, size)?;
        let global = self.global.lock();
        self.check_returnable(&global, addr, size)?;
        self.block_index.freed(addr, size);
        self.queue_free(addr, size, InsertAt::Tail);
        drop(global);
        SpaceMetrics::inc(&self.metrics.returns);
        self.log.record(
            LogLevel::Trace,
            "return_chunk",
            "sweep_free",
            Some(addr),
            Some(size),
            "queued",
            format_args!("at=tail"),
        );
        Ok(())
    }

    /// Adds a chunk found at the end of a sweep, merging it with the
    /// dictionary's largest chunk when that chunk ends exactly at `addr`.
    /// Records the merge as one coalescing death and one birth.
    pub fn add_chunk_to_free_lists_at_end_recording_stats(&self, addr: usize, size: usize) -> Result<(), SpaceError> {
        self.check_chunk(addr, size)?;
        let global = self.global.lock();
        self.check_returnable(&global, addr, size)?;
        let (start, merged) = {
            let mut dict = self.ctx.dictionary();
            match dict.find_largest() {
                Some((prev, prev_size)) if prev + prev_size == addr => {
                    dict.census_update(prev_size, CensusEvent::CoalDeath);
                    dict.remove_chunk(&self.arena, prev, prev_size);
                    (prev, prev_size + size)
                }
                _ => (addr, size),
            }
        };
        self.block_index.freed(start, merged);
        self.queue_free(start, merged, InsertAt::Tail);
        drop(global);
        self.record_census(merged, CensusEvent::CoalBirth);
        SpaceMetrics::inc(&self.metrics.returns);
        self.log.record(
            LogLevel::Debug,
            "return_chunk",
            "sweep_free_at_end",
            Some(start),
            Some(merged),
            if start == addr { "queued" } else { "coalesced" },
            format_args!("added={size}@{addr}"),
        );
        Ok(())
    }

    /// Pulls a specific free chunk out of whichever structure holds it and
    /// hands it to the caller (a sweeper about to merge it). Records a
    /// coalescing death and returns the chunk size.
    pub fn remove_free_chunk(&self, addr: usize) -> Result<usize, SpaceError> {
        let global = self.global.lock();
        if !self.arena.is_free(addr) || self.arena.cant_coalesce(addr) {
            return Err(SpaceError::NotQueued { addr });
        }
        let size = self.arena.chunk_size(addr);
        self.arena.check_range(addr, size)?;
        let lists = self.ctx.lists();
        if size < lists.index_limit() {
            if !lists.is_indexed(size) {
                return Err(SpaceError::NotQueued { addr });
            }
            let mut list = lists.lock(size);
            if !list.remove(&self.arena, addr) {
                return Err(SpaceError::NotQueued { addr });
            }
            list.stats_mut().record(CensusEvent::CoalDeath, 1);
        } else {
            let mut dict = self.ctx.dictionary();
            if !dict.remove_chunk(&self.arena, addr, size) {
                return Err(SpaceError::NotQueued { addr });
            }
            dict.census_update(size, CensusEvent::CoalDeath);
        }
        drop(global);
        self.arena.mark_not_free(addr, size);
        self.log.record(
            LogLevel::Trace,
            "return_chunk",
            "remove_free",
            Some(addr),
            Some(size),
            "removed",
            format_args!(""),
        );
        Ok(size)
    }

    fn check_chunk(&self, addr: usize, size: usize) -> Result<(), SpaceError> {
        self.arena.check_range(addr, size)?;
        if size < self.min_chunk {
            return Err(SpaceError::ChunkTooSmall {
                size,
                min: self.min_chunk,
            });
        }
        let alignment = self.config.object_alignment_words;
        if size % alignment != 0 {
            return Err(SpaceError::Misaligned { size, alignment });
        }
        Ok(())
    }

    fn check_returnable(&self, global: &GlobalState, addr: usize, size: usize) -> Result<(), SpaceError> {
        let lab = &global.lab;
        if !lab.is_empty() && addr < lab.start() + lab.remaining() && lab.start() < addr + size {
            return Err(CorruptionError::LabOverlap {
                lab_start: lab.start(),
                lab_size: lab.remaining(),
                addr,
                size,
            }
            .into());
        }
        if self.arena.is_free(addr) && !self.arena.cant_coalesce(addr) {
            return Err(CorruptionError::AlreadyFree { addr }.into());
        }
        Ok(())
    }

    /// Queues a validated chunk on the structure its size selects. Dictionary
    /// chunks always chain newest first.
    fn queue_free(&self, addr: usize, size: usize, at: InsertAt) {
        let lists = self.ctx.lists();
        if size < lists.index_limit() {
            lists.return_chunk(&self.arena, addr, size, at);
        } else {
            self.ctx.dictionary().insert(&self.arena, addr, size);
        }
    }

    // ------------------------------------------------------------------
    // Census helpers
    // ------------------------------------------------------------------

    fn record_census(&self, size: usize, event: CensusEvent) {
        let lists = self.ctx.lists();
        if size < lists.index_limit() {
            lists.record(size, event, 1);
        } else {
            self.ctx.dictionary().census_update(size, event);
        }
    }

    pub fn split_birth(&self, size: usize) {
        self.record_census(size, CensusEvent::SplitBirth);
    }

    pub fn split_death(&self, size: usize) {
        self.record_census(size, CensusEvent::SplitDeath);
    }

    pub fn coal_birth(&self, size: usize) {
        self.record_census(size, CensusEvent::CoalBirth);
    }

    pub fn coal_death(&self, size: usize) {
        self.record_census(size, CensusEvent::CoalDeath);
    }

    /// A chunk of `from` words became `to1` and `from - to1`.
    pub fn split(&self, from: usize, to1: usize) {
        debug_assert!(to1 < from);
        self.split_death(from);
        self.split_birth(to1);
        self.split_birth(from - to1);
    }

    /// Whether `size` holds more chunks than its coalescing target, so a
    /// sweeper may merge them upward.
    #[must_use]
    pub fn coal_over_populated(&self, size: usize) -> bool {
        let lists = self.ctx.lists();
        if size < lists.index_limit() {
            let list = lists.lock(size);
            list.stats().coal_over_populated(list.count())
        } else {
            self.ctx.dictionary().coal_over_populated(size)
        }
    }

    // ------------------------------------------------------------------
    // Reset and LAB management
    // ------------------------------------------------------------------

    /// Forgets every free chunk and makes `range` one maximal free chunk.
    /// Words outside `range` are treated as allocated.
    pub fn reset(&self, range: Range<usize>) -> Result<(), SpaceError> {
        let len = range.end.saturating_sub(range.start);
        self.arena.check_range(range.start, len)?;
        if len != 0 {
            self.check_chunk(range.start, len)?;
        }
        let mut global = self.global.lock();
        // Everything outside `range` counts as allocated afterwards, so no
        // stale header may still read free.
        if let Some((start, size)) = global.lab.retire() {
            self.arena.mark_not_free(start, size);
        }
        self.ctx.lists().reset(&self.arena);
        self.ctx.dictionary().clear(&self.arena);
        if len != 0 {
            self.block_index.mark_block(range.start, len);
            self.queue_free(range.start, len, InsertAt::Head);
            self.record_census(len, CensusEvent::CoalBirth);
        }
        drop(global);
        self.log.record(
            LogLevel::Info,
            "reset",
            "reset",
            Some(range.start),
            Some(len),
            "reset",
            format_args!("capacity={}", self.capacity()),
        );
        Ok(())
    }

    /// Compaction moved every live block below `compaction_top`; the rest
    /// of the space is free again.
    pub fn reset_after_compaction(&self, compaction_top: usize) -> Result<(), SpaceError> {
        self.reset(compaction_top..self.capacity())?;
        self.refill_lab_if_needed();
        Ok(())
    }

    /// Refills the LAB if it is enabled and exhausted.
    pub fn refill_lab_if_needed(&self) -> bool {
        let mut global = self.global.lock();
        if !global.lab.is_enabled() || !global.lab.is_empty() {
            return false;
        }
        self.refill_lab_locked(&mut global)
    }

    /// Retires the current LAB, handing its tail back, and installs a fresh
    /// block of `refill_size` words.
    pub fn refill_lab(&self) -> bool {
        let mut global = self.global.lock();
        self.refill_lab_locked(&mut global)
    }

    fn refill_lab_locked(&self, global: &mut GlobalState) -> bool {
        debug_assert!(holds_rank(GLOBAL_RANK), "LAB refill without the space lock");
        if !global.lab.is_enabled() {
            return false;
        }
        if let Some((start, size)) = global.lab.retire() {
            // Tail: the retired remainder is the oldest memory of its size.
            self.queue_free(start, size, InsertAt::Tail);
            self.record_census(size, CensusEvent::SplitBirth);
            self.log.record(
                LogLevel::Debug,
                "lab",
                "retire",
                Some(start),
                Some(size),
                "requeued",
                format_args!(""),
            );
        }
        let want = global.lab.refill_size();
        let lists = self.ctx.lists();
        let mut got = None;
        if lists.is_indexed(want) {
            got = lists.get_exact(&self.arena, want).or_else(|| {
                lists
                    .best_fit_from_larger(&self.arena, &*self.block_index, want)
                    .map(|carved| carved.addr)
            });
        }
        let Some(addr) = got.or_else(|| self.take_from_dictionary(want).map(|(addr, _)| addr)) else {
            self.log.record(
                LogLevel::Info,
                "lab",
                "refill",
                None,
                Some(want),
                "exhausted",
                format_args!(""),
            );
            return false;
        };
        global.lab.install(&self.arena, addr, want);
        self.block_index.mark_block(addr, want);
        SpaceMetrics::inc(&self.metrics.lab_refills);
        self.log.record(
            LogLevel::Debug,
            "lab",
            "refill",
            Some(addr),
            Some(want),
            "installed",
            format_args!(""),
        );
        true
    }

    /// Rewrites the LAB header after an external walker may have clobbered
    /// it.
    pub fn repair_lab(&self) {
        self.global.lock().lab.repair(&self.arena);
    }

    /// Sweep epilogue: free space is probably plentiful again.
    pub fn sweep_completed(&self) {
        self.refill_lab_if_needed();
    }

    /// Snapshot of the LAB.
    #[must_use]
    pub fn lab(&self) -> LinearAllocationBlock {
        self.global.lock().lab.clone()
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    /// Free words in the lists, the dictionary and the LAB. Structures are
    /// read one lock at a time, so the total may be stale under concurrent
    /// mutation.
    #[must_use]
    pub fn free_words(&self) -> usize {
        let lab = self.global.lock().lab.remaining();
        lab + self.free_words_unlocked()
    }

    /// Free words outside the LAB; callable while holding the space lock.
    fn free_words_unlocked(&self) -> usize {
        self.ctx.lists().total_words() + self.ctx.dictionary().total_words()
    }

    #[must_use]
    pub fn used_words(&self) -> usize {
        self.capacity().saturating_sub(self.free_words())
    }

    /// Largest free block held by any structure.
    #[must_use]
    pub fn max_alloc_in_words(&self) -> usize {
        let lab = self.global.lock().lab.remaining();
        let small = self.ctx.lists().max_chunk_size();
        let large = self.ctx.dictionary().max_chunk_size();
        lab.max(small).max(large)
    }

    /// Free chunks queued in the lists and the dictionary.
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.ctx.lists().total_count() + self.ctx.dictionary().total_count()
    }

    /// Whether the block starting at `addr` reads free. `addr` must be a
    /// block start.
    #[must_use]
    pub fn is_free_block(&self, addr: usize) -> bool {
        self.arena.is_free(addr)
    }

    #[must_use]
    pub fn free_block_size(&self, addr: usize) -> Option<usize> {
        self.arena.is_free(addr).then(|| self.arena.chunk_size(addr))
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    /// Checks every free structure under every lock: list links and counts,
    /// headers, disjointness of all free chunks and the LAB, and block-index
    /// agreement.
    pub fn check_integrity(&self) -> Result<(), SpaceError> {
        let global = self.global.lock();
        let lists = self.ctx.lists();
        let guards = lists.lock_all();
        let dict = self.ctx.dictionary();

        let mut chunks = Vec::new();
        for size in lists.valid_classes() {
            let list = &guards[size];
            list.verify(&self.arena, "size class")?;
            chunks.extend(list.iter(&self.arena).map(|addr| (addr, size)));
        }
        for (size, list) in guards.iter().enumerate() {
            if !lists.is_indexed(size) && !list.is_empty() {
                return Err(CorruptionError::CountMismatch {
                    structure: "unused size class",
                    size,
                    recorded: list.count(),
                    linked: 0,
                }
                .into());
            }
        }
        dict.verify(&self.arena)?;
        chunks.extend(dict.chunks(&self.arena));

        for &(addr, size) in &chunks {
            if !self.block_index.single_block(addr, size) {
                return Err(CorruptionError::UnindexedChunk { addr, size }.into());
            }
        }

        let lab = &global.lab;
        if !lab.is_empty() {
            let (start, size) = (lab.start(), lab.remaining());
            self.arena.check_free_chunk(start, size)?;
            if !self.arena.cant_coalesce(start) {
                return Err(CorruptionError::NotFree { addr: start }.into());
            }
            if let Some(&(addr, chunk)) = chunks.iter().find(|&&(addr, chunk)| addr < start + size && start < addr + chunk) {
                return Err(CorruptionError::LabOverlap {
                    lab_start: start,
                    lab_size: size,
                    addr,
                    size: chunk,
                }
                .into());
            }
        }

        chunks.sort_unstable();
        for pair in chunks.windows(2) {
            let (first, first_size) = pair[0];
            let (second, second_size) = pair[1];
            if first + first_size > second {
                return Err(CorruptionError::Overlap {
                    first,
                    first_size,
                    second,
                    second_size,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Fatal verification: corruption is logged and panics.
    pub fn verify(&self) {
        if let Err(err) = self.check_integrity() {
            self.log.record(
                LogLevel::Error,
                "verify",
                "corruption",
                None,
                None,
                "fatal",
                format_args!("{err}"),
            );
            panic!("{err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(capacity: usize) -> FreeListSpace {
        FreeListSpace::new(SpaceConfig::default(), capacity).unwrap()
    }

    fn lab_space(capacity: usize) -> FreeListSpace {
        let config = SpaceConfig {
            lab_refill_words: 64,
            ..SpaceConfig::default()
        };
        FreeListSpace::new(config, capacity).unwrap()
    }

    #[test]
    fn starts_as_one_free_chunk() {
        let s = space(1024);
        assert_eq!(s.free_words(), 1024);
        assert_eq!(s.total_count(), 1);
        assert_eq!(s.max_alloc_in_words(), 1024);
        assert_eq!(s.free_block_size(0), Some(1024));
        s.verify();
    }

    #[test]
    fn three_small_allocations_split_the_dictionary_chunk() {
        let s = space(1024);
        let blocks: Vec<usize> = (0..3).map(|_| s.allocate(4).unwrap()).collect();
        assert_eq!(blocks, vec![0, 4, 8]);
        assert_eq!(s.free_words(), 1012);
        assert_eq!(s.total_count(), 1);
        assert_eq!(s.free_block_size(12), Some(1012));
        assert!(!s.is_free_block(4));
        s.verify();

        for &addr in &blocks {
            s.return_chunk(addr, 4).unwrap();
        }
        assert_eq!(s.free_words(), 1024);
        assert_eq!(s.context().lists().count(4), 3);
        s.verify();
        assert_eq!(s.metrics().snapshot().dictionary_hits, 3);
    }

    #[test]
    fn returned_chunk_is_reused_first() {
        let s = space(1024);
        let a = s.allocate(10).unwrap();
        let _b = s.allocate(10).unwrap();
        s.return_chunk(a, 10).unwrap();
        assert_eq!(s.allocate(10), Some(a));
        assert_eq!(s.metrics().snapshot().exact_hits, 1);
    }

    #[test]
    fn requests_are_rounded_to_min_chunk() {
        let s = space(64);
        let a = s.allocate(1).unwrap();
        let b = s.allocate(1).unwrap();
        assert_eq!(b - a, 3);
    }

    #[test]
    fn replenish_cuts_larger_class() {
        let s = space(1024);
        let big = s.allocate(16).unwrap();
        let _guard = s.allocate(8).unwrap();
        s.return_chunk(big, 16).unwrap();
        assert_eq!(s.allocate(4), Some(big));
        assert_eq!(s.context().lists().count(4), 3);
        assert_eq!(s.metrics().snapshot().replenish_hits, 1);
        s.verify();
    }

    #[test]
    fn best_fit_splits_larger_class() {
        let s = space(1024);
        let big = s.allocate(30).unwrap();
        let _guard = s.allocate(8).unwrap();
        s.return_chunk(big, 30).unwrap();
        // Hints are laid at census end; class 30 then has a surplus.
        s.end_census();
        assert_eq!(s.allocate(10), Some(big));
        assert_eq!(s.context().lists().count(20), 1);
        assert_eq!(s.metrics().snapshot().best_fit_hits, 1);
        s.verify();
    }

    #[test]
    fn exhaustion_is_none() {
        let s = space(32);
        assert!(s.allocate(32).is_some());
        assert_eq!(s.allocate(4), None);
        assert_eq!(s.metrics().snapshot().allocation_failures, 1);
        assert_eq!(s.free_words(), 0);
    }

    #[test]
    fn raid_takes_larger_class_without_surplus() {
        let s = space(64);
        // The whole space sits in class 64, so this first split is a raid too.
        let a = s.allocate(40).unwrap();
        let _rest = s.allocate(24).unwrap();
        s.return_chunk(a, 40).unwrap();
        s.context().lists().lock(40).stats_mut().surplus = 0;
        let before = s.metrics().snapshot().raid_hits;
        assert_eq!(s.allocate(10), Some(a));
        assert_eq!(s.metrics().snapshot().raid_hits, before + 1);
        s.verify();
    }

    #[test]
    fn lab_serves_small_requests_after_refill() {
        let s = lab_space(1024);
        assert!(s.lab().is_empty());
        assert!(s.refill_lab_if_needed());
        assert_eq!(s.lab().remaining(), 64);
        let a = s.allocate(4).unwrap();
        let b = s.allocate(4).unwrap();
        assert_eq!(b, a + 4);
        assert_eq!(s.metrics().snapshot().lab_hits, 2);
        assert_eq!(s.free_words(), 1016);
        s.verify();
        // 16 words is at the limit: the LAB is skipped.
        let c = s.allocate(16).unwrap();
        assert!(!s.lab().contains(c));
    }

    #[test]
    fn lab_refill_retires_remainder() {
        let s = lab_space(1024);
        assert!(s.refill_lab());
        let first = s.lab().start();
        s.allocate(4).unwrap();
        assert!(s.refill_lab());
        assert_eq!(s.context().lists().count(60), 1);
        assert_ne!(s.lab().start(), first);
        assert_eq!(s.free_words(), 1020);
        s.verify();
    }

    #[test]
    fn disabled_lab_never_refills() {
        let config = SpaceConfig {
            lab_refill_words: 0,
            ..SpaceConfig::default()
        };
        let s = FreeListSpace::new(config, 1024).unwrap();
        assert!(!s.refill_lab());
        assert!(s.lab().is_empty());
    }

    #[test]
    fn rejects_bad_returns() {
        let s = space(1024);
        let a = s.allocate(8).unwrap();
        assert!(matches!(s.return_chunk(a, 2), Err(SpaceError::ChunkTooSmall { size: 2, min: 3 })));
        assert!(matches!(s.return_chunk(1020, 8), Err(SpaceError::RangeOutOfBounds { .. })));
        s.return_chunk(a, 8).unwrap();
        assert!(matches!(
            s.return_chunk(a, 8),
            Err(SpaceError::Corruption(CorruptionError::AlreadyFree { .. }))
        ));
    }

    #[test]
    fn rejects_misaligned_sizes() {
        let config = SpaceConfig {
            object_alignment_words: 2,
            ..SpaceConfig::default()
        };
        let s = FreeListSpace::new(config, 1024).unwrap();
        let a = s.allocate(5).unwrap();
        assert!(matches!(
            s.return_chunk(a, 5),
            Err(SpaceError::Misaligned { size: 5, alignment: 2 })
        ));
        s.return_chunk(a, 6).unwrap();
    }

    #[test]
    fn rejects_returns_into_the_lab() {
        let s = lab_space(1024);
        s.refill_lab();
        let lab = s.lab();
        assert!(matches!(
            s.return_chunk(lab.start() + 8, 4),
            Err(SpaceError::Corruption(CorruptionError::LabOverlap { .. }))
        ));
    }

    #[test]
    fn end_chunk_merges_with_largest() {
        let s = space(1024);
        let a = s.allocate(300).unwrap();
        let b = s.allocate(300).unwrap();
        let c = s.allocate(424).unwrap();
        assert_eq!(s.free_words(), 0);
        s.return_chunk(a, 300).unwrap();
        s.add_chunk_to_free_lists_at_end_recording_stats(b, 300).unwrap();
        assert_eq!(s.free_block_size(a), Some(600));
        assert_eq!(s.total_count(), 1);
        s.add_chunk_to_free_lists_at_end_recording_stats(c, 424).unwrap();
        assert_eq!(s.free_block_size(a), Some(1024));
        assert_eq!(s.total_count(), 1);
        assert_eq!(s.census_stats(1024).unwrap().coal_births, 1);
        s.verify();
    }

    #[test]
    fn end_chunk_without_coterminal_neighbor_is_queued() {
        let s = space(1024);
        let a = s.allocate(300).unwrap();
        s.add_chunk_to_free_lists_at_end_recording_stats(a, 300).unwrap();
        assert_eq!(s.total_count(), 2);
        assert_eq!(s.free_words(), 1024);
        s.verify();
    }

    #[test]
    fn remove_free_chunk_hands_chunk_over() {
        let s = space(1024);
        let a = s.allocate(8).unwrap();
        let _b = s.allocate(8).unwrap();
        s.return_chunk(a, 8).unwrap();
        assert_eq!(s.remove_free_chunk(a).unwrap(), 8);
        assert!(!s.is_free_block(a));
        assert_eq!(s.context().lists().count(8), 0);
        assert_eq!(s.census_stats(8).unwrap().coal_deaths, 1);
        assert!(matches!(s.remove_free_chunk(a), Err(SpaceError::NotQueued { .. })));
        s.add_chunk_to_free_lists(a, 8).unwrap();
        s.verify();
    }

    #[test]
    fn scratch_chunk_stays_free_but_uncoalescable() {
        let s = space(1024);
        let addr = s.allocate_scratch(400).unwrap();
        assert!(s.is_free_block(addr));
        assert!(matches!(s.remove_free_chunk(addr), Err(SpaceError::NotQueued { .. })));
        assert_eq!(s.free_words(), 624);
        s.return_chunk(addr, 400).unwrap();
        assert_eq!(s.free_words(), 1024);
        s.verify();
    }

    #[test]
    fn reset_after_compaction_frees_the_top() {
        let s = lab_space(1024);
        for _ in 0..10 {
            s.allocate(20).unwrap();
        }
        s.reset_after_compaction(100).unwrap();
        assert_eq!(s.lab().remaining(), 64);
        assert_eq!(s.free_words(), 924);
        assert_eq!(s.used_words(), 100);
        s.verify();
    }

    #[test]
    fn huge_requests_fail_cleanly() {
        let s = space(1024);
        assert_eq!(s.allocate(usize::MAX - 1), None);
        assert_eq!(s.allocate(usize::MAX), None);
        assert_eq!(s.allocate(1025), None);
        assert_eq!(s.allocate_scratch(usize::MAX), None);
        assert_eq!(s.metrics().snapshot().allocation_failures, 3);
        assert_eq!(s.free_words(), 1024);
        s.verify();
        assert_eq!(s.allocate(1024), Some(0));
    }

    #[test]
    fn reset_marks_forgotten_chunks_allocated() {
        let s = lab_space(1024);
        assert!(s.refill_lab());
        let a = s.allocate(8).unwrap();
        let b = s.allocate(8).unwrap();
        let big = s.allocate(300).unwrap();
        let lab = s.lab();
        assert!(s.is_free_block(lab.start()));
        s.return_chunk(a, 8).unwrap();
        s.return_chunk(big, 300).unwrap();
        s.reset(900..1024).unwrap();
        assert!(!s.is_free_block(a));
        assert!(!s.is_free_block(big));
        assert!(!s.is_free_block(lab.start()));
        assert_eq!(s.free_words(), 124);
        // Garbage below the reset range is accepted again.
        s.add_chunk_to_free_lists(a, 8).unwrap();
        s.add_chunk_to_free_lists(b, 8).unwrap();
        assert_eq!(s.free_words(), 140);
        s.verify();
    }

    #[test]
    fn sweeping_below_the_compaction_top() {
        let s = space(1024);
        let a = s.allocate(8).unwrap();
        let b = s.allocate(8).unwrap();
        assert_eq!((a, b), (0, 8));
        s.return_chunk(a, 8).unwrap();
        s.reset_after_compaction(16).unwrap();
        assert!(!s.is_free_block(0));
        assert!(matches!(s.remove_free_chunk(0), Err(SpaceError::NotQueued { addr: 0 })));
        s.add_chunk_to_free_lists(0, 8).unwrap();
        assert_eq!(s.free_words(), 1016);
        assert_eq!(s.remove_free_chunk(0).unwrap(), 8);
        s.verify();
    }

    #[test]
    fn remove_free_chunk_rejects_stale_headers() {
        let s = space(1024);
        let a = s.allocate(8).unwrap();
        let b = s.allocate(8).unwrap();
        let _c = s.allocate(8).unwrap();
        s.return_chunk(a, 8).unwrap();
        // `b` reads free but was never queued.
        s.arena().write_free_header(b, 8);
        assert!(matches!(s.remove_free_chunk(b), Err(SpaceError::NotQueued { .. })));
        assert_eq!(s.context().lists().count(8), 1);
        assert_eq!(s.census_stats(8).unwrap().coal_deaths, 0);
        s.arena().mark_not_free(b, 8);
        s.verify();

        let big = s.allocate(400).unwrap();
        s.arena().write_free_header(big, 400);
        assert!(matches!(s.remove_free_chunk(big), Err(SpaceError::NotQueued { .. })));
        s.arena().mark_not_free(big, 400);
        s.verify();
    }

    #[test]
    fn census_helpers_route_by_size() {
        let s = space(1024);
        s.split(300, 100);
        assert_eq!(s.census_stats(100).unwrap().split_births, 1);
        assert_eq!(s.census_stats(200).unwrap().split_births, 1);
        // The dictionary has no 300-word entry to record against.
        assert!(s.census_stats(300).is_none());
        s.coal_birth(1024);
        assert_eq!(s.census_stats(1024).unwrap().coal_births, 2);
        assert!(s.coal_over_populated(1024));
    }

    #[test]
    fn integrity_detects_clobbered_header() {
        let s = space(1024);
        let a = s.allocate(8).unwrap();
        let _b = s.allocate(8).unwrap();
        s.return_chunk(a, 8).unwrap();
        s.arena().mark_not_free(a, 8);
        assert!(matches!(
            s.check_integrity(),
            Err(SpaceError::Corruption(CorruptionError::NotFree { .. }))
        ));
    }

    #[test]
    #[should_panic(expected = "heap corruption")]
    fn verify_panics_on_corruption() {
        let s = space(1024);
        s.arena().set_size(0, 512);
        s.verify();
    }

    #[test]
    fn allocation_paths_are_logged() {
        let config = SpaceConfig {
            log_level: LogLevel::Trace,
            ..SpaceConfig::default()
        };
        let s = FreeListSpace::new(config, 1024).unwrap();
        s.allocate(4).unwrap();
        let records = s.log().records();
        assert!(records.iter().any(|r| r.op == "allocate" && r.outcome == "dictionary_split"));
        assert!(records.iter().any(|r| r.op == "split"));
    }
}
