//! Size-ordered dictionary for chunks too large for the indexed classes.
//!
//! An ordered map from size to an intrusive list of same-size chunks; a map
//! entry exists exactly while its list is non-empty. The dictionary lives
//! behind its own ranked lock and `&mut self` methods require that guard,
//! so holding the guard is the lock token parallel callers pass around.

use std::collections::BTreeMap;

use crate::arena::ChunkArena;
use crate::config::DictionaryFit;
use crate::error::CorruptionError;
use crate::free_list::{FreeList, InsertAt};
use crate::stats::{CensusEvent, CensusStats, DemandPolicy, SweepTiming};

/// How closely a removed chunk must match the requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dither {
    Exactly,
    AtLeast,
}

pub struct Dictionary {
    lists: BTreeMap<usize, FreeList>,
    fit: DictionaryFit,
    policy: DemandPolicy,
    total_words: usize,
    total_count: usize,
}

impl Dictionary {
    pub(crate) fn new(fit: DictionaryFit, policy: DemandPolicy) -> Self {
        Self {
            lists: BTreeMap::new(),
            fit,
            policy,
            total_words: 0,
            total_count: 0,
        }
    }

    #[must_use]
    pub fn fit(&self) -> DictionaryFit {
        self.fit
    }

    /// Adds a chunk. Same-size chunks chain off one entry, newest first.
    pub fn insert(&mut self, arena: &ChunkArena, addr: usize, size: usize) {
        let policy = self.policy;
        self.lists
            .entry(size)
            .or_insert_with(|| FreeList::new(size, 0, &policy))
            .insert(arena, addr, InsertAt::Head);
        self.total_words += size;
        self.total_count += 1;
    }

    /// Removes a chunk of exactly `size` words.
    pub fn remove_exact(&mut self, arena: &ChunkArena, size: usize) -> Option<usize> {
        self.pop_from(arena, size)
    }

    /// Removes a chunk of at least `size` words: the smallest such chunk
    /// under best fit, the largest under largest-first.
    pub fn remove_at_least(&mut self, arena: &ChunkArena, size: usize, dither: Dither) -> Option<(usize, usize)> {
        if dither == Dither::Exactly {
            return self.pop_from(arena, size).map(|addr| (addr, size));
        }
        let found = match self.fit {
            DictionaryFit::BestFit => self.lists.range(size..).next().map(|(&s, _)| s),
            DictionaryFit::LargestFirst => self.lists.keys().next_back().copied().filter(|&s| s >= size),
        }?;
        self.pop_from(arena, found).map(|addr| (addr, found))
    }

    /// Removes a chunk of the largest size present.
    pub fn remove_largest(&mut self, arena: &ChunkArena) -> Option<(usize, usize)> {
        let size = *self.lists.keys().next_back()?;
        self.pop_from(arena, size).map(|addr| (addr, size))
    }

    fn pop_from(&mut self, arena: &ChunkArena, size: usize) -> Option<usize> {
        let list = self.lists.get_mut(&size)?;
        let addr = list.pop_head(arena)?;
        if list.is_empty() {
            self.lists.remove(&size);
        }
        self.total_words -= size;
        self.total_count -= 1;
        Some(addr)
    }

    /// Unlinks a specific chunk. `false` if it is not queued here.
    pub fn remove_chunk(&mut self, arena: &ChunkArena, addr: usize, size: usize) -> bool {
        let Some(list) = self.lists.get_mut(&size) else {
            return false;
        };
        if !list.remove(arena, addr) {
            return false;
        }
        if list.is_empty() {
            self.lists.remove(&size);
        }
        self.total_words -= size;
        self.total_count -= 1;
        true
    }

    /// A chunk of the largest size present, left in place.
    #[must_use]
    pub fn find_largest(&self) -> Option<(usize, usize)> {
        let (&size, list) = self.lists.iter().next_back()?;
        list.head().map(|addr| (addr, size))
    }

    /// The chunk whose last word is `end - 1`, if any.
    #[must_use]
    pub fn find_chunk_ends_at(&self, arena: &ChunkArena, end: usize) -> Option<(usize, usize)> {
        self.lists.iter().find_map(|(&size, list)| {
            let start = end.checked_sub(size)?;
            list.iter(arena).find(|&addr| addr == start).map(|addr| (addr, size))
        })
    }

    #[must_use]
    pub fn total_words(&self) -> usize {
        self.total_words
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.total_count
    }

    #[must_use]
    pub fn max_chunk_size(&self) -> usize {
        self.lists.keys().next_back().copied().unwrap_or(0)
    }

    /// `Σ count · size²` over every entry.
    #[must_use]
    pub fn sum_of_squared_block_sizes(&self) -> f64 {
        self.lists
            .values()
            .map(|list| {
                let size = list.size() as f64;
                list.count() as f64 * size * size
            })
            .sum()
    }

    /// Records a census event if an entry of `size` exists. A death that
    /// emptied the entry, or a birth that never entered the dictionary, has
    /// nowhere to be recorded.
    pub fn census_update(&mut self, size: usize, event: CensusEvent) {
        if let Some(list) = self.lists.get_mut(&size) {
            list.stats_mut().record(event, 1);
        }
    }

    pub fn begin_census(&mut self, coal_percent: f64, timing: &SweepTiming) {
        let policy = self.policy;
        for list in self.lists.values_mut() {
            let count = list.count();
            list.stats_mut().begin_sweep(count, coal_percent, timing, &policy);
        }
    }

    pub fn end_census(&mut self, split_percent: f64) {
        for list in self.lists.values_mut() {
            let count = list.count();
            list.stats_mut().end_sweep(count, split_percent);
        }
    }

    /// Absent sizes count as over-populated: nothing is lost by merging
    /// them away. Present sizes use the size-class rule; an entry always
    /// holds a chunk, so a zero target already makes it over-populated.
    #[must_use]
    pub fn coal_over_populated(&self, size: usize) -> bool {
        self.lists
            .get(&size)
            .is_none_or(|list| list.stats().coal_over_populated(list.count()))
    }

    #[must_use]
    pub fn census(&self, size: usize) -> Option<CensusStats> {
        self.lists
            .get(&size)
            .map(|list| list.stats().snapshot(size, list.count(), None))
    }

    pub fn census_all(&self) -> Vec<CensusStats> {
        self.lists
            .values()
            .map(|list| list.stats().snapshot(list.size(), list.count(), None))
            .collect()
    }

    /// Every `(addr, size)` held, in size order.
    pub fn chunks(&self, arena: &ChunkArena) -> Vec<(usize, usize)> {
        self.lists
            .values()
            .flat_map(|list| list.iter(arena).map(move |addr| (addr, list.size())))
            .collect()
    }

    pub fn verify(&self, arena: &ChunkArena) -> Result<(), CorruptionError> {
        let mut words = 0usize;
        let mut count = 0usize;
        for list in self.lists.values() {
            list.verify(arena, "dictionary")?;
            if list.is_empty() {
                return Err(CorruptionError::CountMismatch {
                    structure: "dictionary",
                    size: list.size(),
                    recorded: 0,
                    linked: 0,
                });
            }
            words += list.total_words();
            count += list.count();
        }
        if words != self.total_words {
            return Err(CorruptionError::DictionaryTotalMismatch {
                recorded: self.total_words,
                actual: words,
            });
        }
        if count != self.total_count {
            return Err(CorruptionError::CountMismatch {
                structure: "dictionary",
                size: 0,
                recorded: self.total_count,
                linked: count,
            });
        }
        Ok(())
    }

    /// Forgets every chunk, marking each allocated in the arena.
    pub(crate) fn clear(&mut self, arena: &ChunkArena) {
        for (addr, size) in self.chunks(arena) {
            arena.mark_not_free(addr, size);
        }
        self.lists.clear();
        self.total_words = 0;
        self.total_count = 0;
    }
}
