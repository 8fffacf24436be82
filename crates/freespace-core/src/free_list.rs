//! Intrusive doubly linked list of same-size free chunks.
//!
//! The links live in the chunk headers inside the [`ChunkArena`]; the list
//! itself only holds head, tail, count and census counters. Every method that
//! touches links takes the arena explicitly.

use crate::arena::ChunkArena;
use crate::error::CorruptionError;
use crate::stats::{AllocationStats, CensusStats, DemandPolicy};

/// Where a returned chunk is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertAt {
    /// LIFO: the next allocation of this size reuses the chunk while it is
    /// still warm.
    Head,
    /// FIFO: every queued chunk is reached before the newest one.
    Tail,
}

/// One list of free chunks of exactly `size` words.
#[derive(Debug, Clone)]
pub struct FreeList {
    size: usize,
    head: Option<usize>,
    tail: Option<usize>,
    count: usize,
    /// Next larger size class with a surplus; `index_limit` means none.
    hint: usize,
    stats: AllocationStats,
}

impl FreeList {
    pub(crate) fn new(size: usize, hint: usize, policy: &DemandPolicy) -> Self {
        Self {
            size,
            head: None,
            tail: None,
            count: 0,
            hint,
            stats: AllocationStats::new(policy),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub fn head(&self) -> Option<usize> {
        self.head
    }

    #[must_use]
    pub fn hint(&self) -> usize {
        self.hint
    }

    pub(crate) fn set_hint(&mut self, hint: usize) {
        self.hint = hint;
    }

    #[must_use]
    pub fn stats(&self) -> &AllocationStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut AllocationStats {
        &mut self.stats
    }

    /// Free words held by this list.
    #[must_use]
    pub fn total_words(&self) -> usize {
        self.size * self.count
    }

    /// Queues a chunk, writing a fresh free header for it.
    pub fn insert(&mut self, arena: &ChunkArena, addr: usize, at: InsertAt) {
        arena.write_free_header(addr, self.size);
        match at {
            InsertAt::Head => {
                arena.link_next(addr, self.head);
                match self.head {
                    Some(old) => arena.link_prev(old, Some(addr)),
                    None => self.tail = Some(addr),
                }
                self.head = Some(addr);
            }
            InsertAt::Tail => {
                arena.link_prev(addr, self.tail);
                match self.tail {
                    Some(old) => arena.link_next(old, Some(addr)),
                    None => self.head = Some(addr),
                }
                self.tail = Some(addr);
            }
        }
        self.count += 1;
        self.stats.surplus += 1;
    }

    /// Pops the head chunk, leaving its free header in place.
    pub fn pop_head(&mut self, arena: &ChunkArena) -> Option<usize> {
        let addr = self.head?;
        let next = arena.next(addr);
        self.head = next;
        match next {
            Some(n) => arena.link_prev(n, None),
            None => self.tail = None,
        }
        arena.link_next(addr, None);
        self.count -= 1;
        self.stats.surplus -= 1;
        Some(addr)
    }

    /// Whether `addr` is linked into this list: its neighbors point back at
    /// it, or it is the head or tail.
    fn is_linked(&self, arena: &ChunkArena, addr: usize) -> bool {
        let has_header = |a: usize| a.checked_add(2).is_some_and(|last| last < arena.capacity());
        if self.count == 0 || !has_header(addr) {
            return false;
        }
        let from_prev = match arena.prev(addr) {
            Some(p) => has_header(p) && arena.next(p) == Some(addr),
            None => self.head == Some(addr),
        };
        let from_next = match arena.next(addr) {
            Some(n) => has_header(n) && arena.prev(n) == Some(addr),
            None => self.tail == Some(addr),
        };
        from_prev && from_next
    }

    /// Unlinks a specific chunk. A chunk not linked into this list is left
    /// alone and `false` returned.
    pub fn remove(&mut self, arena: &ChunkArena, addr: usize) -> bool {
        if !self.is_linked(arena, addr) {
            return false;
        }
        let prev = arena.prev(addr);
        let next = arena.next(addr);
        match prev {
            Some(p) => arena.link_next(p, next),
            None => self.head = next,
        }
        match next {
            Some(n) => arena.link_prev(n, prev),
            None => self.tail = prev,
        }
        arena.link_next(addr, None);
        arena.link_prev(addr, None);
        self.count -= 1;
        self.stats.surplus -= 1;
        true
    }

    /// Moves up to `n` chunks from the head of this list into a detached list.
    pub fn take_first_n(&mut self, arena: &ChunkArena, n: usize) -> FreeList {
        let mut out = FreeList {
            size: self.size,
            head: None,
            tail: None,
            count: 0,
            hint: self.hint,
            stats: self.stats.clone(),
        };
        out.stats.surplus = 0;
        let take = n.min(self.count);
        if take == 0 {
            return out;
        }
        let first = self.head;
        let mut last = first;
        for _ in 1..take {
            last = last.and_then(|addr| arena.next(addr));
        }
        let Some(last_addr) = last else {
            return out;
        };
        let rest = arena.next(last_addr);
        arena.link_next(last_addr, None);
        self.head = rest;
        match rest {
            Some(r) => arena.link_prev(r, None),
            None => self.tail = None,
        }
        self.count -= take;
        self.stats.surplus -= take as isize;
        out.head = first;
        out.tail = Some(last_addr);
        out.count = take;
        out.stats.surplus = take as isize;
        out
    }

    /// Splices every chunk of `other` in front of this list's head.
    pub fn prepend(&mut self, arena: &ChunkArena, other: &mut FreeList) {
        debug_assert_eq!(self.size, other.size, "prepending a list of another size");
        let (Some(other_head), Some(other_tail)) = (other.head, other.tail) else {
            return;
        };
        arena.link_next(other_tail, self.head);
        match self.head {
            Some(old) => arena.link_prev(old, Some(other_tail)),
            None => self.tail = Some(other_tail),
        }
        self.head = Some(other_head);
        self.count += other.count;
        self.stats.surplus += other.count as isize;
        other.head = None;
        other.tail = None;
        other.count = 0;
        other.stats.surplus = 0;
    }

    /// Addresses on the list, head first.
    pub fn iter<'a>(&self, arena: &'a ChunkArena) -> impl Iterator<Item = usize> + 'a {
        let bound = self.count;
        let mut cursor = self.head;
        let mut steps = 0usize;
        std::iter::from_fn(move || {
            if steps > bound {
                return None;
            }
            let addr = cursor?;
            steps += 1;
            cursor = arena.next(addr);
            Some(addr)
        })
    }

    /// Walks the links, checking headers, back links and the count.
    pub fn verify(&self, arena: &ChunkArena, structure: &'static str) -> Result<(), CorruptionError> {
        let mut linked = 0usize;
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(addr) = cursor {
            if linked >= self.count {
                return Err(CorruptionError::CountMismatch {
                    structure,
                    size: self.size,
                    recorded: self.count,
                    linked: linked + 1,
                });
            }
            arena.check_free_chunk(addr, self.size)?;
            let back = arena.prev(addr);
            if back != prev {
                return Err(CorruptionError::BrokenLink {
                    addr,
                    expected: prev,
                    found: back,
                });
            }
            linked += 1;
            prev = Some(addr);
            cursor = arena.next(addr);
        }
        if linked != self.count || prev != self.tail {
            return Err(CorruptionError::CountMismatch {
                structure,
                size: self.size,
                recorded: self.count,
                linked,
            });
        }
        Ok(())
    }

    pub(crate) fn census(&self) -> CensusStats {
        self.stats.snapshot(self.size, self.count, Some(self.hint))
    }

    /// Empties the list without touching the arena. Demand history
    /// survives; membership and per-sweep tallies do not.
    pub(crate) fn reset(&mut self, hint: usize) {
        self.head = None;
        self.tail = None;
        self.count = 0;
        self.hint = hint;
        self.stats.surplus = 0;
        self.stats.clear_census(0);
    }
}
