//! Word arena backing the space.
//!
//! The space is a fixed array of machine words; a chunk "pointer" is a word
//! index. A free chunk overlays its first three words with a header:
//!
//! ```text
//! word 0: size << 2 | CANT_COALESCE | FREE
//! word 1: next chunk in its list (NIL at the tail)
//! word 2: prev chunk in its list (NIL at the head)
//! ```
//!
//! An allocated block keeps `size << 2` with the FREE bit clear, so a block
//! handed out by the space never reads as free. Words are atomics accessed
//! with relaxed ordering; the structure locks order every header write
//! against the readers that depend on it.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{CorruptionError, SpaceError};

/// Link value meaning "no chunk".
pub const NIL: usize = usize::MAX;

const FREE: usize = 0b01;
const CANT_COALESCE: usize = 0b10;
const TAG_BITS: usize = 2;

/// Fixed-capacity word storage addressed by index.
pub struct ChunkArena {
    words: Box<[AtomicUsize]>,
}

impl ChunkArena {
    /// Creates a zeroed arena of `capacity` words.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let words: Vec<AtomicUsize> = (0..capacity).map(|_| AtomicUsize::new(0)).collect();
        Self {
            words: words.into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// Checks that `[start, start + size)` lies inside the arena.
    pub fn check_range(&self, start: usize, size: usize) -> Result<(), SpaceError> {
        match start.checked_add(size) {
            Some(end) if end <= self.capacity() => Ok(()),
            _ => Err(SpaceError::RangeOutOfBounds {
                start,
                size,
                capacity: self.capacity(),
            }),
        }
    }

    fn load(&self, addr: usize) -> usize {
        self.words[addr].load(Ordering::Relaxed)
    }

    fn store(&self, addr: usize, value: usize) {
        self.words[addr].store(value, Ordering::Relaxed);
    }

    /// Writes a free header with unlinked prev/next.
    pub fn write_free_header(&self, addr: usize, size: usize) {
        self.store(addr, (size << TAG_BITS) | FREE);
        self.store(addr + 1, NIL);
        self.store(addr + 2, NIL);
    }

    /// Writes a free header marked so external coalescing skips it.
    pub fn write_uncoalescable_header(&self, addr: usize, size: usize) {
        self.write_free_header(addr, size);
        self.store(addr, (size << TAG_BITS) | FREE | CANT_COALESCE);
    }

    /// Sets the size of a free chunk, keeping its flags and links.
    pub fn set_size(&self, addr: usize, size: usize) {
        let flags = self.load(addr) & (FREE | CANT_COALESCE);
        self.store(addr, (size << TAG_BITS) | flags);
    }

    /// Marks a block as handed out. Its header no longer reads as free.
    pub fn mark_not_free(&self, addr: usize, size: usize) {
        self.store(addr, size << TAG_BITS);
    }

    /// Flags a free chunk so external coalescing leaves it alone.
    pub fn dont_coalesce(&self, addr: usize) {
        self.words[addr].fetch_or(CANT_COALESCE, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_free(&self, addr: usize) -> bool {
        addr < self.capacity() && self.load(addr) & FREE != 0
    }

    #[must_use]
    pub fn cant_coalesce(&self, addr: usize) -> bool {
        addr < self.capacity() && self.load(addr) & CANT_COALESCE != 0
    }

    /// Size recorded in the header at `addr`, free or not.
    #[must_use]
    pub fn chunk_size(&self, addr: usize) -> usize {
        self.load(addr) >> TAG_BITS
    }

    #[must_use]
    pub fn next(&self, addr: usize) -> Option<usize> {
        decode(self.load(addr + 1))
    }

    #[must_use]
    pub fn prev(&self, addr: usize) -> Option<usize> {
        decode(self.load(addr + 2))
    }

    pub fn link_next(&self, addr: usize, next: Option<usize>) {
        self.store(addr + 1, next.unwrap_or(NIL));
    }

    pub fn link_prev(&self, addr: usize, prev: Option<usize>) {
        self.store(addr + 2, prev.unwrap_or(NIL));
    }

    /// Verifies that a queued chunk is free, in bounds and of `size` words.
    pub(crate) fn check_free_chunk(&self, addr: usize, size: usize) -> Result<(), CorruptionError> {
        if addr.checked_add(size).is_none_or(|end| end > self.capacity()) {
            return Err(CorruptionError::OutsideSpace {
                addr,
                size,
                capacity: self.capacity(),
            });
        }
        if !self.is_free(addr) {
            return Err(CorruptionError::NotFree { addr });
        }
        let recorded = self.chunk_size(addr);
        if recorded != size {
            return Err(CorruptionError::WrongClass {
                addr,
                size: recorded,
                class: size,
            });
        }
        Ok(())
    }
}

fn decode(raw: usize) -> Option<usize> {
    (raw != NIL).then_some(raw)
}
