//! Ranked locks.
//!
//! Every shared structure sits behind a [`RankedMutex`]. A thread may only
//! acquire a lock whose rank is strictly greater than every rank it already
//! holds: the space-wide lock first, then size classes in ascending size,
//! then the dictionary. Debug builds assert the order on each acquisition;
//! release builds skip the bookkeeping.

use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

/// Rank of the space-wide lock (LAB, sweep timing, serial regime).
pub(crate) const GLOBAL_RANK: usize = 0;

/// Rank of the dictionary lock; above every size class.
pub(crate) const DICTIONARY_RANK: usize = usize::MAX;

/// Rank of the lock guarding size class `size`.
pub(crate) const fn class_rank(size: usize) -> usize {
    size + 1
}

#[cfg(debug_assertions)]
mod held {
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn acquire(rank: usize) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&top) = held.iter().max() {
                debug_assert!(
                    rank > top,
                    "lock order violation: acquiring rank {rank} while holding rank {top}"
                );
            }
            held.push(rank);
        });
    }

    pub(super) fn release(rank: usize) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&r| r == rank) {
                held.remove(pos);
            }
        });
    }

    pub(super) fn holds(rank: usize) -> bool {
        HELD.with(|held| held.borrow().contains(&rank))
    }
}

/// A `parking_lot::Mutex` with a fixed position in the lock order.
pub struct RankedMutex<T> {
    rank: usize,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    pub(crate) fn new(rank: usize, value: T) -> Self {
        Self {
            rank,
            inner: Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self) -> RankedGuard<'_, T> {
        #[cfg(debug_assertions)]
        held::acquire(self.rank);
        RankedGuard {
            rank: self.rank,
            guard: self.inner.lock(),
        }
    }
}

/// Whether the current thread holds a lock of `rank`. Always false in
/// release builds.
pub(crate) fn holds_rank(rank: usize) -> bool {
    #[cfg(debug_assertions)]
    {
        held::holds(rank)
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = rank;
        false
    }
}

pub struct RankedGuard<'a, T> {
    rank: usize,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for RankedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RankedGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        held::release(self.rank);
        #[cfg(not(debug_assertions))]
        let _ = self.rank;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascending_acquisition_is_allowed() {
        let global = RankedMutex::new(GLOBAL_RANK, 0u32);
        let small = RankedMutex::new(class_rank(4), 0u32);
        let large = RankedMutex::new(class_rank(16), 0u32);
        let dict = RankedMutex::new(DICTIONARY_RANK, 0u32);
        let _g = global.lock();
        let _s = small.lock();
        let _l = large.lock();
        let mut d = dict.lock();
        *d += 1;
        assert_eq!(*d, 1);
    }

    #[test]
    fn release_allows_reacquiring_lower_rank() {
        let small = RankedMutex::new(class_rank(4), ());
        let dict = RankedMutex::new(DICTIONARY_RANK, ());
        {
            let _d = dict.lock();
        }
        let _s = small.lock();
        drop(_s);
        let _d = dict.lock();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn descending_acquisition_panics_in_debug() {
        let small = RankedMutex::new(class_rank(4), ());
        let dict = RankedMutex::new(DICTIONARY_RANK, ());
        let _d = dict.lock();
        let _s = small.lock();
    }

    #[cfg(debug_assertions)]
    #[test]
    fn holds_rank_tracks_guards() {
        let m = RankedMutex::new(class_rank(9), ());
        assert!(!holds_rank(class_rank(9)));
        let g = m.lock();
        assert!(holds_rank(class_rank(9)));
        drop(g);
        assert!(!holds_rank(class_rank(9)));
    }
}
