//! Atomic counters for space observability.
//!
//! All counters use relaxed ordering; they are advisory, not
//! synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Which step of the allocation fallback chain satisfied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocPath {
    Lab,
    ExactList,
    Replenish,
    BestFit,
    DictionaryExact,
    DictionarySplit,
    RaidLarger,
}

impl AllocPath {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lab => "lab",
            Self::ExactList => "exact_list",
            Self::Replenish => "replenish",
            Self::BestFit => "best_fit",
            Self::DictionaryExact => "dictionary_exact",
            Self::DictionarySplit => "dictionary_split",
            Self::RaidLarger => "raid_larger",
        }
    }
}

/// Per-space operation counters.
#[derive(Debug, Default)]
pub struct SpaceMetrics {
    pub lab_hits: AtomicU64,
    pub exact_hits: AtomicU64,
    pub replenish_hits: AtomicU64,
    pub best_fit_hits: AtomicU64,
    pub dictionary_hits: AtomicU64,
    pub raid_hits: AtomicU64,
    /// Requests no path could satisfy.
    pub allocation_failures: AtomicU64,
    /// Chunks returned by callers or the sweeper.
    pub returns: AtomicU64,
    /// Chunks split into a piece and a remainder.
    pub splits: AtomicU64,
    pub lab_refills: AtomicU64,
    /// Batch refills of a worker buffer from the shared pool.
    pub plab_refills: AtomicU64,
    /// Unused chunks handed back when a worker buffer retires.
    pub plab_retired_chunks: AtomicU64,
}

impl SpaceMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub(crate) fn record_path(&self, path: AllocPath) {
        let counter = match path {
            AllocPath::Lab => &self.lab_hits,
            AllocPath::ExactList => &self.exact_hits,
            AllocPath::Replenish => &self.replenish_hits,
            AllocPath::BestFit => &self.best_fit_hits,
            AllocPath::DictionaryExact | AllocPath::DictionarySplit => &self.dictionary_hits,
            AllocPath::RaidLarger => &self.raid_hits,
        };
        Self::inc(counter);
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            lab_hits: Self::get(&self.lab_hits),
            exact_hits: Self::get(&self.exact_hits),
            replenish_hits: Self::get(&self.replenish_hits),
            best_fit_hits: Self::get(&self.best_fit_hits),
            dictionary_hits: Self::get(&self.dictionary_hits),
            raid_hits: Self::get(&self.raid_hits),
            allocation_failures: Self::get(&self.allocation_failures),
            returns: Self::get(&self.returns),
            splits: Self::get(&self.splits),
            lab_refills: Self::get(&self.lab_refills),
            plab_refills: Self::get(&self.plab_refills),
            plab_retired_chunks: Self::get(&self.plab_retired_chunks),
        }
    }
}

/// Point-in-time snapshot of all space counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub lab_hits: u64,
    pub exact_hits: u64,
    pub replenish_hits: u64,
    pub best_fit_hits: u64,
    pub dictionary_hits: u64,
    pub raid_hits: u64,
    pub allocation_failures: u64,
    pub returns: u64,
    pub splits: u64,
    pub lab_refills: u64,
    pub plab_refills: u64,
    pub plab_retired_chunks: u64,
}

impl MetricsSnapshot {
    /// Successful mutator allocations across every path.
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.lab_hits
            + self.exact_hits
            + self.replenish_hits
            + self.best_fit_hits
            + self.dictionary_hits
            + self.raid_hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_land_in_their_counters() {
        let metrics = SpaceMetrics::new();
        metrics.record_path(AllocPath::Lab);
        metrics.record_path(AllocPath::DictionaryExact);
        metrics.record_path(AllocPath::DictionarySplit);
        let snap = metrics.snapshot();
        assert_eq!(snap.lab_hits, 1);
        assert_eq!(snap.dictionary_hits, 2);
        assert_eq!(snap.allocations(), 3);
    }

    #[test]
    fn snapshot_serializes() {
        let metrics = SpaceMetrics::new();
        SpaceMetrics::add(&metrics.splits, 5);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["splits"], 5);
    }
}
