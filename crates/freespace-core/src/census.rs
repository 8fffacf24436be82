//! Sweep census and fragmentation accounting.
//!
//! A sweep is bracketed by [`FreeListSpace::begin_census`] and
//! [`FreeListSpace::end_census`]. Begin projects each size's demand over the
//! next inter-sweep interval into `desired` and a coalescing target; end
//! re-bases `surplus` against `desired`, lays the best-fit hint chain over the
//! classes that still have a surplus, and clears the per-sweep tallies.

use std::time::Instant;

use serde::Serialize;

use crate::lifecycle::LogLevel;
use crate::space::FreeListSpace;
use crate::stats::{AdaptivePaddedAverage, CensusStats, SweepTiming};

/// Inter- and intra-sweep timing, kept under the space-wide lock.
#[derive(Debug, Clone)]
pub(crate) struct SweepClock {
    inter_sweep_start: Instant,
    intra_sweep_start: Option<Instant>,
    inter_sweep_estimate: AdaptivePaddedAverage,
    intra_sweep_estimate: AdaptivePaddedAverage,
    epoch: u64,
}

impl SweepClock {
    pub(crate) fn new(weight: u32, padding: f64) -> Self {
        Self {
            inter_sweep_start: Instant::now(),
            intra_sweep_start: None,
            inter_sweep_estimate: AdaptivePaddedAverage::new(weight, padding),
            intra_sweep_estimate: AdaptivePaddedAverage::new(weight, padding),
            epoch: 0,
        }
    }
}

/// Census of every active size plus the global fragmentation figure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CensusReport {
    /// Completed sweeps.
    pub epoch: u64,
    pub free_words: usize,
    pub fragmentation: f64,
    /// Indexed classes with any chunks, demand or activity.
    pub classes: Vec<CensusStats>,
    pub dictionary: Vec<CensusStats>,
}

fn is_idle(stats: &CensusStats) -> bool {
    stats.count == 0
        && stats.surplus == 0
        && stats.desired == 0
        && stats.coal_births == 0
        && stats.coal_deaths == 0
        && stats.split_births == 0
        && stats.split_deaths == 0
}

impl FreeListSpace {
    /// Starts a sweep, measuring the inter-sweep interval by wall clock.
    pub fn begin_census(&self) -> SweepTiming {
        let elapsed = self.lock_global().clock.inter_sweep_start.elapsed().as_secs_f64();
        self.begin_census_with_interval(elapsed)
    }

    /// Starts a sweep that follows an inter-sweep interval of `secs`.
    pub fn begin_census_with_interval(&self, secs: f64) -> SweepTiming {
        let mut global = self.lock_global();
        let clock = &mut global.clock;
        clock.inter_sweep_estimate.sample(secs);
        clock.intra_sweep_start = Some(Instant::now());
        let timing = SweepTiming {
            inter_sweep_current: secs,
            inter_sweep_estimate: clock.inter_sweep_estimate.padded_average(),
            intra_sweep_estimate: clock.intra_sweep_estimate.padded_average(),
        };
        let epoch = clock.epoch;

        let lists = self.context().lists();
        let policy = *lists.policy();
        let coal_percent = self.config().small_coal_surplus_percent;
        let mut guards = lists.lock_all();
        for size in lists.valid_classes() {
            let list = &mut guards[size];
            let count = list.count();
            list.stats_mut().begin_sweep(count, coal_percent, &timing, &policy);
        }
        self.context()
            .dictionary()
            .begin_census(self.config().large_coal_surplus_percent, &timing);
        drop(guards);
        drop(global);

        self.log().record(
            LogLevel::Info,
            "census",
            "begin",
            None,
            None,
            "begun",
            format_args!(
                "epoch={epoch} inter={secs:.6} inter_est={:.6} intra_est={:.6}",
                timing.inter_sweep_estimate, timing.intra_sweep_estimate
            ),
        );
        timing
    }

    /// Ends the sweep, measuring its duration by wall clock.
    pub fn end_census(&self) {
        let elapsed = self
            .lock_global()
            .clock
            .intra_sweep_start
            .map_or(0.0, |start| start.elapsed().as_secs_f64());
        self.end_census_with_duration(elapsed);
    }

    /// Ends a sweep that took `secs`.
    pub fn end_census_with_duration(&self, secs: f64) {
        let mut global = self.lock_global();
        let clock = &mut global.clock;
        clock.intra_sweep_estimate.sample(secs);
        clock.intra_sweep_start = None;
        clock.inter_sweep_start = Instant::now();
        clock.epoch += 1;
        let epoch = clock.epoch;

        let lists = self.context().lists();
        let split_percent = self.config().small_split_surplus_percent;
        let mut guards = lists.lock_all();
        for size in lists.valid_classes() {
            let list = &mut guards[size];
            let count = list.count();
            list.stats_mut().end_sweep(count, split_percent);
        }
        lists.set_hints(&mut guards);
        self.context()
            .dictionary()
            .end_census(self.config().large_split_surplus_percent);
        drop(guards);
        drop(global);

        self.log().record(
            LogLevel::Info,
            "census",
            "end",
            None,
            None,
            "ended",
            format_args!("epoch={epoch} intra={secs:.6}"),
        );
    }

    /// Completed sweeps.
    #[must_use]
    pub fn census_epoch(&self) -> u64 {
        self.lock_global().clock.epoch
    }

    /// `1 - Σ count·size² / (Σ count·size)²` over the lists and the
    /// dictionary, read under every structure lock. 0 when nothing is free or
    /// everything free is one chunk; approaches 1 as free memory scatters.
    #[must_use]
    pub fn fragmentation_metric(&self) -> f64 {
        let lists = self.context().lists();
        let guards = lists.lock_all();
        let dict = self.context().dictionary();
        let mut total = 0.0;
        let mut squares = 0.0;
        for size in lists.valid_classes() {
            let count = guards[size].count() as f64;
            let words = size as f64;
            total += count * words;
            squares += count * words * words;
        }
        total += dict.total_words() as f64;
        squares += dict.sum_of_squared_block_sizes();
        if total == 0.0 {
            return 0.0;
        }
        (1.0 - squares / (total * total)).clamp(0.0, 1.0)
    }

    /// Census for one size: its class, or its dictionary entry if present.
    #[must_use]
    pub fn census_stats(&self, size: usize) -> Option<CensusStats> {
        let lists = self.context().lists();
        if lists.is_indexed(size) {
            Some(lists.census(size))
        } else if size >= lists.index_limit() {
            self.context().dictionary().census(size)
        } else {
            None
        }
    }

    #[must_use]
    pub fn census_report(&self) -> CensusReport {
        let lists = self.context().lists();
        let classes = lists
            .valid_classes()
            .into_iter()
            .map(|size| lists.census(size))
            .filter(|stats| !is_idle(stats))
            .collect();
        let dictionary = self.context().dictionary().census_all();
        CensusReport {
            epoch: self.census_epoch(),
            free_words: self.free_words(),
            fragmentation: self.fragmentation_metric(),
            classes,
            dictionary,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SpaceConfig;
    use crate::space::FreeListSpace;

    fn space(capacity: usize) -> FreeListSpace {
        FreeListSpace::new(SpaceConfig::default(), capacity).unwrap()
    }

    #[test]
    fn desired_follows_epoch_demand() {
        let s = space(4096);
        let blocks: Vec<usize> = (0..10).map(|_| s.allocate(8).unwrap()).collect();
        for &addr in &blocks {
            s.return_chunk(addr, 8).unwrap();
        }
        s.end_census_with_duration(0.0);
        assert_eq!(s.census_stats(8).unwrap().surplus, 10);
        assert_eq!(s.census_stats(8).unwrap().prev_sweep, 10);

        for _ in 0..6 {
            s.allocate(8).unwrap();
        }
        // 10 at the last sweep, 4 now: demand 6 over 1s, projected over a
        // 1s estimate.
        let timing = s.begin_census_with_interval(1.0);
        assert_eq!(timing.inter_sweep_estimate, 1.0);
        let stats = s.census_stats(8).unwrap();
        assert_eq!(stats.desired, 6);
        assert_eq!(stats.coal_desired, 6);
        assert_eq!(stats.before_sweep, 4);
        assert_eq!(stats.bfr_surp, 4);

        s.end_census_with_duration(0.1);
        let stats = s.census_stats(8).unwrap();
        // 4 - floor(6 * 1.10)
        assert_eq!(stats.surplus, -2);
        assert!(!s.coal_over_populated(8));
        assert_eq!(s.census_epoch(), 2);
    }

    #[test]
    fn hints_point_at_next_surplus_class() {
        let s = space(1024);
        let a = s.allocate(10).unwrap();
        let b = s.allocate(40).unwrap();
        let _guard = s.allocate(8).unwrap();
        s.return_chunk(a, 10).unwrap();
        s.return_chunk(b, 40).unwrap();
        s.end_census();
        assert_eq!(s.census_stats(5).unwrap().hint, Some(10));
        assert_eq!(s.census_stats(10).unwrap().hint, Some(40));
        assert_eq!(s.census_stats(20).unwrap().hint, Some(40));
        assert_eq!(s.census_stats(50).unwrap().hint, Some(257));
        assert_eq!(s.census_stats(2), None);
    }

    #[test]
    fn single_chunk_has_no_fragmentation() {
        let s = space(1024);
        assert_eq!(s.fragmentation_metric(), 0.0);
        let exhausted = space(32);
        exhausted.allocate(32).unwrap();
        assert_eq!(exhausted.fragmentation_metric(), 0.0);
    }

    #[test]
    fn fragmentation_grows_with_scatter() {
        let s = space(1024);
        let blocks: Vec<usize> = (0..3).map(|_| s.allocate(4).unwrap()).collect();
        for &addr in &blocks {
            s.return_chunk(addr, 4).unwrap();
        }
        // Three 4-word chunks and one of 1012: 1 - (3·16 + 1012²) / 1024².
        let expected = 1.0 - (48.0 + 1012.0 * 1012.0) / (1024.0 * 1024.0);
        let got = s.fragmentation_metric();
        assert!((got - expected).abs() < 1e-12, "got {got}, expected {expected}");
        assert!(got > 0.0 && got < 1.0);
    }

    #[test]
    fn report_lists_active_sizes() {
        let s = space(1024);
        let a = s.allocate(12).unwrap();
        let _guard = s.allocate(12).unwrap();
        s.return_chunk(a, 12).unwrap();
        s.begin_census();
        s.end_census();
        let report = s.census_report();
        assert_eq!(report.epoch, 1);
        assert_eq!(report.free_words, 1012);
        assert!(report.classes.iter().any(|c| c.size == 12 && c.count == 1));
        assert_eq!(report.dictionary.len(), 1);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["epoch"], 1);
        assert!(json["classes"].is_array());
    }
}
