//! Census bookkeeping shared by the size-class lists and the dictionary.

use serde::Serialize;

/// Samples needed before the configured weight applies unmodified.
const OLD_THRESHOLD: u32 = 100;

/// Exponentially weighted average that leans on early samples less
/// aggressively: the n-th sample gets weight `max(weight, 100 / n)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveWeightedAverage {
    average: f64,
    last_sample: f64,
    sample_count: u32,
    weight: u32,
}

impl AdaptiveWeightedAverage {
    #[must_use]
    pub fn new(weight: u32) -> Self {
        Self::with_average(weight, 0.0)
    }

    /// Starts from `average` as if it had already been observed.
    #[must_use]
    pub fn with_average(weight: u32, average: f64) -> Self {
        Self {
            average,
            last_sample: 0.0,
            sample_count: 0,
            weight: weight.min(100),
        }
    }

    pub fn sample(&mut self, value: f64) {
        self.sample_count = self.sample_count.saturating_add(1);
        self.average = self.blend(value, self.average);
        self.last_sample = value;
    }

    fn adaptive_weight(&self) -> u32 {
        if self.sample_count >= OLD_THRESHOLD || self.sample_count == 0 {
            self.weight
        } else {
            self.weight.max(OLD_THRESHOLD / self.sample_count)
        }
    }

    fn blend(&self, value: f64, average: f64) -> f64 {
        let w = f64::from(self.adaptive_weight());
        ((100.0 - w) * average + w * value) / 100.0
    }

    #[must_use]
    pub fn average(&self) -> f64 {
        self.average
    }

    #[must_use]
    pub fn last_sample(&self) -> f64 {
        self.last_sample
    }

    #[must_use]
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }
}

/// Weighted average plus a padding of `padding` deviations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptivePaddedAverage {
    base: AdaptiveWeightedAverage,
    deviation: f64,
    padded: f64,
    padding: f64,
}

impl AdaptivePaddedAverage {
    #[must_use]
    pub fn new(weight: u32, padding: f64) -> Self {
        Self {
            base: AdaptiveWeightedAverage::new(weight),
            deviation: 0.0,
            padded: 0.0,
            padding,
        }
    }

    pub fn sample(&mut self, value: f64) {
        self.base.sample(value);
        let average = self.base.average();
        self.deviation = self.base.blend((value - average).abs(), self.deviation);
        self.padded = average + self.padding * self.deviation;
    }

    #[must_use]
    pub fn average(&self) -> f64 {
        self.base.average()
    }

    #[must_use]
    pub fn padded_average(&self) -> f64 {
        self.padded
    }

    #[must_use]
    pub fn deviation(&self) -> f64 {
        self.deviation
    }
}

/// Sweep timing handed to a census pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepTiming {
    /// Seconds since the previous sweep ended.
    pub inter_sweep_current: f64,
    /// Padded estimate of the inter-sweep interval.
    pub inter_sweep_estimate: f64,
    /// Padded estimate of the sweep duration.
    pub intra_sweep_estimate: f64,
}

/// Parameters for projecting demand from one sweep interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DemandPolicy {
    pub weight: u32,
    pub padding: f64,
    pub threshold_secs: f64,
    pub extrapolate: bool,
}

/// Per-size census counters.
///
/// `surplus` moves with membership between census points (+1 when a chunk
/// joins the list, -1 when it leaves) and is re-based at the end of each
/// sweep. Births and deaths are tallied separately and cleared per sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationStats {
    pub(crate) desired: isize,
    pub(crate) coal_desired: isize,
    pub(crate) surplus: isize,
    pub(crate) bfr_surp: isize,
    pub(crate) prev_sweep: isize,
    pub(crate) before_sweep: isize,
    pub(crate) coal_births: isize,
    pub(crate) coal_deaths: isize,
    pub(crate) split_births: isize,
    pub(crate) split_deaths: isize,
    demand_rate: AdaptivePaddedAverage,
}

impl AllocationStats {
    #[must_use]
    pub(crate) fn new(policy: &DemandPolicy) -> Self {
        Self {
            desired: 0,
            coal_desired: 0,
            surplus: 0,
            bfr_surp: 0,
            prev_sweep: 0,
            before_sweep: 0,
            coal_births: 0,
            coal_deaths: 0,
            split_births: 0,
            split_deaths: 0,
            demand_rate: AdaptivePaddedAverage::new(policy.weight, policy.padding),
        }
    }

    /// Updates `desired` from the demand observed since the last sweep.
    ///
    /// Demand is what the list lost net of births and deaths; intervals at or
    /// below the threshold are too short to yield a meaningful rate.
    pub(crate) fn compute_desired(&mut self, count: usize, timing: &SweepTiming, policy: &DemandPolicy) {
        if timing.inter_sweep_current <= policy.threshold_secs {
            return;
        }
        let demand = self.prev_sweep - count as isize + self.split_births + self.coal_births
            - self.split_deaths
            - self.coal_deaths;
        let rate = demand.max(0) as f64 / timing.inter_sweep_current;
        self.demand_rate.sample(rate);
        let horizon = if policy.extrapolate {
            timing.inter_sweep_estimate + timing.intra_sweep_estimate
        } else {
            timing.inter_sweep_estimate
        };
        self.desired = (self.demand_rate.padded_average() * horizon) as isize;
    }

    /// Sweep-start bookkeeping: desired, coalescing target, snapshots.
    pub(crate) fn begin_sweep(
        &mut self,
        count: usize,
        coal_percent: f64,
        timing: &SweepTiming,
        policy: &DemandPolicy,
    ) {
        self.compute_desired(count, timing, policy);
        self.coal_desired = (self.desired as f64 * coal_percent) as isize;
        self.before_sweep = count as isize;
        self.bfr_surp = self.surplus;
    }

    /// Sweep-end bookkeeping: re-base surplus and clear per-sweep tallies.
    pub(crate) fn end_sweep(&mut self, count: usize, split_percent: f64) {
        self.surplus = count as isize - (self.desired as f64 * split_percent) as isize;
        self.clear_census(count);
    }

    pub(crate) fn clear_census(&mut self, count: usize) {
        self.prev_sweep = count as isize;
        self.coal_births = 0;
        self.coal_deaths = 0;
        self.split_births = 0;
        self.split_deaths = 0;
    }

    /// More chunks than the coalescing target: safe to merge upward.
    #[must_use]
    pub(crate) fn coal_over_populated(&self, count: usize) -> bool {
        self.coal_desired < 0 || count as isize > self.coal_desired
    }

    pub(crate) fn record(&mut self, event: CensusEvent, n: usize) {
        let n = n as isize;
        match event {
            CensusEvent::SplitBirth => self.split_births += n,
            CensusEvent::SplitDeath => self.split_deaths += n,
            CensusEvent::CoalBirth => self.coal_births += n,
            CensusEvent::CoalDeath => self.coal_deaths += n,
        }
    }

    #[must_use]
    pub fn surplus(&self) -> isize {
        self.surplus
    }

    #[must_use]
    pub fn desired(&self) -> isize {
        self.desired
    }

    pub(crate) fn snapshot(&self, size: usize, count: usize, hint: Option<usize>) -> CensusStats {
        CensusStats {
            size,
            count,
            surplus: self.surplus,
            desired: self.desired,
            coal_desired: self.coal_desired,
            prev_sweep: self.prev_sweep,
            before_sweep: self.before_sweep,
            bfr_surp: self.bfr_surp,
            coal_births: self.coal_births,
            coal_deaths: self.coal_deaths,
            split_births: self.split_births,
            split_deaths: self.split_deaths,
            hint,
        }
    }
}

/// Census event recorded against a size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CensusEvent {
    SplitBirth,
    SplitDeath,
    CoalBirth,
    CoalDeath,
}

/// Read-only census snapshot for one size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CensusStats {
    pub size: usize,
    pub count: usize,
    pub surplus: isize,
    pub desired: isize,
    pub coal_desired: isize,
    pub prev_sweep: isize,
    pub before_sweep: isize,
    pub bfr_surp: isize,
    pub coal_births: isize,
    pub coal_deaths: isize,
    pub split_births: isize,
    pub split_deaths: isize,
    /// Next larger class with a surplus. `None` for dictionary sizes.
    pub hint: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DemandPolicy {
        DemandPolicy {
            weight: 75,
            padding: 1.0,
            threshold_secs: 0.01,
            extrapolate: false,
        }
    }

    fn timing(current: f64, estimate: f64) -> SweepTiming {
        SweepTiming {
            inter_sweep_current: current,
            inter_sweep_estimate: estimate,
            intra_sweep_estimate: 0.5,
        }
    }

    #[test]
    fn first_sample_sets_average() {
        let mut avg = AdaptiveWeightedAverage::new(50);
        avg.sample(10.0);
        assert_eq!(avg.average(), 10.0);
        assert_eq!(avg.sample_count(), 1);
    }

    #[test]
    fn early_samples_are_weighted_by_count() {
        let mut avg = AdaptiveWeightedAverage::new(10);
        avg.sample(10.0);
        // Second sample weight is max(10, 100/2) = 50.
        avg.sample(20.0);
        assert!((avg.average() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn padded_average_is_above_average_for_noisy_input() {
        let mut avg = AdaptivePaddedAverage::new(75, 1.0);
        for v in [10.0, 30.0, 5.0, 40.0] {
            avg.sample(v);
        }
        assert!(avg.deviation() > 0.0);
        assert!(avg.padded_average() > avg.average());
    }

    #[test]
    fn desired_tracks_demand_rate() {
        let p = policy();
        let mut stats = AllocationStats::new(&p);
        stats.prev_sweep = 100;
        // 100 at last sweep, 40 now, no births or deaths: demand 60 over 2s.
        stats.compute_desired(40, &timing(2.0, 2.0), &p);
        assert_eq!(stats.desired, 60);
    }

    #[test]
    fn short_interval_leaves_desired_alone() {
        let p = policy();
        let mut stats = AllocationStats::new(&p);
        stats.prev_sweep = 100;
        stats.desired = 7;
        stats.compute_desired(0, &timing(0.001, 2.0), &p);
        assert_eq!(stats.desired, 7);
    }

    #[test]
    fn extrapolation_adds_sweep_duration() {
        let p = DemandPolicy {
            extrapolate: true,
            ..policy()
        };
        let mut stats = AllocationStats::new(&p);
        stats.prev_sweep = 10;
        stats.compute_desired(0, &timing(1.0, 1.0), &p);
        // Rate 10/s over 1.0 + 0.5 seconds.
        assert_eq!(stats.desired, 15);
    }

    #[test]
    fn births_offset_demand() {
        let p = policy();
        let mut stats = AllocationStats::new(&p);
        stats.prev_sweep = 10;
        stats.record(CensusEvent::SplitBirth, 5);
        stats.record(CensusEvent::CoalDeath, 3);
        // 10 - 8 + 5 - 3 = 4 over 1s.
        stats.compute_desired(8, &timing(1.0, 1.0), &p);
        assert_eq!(stats.desired, 4);
    }

    #[test]
    fn sweep_cycle_sets_surplus_and_clears_tallies() {
        let p = policy();
        let mut stats = AllocationStats::new(&p);
        stats.prev_sweep = 20;
        stats.record(CensusEvent::SplitBirth, 2);
        stats.begin_sweep(12, 1.05, &timing(1.0, 1.0), &p);
        assert_eq!(stats.desired, 10);
        assert_eq!(stats.coal_desired, 10);
        assert_eq!(stats.before_sweep, 12);
        stats.end_sweep(12, 1.10);
        assert_eq!(stats.surplus, 1);
        assert_eq!(stats.prev_sweep, 12);
        assert_eq!(stats.split_births, 0);
    }

    #[test]
    fn coal_over_populated_rules() {
        let p = policy();
        let mut stats = AllocationStats::new(&p);
        stats.coal_desired = -1;
        assert!(stats.coal_over_populated(0));
        stats.coal_desired = 5;
        assert!(!stats.coal_over_populated(5));
        assert!(stats.coal_over_populated(6));
    }
}
