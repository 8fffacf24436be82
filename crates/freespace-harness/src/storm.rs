//! Single-threaded allocation storms.
//!
//! A storm drives one space through a fixed number of allocate/free steps
//! chosen by a seeded generator. Frees behave like a sweeper: a freed block
//! swallows a free neighbour that starts right behind it. Every
//! `check_every` steps the runner checks word conservation and the
//! fragmentation bound; integrity is checked at the end.

use std::time::Instant;

use clap::ValueEnum;
use freespace_core::{FreeListSpace, MetricsSnapshot, SpaceConfig};
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::rng::XorShift64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StormKind {
    /// Fill slots in order, then free every other one.
    Sawtooth,
    /// Uniform coin-flip allocate/free over a wide size range.
    RandomChurn,
    /// Indexed size classes only.
    SizeClassThrash,
    /// Dictionary sizes only.
    LargeBlocks,
    /// Tiny requests served by a periodically refilled LAB.
    LabBursts,
}

impl StormKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sawtooth => "sawtooth",
            Self::RandomChurn => "random_churn",
            Self::SizeClassThrash => "size_class_thrash",
            Self::LargeBlocks => "large_blocks",
            Self::LabBursts => "lab_bursts",
        }
    }

    #[must_use]
    pub fn all() -> [Self; 5] {
        [
            Self::Sawtooth,
            Self::RandomChurn,
            Self::SizeClassThrash,
            Self::LargeBlocks,
            Self::LabBursts,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StormConfig {
    pub kind: StormKind,
    pub seed: u64,
    pub ops: usize,
    pub capacity: usize,
    pub slots: usize,
    pub check_every: usize,
    /// Steps between census passes; 0 disables them.
    pub census_every: usize,
}

impl Default for StormConfig {
    fn default() -> Self {
        Self {
            kind: StormKind::RandomChurn,
            seed: 0xDEAD_BEEF,
            ops: 20_000,
            capacity: 1 << 16,
            slots: 512,
            check_every: 64,
            census_every: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StormReport {
    pub kind: StormKind,
    pub seed: u64,
    pub ops: usize,
    pub capacity: usize,
    pub peak_live_words: usize,
    pub allocation_failures: usize,
    pub sweeper_merges: usize,
    pub census_epochs: u64,
    pub max_fragmentation: f64,
    pub final_fragmentation: f64,
    pub elapsed_ms: u128,
    pub metrics: MetricsSnapshot,
    pub integrity_check_passed: bool,
}

#[derive(Debug, Clone, Copy)]
struct Live {
    addr: usize,
    size: usize,
}

struct Runner<'a> {
    space: FreeListSpace,
    config: &'a StormConfig,
    slots: Vec<Option<Live>>,
    rng: XorShift64,
    ops: usize,
    live_words: usize,
    peak_live_words: usize,
    failures: usize,
    merges: usize,
    max_fragmentation: f64,
    epochs: u64,
}

impl<'a> Runner<'a> {
    fn new(space_config: SpaceConfig, config: &'a StormConfig) -> Result<Self, HarnessError> {
        Ok(Self {
            space: FreeListSpace::new(space_config, config.capacity)?,
            config,
            slots: vec![None; config.slots.max(1)],
            rng: XorShift64::new(config.seed),
            ops: 0,
            live_words: 0,
            peak_live_words: 0,
            failures: 0,
            merges: 0,
            max_fragmentation: 0.0,
            epochs: 0,
        })
    }

    fn tick(&mut self) -> Result<(), HarnessError> {
        self.ops += 1;
        let every = self.config.check_every.max(1);
        if self.ops % every == 0 {
            self.check_conservation()?;
            let value = self.space.fragmentation_metric();
            if !(0.0..=1.0).contains(&value) {
                return Err(HarnessError::FragmentationBounds { value });
            }
            self.max_fragmentation = self.max_fragmentation.max(value);
        }
        if self.config.census_every > 0 && self.ops % self.config.census_every == 0 {
            self.space.begin_census();
            self.space.end_census();
            self.epochs += 1;
        }
        Ok(())
    }

    fn check_conservation(&self) -> Result<(), HarnessError> {
        let free = self.space.free_words();
        if free + self.live_words != self.config.capacity {
            return Err(HarnessError::Conservation {
                free,
                live: self.live_words,
                capacity: self.config.capacity,
                ops: self.ops,
            });
        }
        Ok(())
    }

    fn allocate_at(&mut self, idx: usize, requested: usize) -> Result<bool, HarnessError> {
        if self.slots[idx].is_some() {
            self.tick()?;
            return Ok(false);
        }
        let size = self.space.adjust_object_size(requested);
        let Some(addr) = self.space.allocate(requested) else {
            self.failures += 1;
            self.tick()?;
            return Ok(false);
        };
        self.slots[idx] = Some(Live { addr, size });
        self.live_words += size;
        self.peak_live_words = self.peak_live_words.max(self.live_words);
        self.tick()?;
        Ok(true)
    }

    fn free_at(&mut self, idx: usize) -> Result<bool, HarnessError> {
        let Some(live) = self.slots[idx].take() else {
            self.tick()?;
            return Ok(false);
        };
        let next = live.addr + live.size;
        let follower = if next < self.config.capacity && self.space.is_free_block(next) {
            // LAB and scratch chunks refuse; that is not a failure.
            self.space.remove_free_chunk(next).ok()
        } else {
            None
        };
        match follower {
            Some(extra) => {
                self.space.add_chunk_to_free_lists(live.addr, live.size + extra)?;
                self.space.coal_birth(live.size + extra);
                self.merges += 1;
            }
            None => self.space.return_chunk(live.addr, live.size)?,
        }
        self.live_words -= live.size;
        self.tick()?;
        Ok(true)
    }

    fn random_index(&mut self, live: bool) -> Option<usize> {
        let len = self.slots.len();
        for _ in 0..len {
            let idx = self.rng.gen_range(0, len - 1);
            if self.slots[idx].is_some() == live {
                return Some(idx);
            }
        }
        self.slots.iter().position(|slot| slot.is_some() == live)
    }

    fn step(&mut self) -> Result<(), HarnessError> {
        let len = self.slots.len();
        match self.config.kind {
            StormKind::Sawtooth => {
                let phase = self.ops % (len * 2);
                if phase < len {
                    if !self.allocate_at(phase, 3 + (phase * 37) % 300)? {
                        self.free_at(phase)?;
                    }
                } else {
                    let idx = phase - len;
                    if idx % 2 == 0 {
                        if !self.free_at(idx)? {
                            self.allocate_at(idx, 3 + (idx * 19) % 200)?;
                        }
                    } else if !self.allocate_at(idx, 8 + (idx * 23) % 120)? {
                        self.free_at(idx)?;
                    }
                }
            }
            StormKind::RandomChurn => {
                if self.rng.gen_bool() {
                    if let Some(idx) = self.random_index(false) {
                        let size = self.rng.gen_range(3, 600);
                        self.allocate_at(idx, size)?;
                        return Ok(());
                    }
                }
                match self.random_index(true) {
                    Some(idx) => {
                        self.free_at(idx)?;
                    }
                    None => self.tick()?,
                }
            }
            StormKind::SizeClassThrash => {
                const CLASSES: [usize; 14] = [3, 4, 6, 8, 12, 16, 24, 32, 48, 64, 96, 128, 192, 256];
                let idx = self.rng.gen_range(0, len - 1);
                let size = CLASSES[self.rng.gen_range(0, CLASSES.len() - 1)];
                if self.ops % 3 == 0 {
                    if !self.free_at(idx)? {
                        self.allocate_at(idx, size)?;
                    }
                } else if !self.allocate_at(idx, size)? {
                    self.free_at(idx)?;
                }
            }
            StormKind::LargeBlocks => {
                let idx = self.rng.gen_range(0, len - 1);
                if self.slots[idx].is_some() {
                    self.free_at(idx)?;
                } else {
                    let size = self.rng.gen_range(257, 4_096);
                    self.allocate_at(idx, size)?;
                }
            }
            StormKind::LabBursts => {
                if self.ops % 256 == 0 {
                    self.space.refill_lab_if_needed();
                }
                let idx = self.rng.gen_range(0, len - 1);
                if self.slots[idx].is_some() {
                    if self.rng.gen_range(0, 3) == 0 {
                        self.free_at(idx)?;
                    } else {
                        self.tick()?;
                    }
                } else {
                    let size = self.rng.gen_range(3, 15);
                    self.allocate_at(idx, size)?;
                }
            }
        }
        Ok(())
    }

    fn release_all(&mut self) -> Result<(), HarnessError> {
        for idx in 0..self.slots.len() {
            if self.slots[idx].is_some() {
                self.free_at(idx)?;
            }
        }
        Ok(())
    }
}

/// Runs one storm on a fresh space built from `space_config`.
pub fn run_storm(space_config: &SpaceConfig, config: &StormConfig) -> Result<StormReport, HarnessError> {
    let started = Instant::now();
    let mut runner = Runner::new(space_config.clone(), config)?;
    while runner.ops < config.ops {
        runner.step()?;
    }
    runner.check_conservation()?;
    runner.space.check_integrity()?;
    let final_fragmentation = runner.space.fragmentation_metric();
    let metrics = runner.space.metrics().snapshot();

    runner.release_all()?;
    runner.check_conservation()?;
    runner.space.check_integrity()?;

    Ok(StormReport {
        kind: config.kind,
        seed: config.seed,
        ops: runner.ops,
        capacity: config.capacity,
        peak_live_words: runner.peak_live_words,
        allocation_failures: runner.failures,
        sweeper_merges: runner.merges,
        census_epochs: runner.epochs,
        max_fragmentation: runner.max_fragmentation,
        final_fragmentation,
        elapsed_ms: started.elapsed().as_millis(),
        metrics,
        integrity_check_passed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(kind: StormKind) -> StormConfig {
        StormConfig {
            kind,
            ops: 3_000,
            ..StormConfig::default()
        }
    }

    #[test]
    fn every_storm_completes_cleanly() {
        for kind in StormKind::all() {
            let report = run_storm(&SpaceConfig::default(), &quick(kind)).unwrap();
            assert_eq!(report.kind, kind);
            assert!(report.ops >= 3_000);
            assert!(report.integrity_check_passed);
            assert!(report.metrics.allocations() > 0, "{}", kind.as_str());
            assert!((0.0..=1.0).contains(&report.max_fragmentation));
        }
    }

    #[test]
    fn same_seed_same_report() {
        let config = quick(StormKind::RandomChurn);
        let a = run_storm(&SpaceConfig::default(), &config).unwrap();
        let b = run_storm(&SpaceConfig::default(), &config).unwrap();
        assert_eq!(a.peak_live_words, b.peak_live_words);
        assert_eq!(a.allocation_failures, b.allocation_failures);
        assert_eq!(a.sweeper_merges, b.sweeper_merges);
        assert_eq!(a.metrics, b.metrics);
    }

    #[test]
    fn lab_storm_uses_the_lab() {
        let report = run_storm(&SpaceConfig::default(), &quick(StormKind::LabBursts)).unwrap();
        assert!(report.metrics.lab_hits > 0);
        assert!(report.metrics.lab_refills >= 1);
    }

    #[test]
    fn invalid_space_config_is_reported() {
        let bad = SpaceConfig {
            object_alignment_words: 3,
            ..SpaceConfig::default()
        };
        let err = run_storm(&bad, &quick(StormKind::Sawtooth)).unwrap_err();
        assert!(matches!(err, HarnessError::Space(_)));
    }

    #[test]
    fn report_serializes_kind_in_snake_case() {
        let report = run_storm(&SpaceConfig::default(), &quick(StormKind::SizeClassThrash)).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "size_class_thrash");
        assert_eq!(json["integrity_check_passed"], true);
    }
}
