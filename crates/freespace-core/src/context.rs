//! Shared allocator context.
//!
//! Owns everything collector workers share: the per-class locked lists, the
//! locked dictionary, and the per-size demand tables that size worker batch
//! claims. One context is built with its space and lives exactly as long.

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::SpaceConfig;
use crate::dictionary::Dictionary;
use crate::size_class::SizeClassFreeLists;
use crate::stats::{AdaptiveWeightedAverage, DemandPolicy};
use crate::sync::{DICTIONARY_RANK, RankedGuard, RankedMutex};

/// Worker batch sizing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlabTuning {
    pub initial_blocks: usize,
    pub min_blocks: usize,
    pub max_blocks: usize,
    pub num_refills: usize,
    pub weight: u32,
    pub resize_quicker: bool,
    pub tolerance_factor: usize,
    pub reactivity_factor: usize,
}

impl PlabTuning {
    fn from_config(config: &SpaceConfig) -> Self {
        Self {
            initial_blocks: config.plab_initial_blocks,
            min_blocks: config.plab_min_blocks,
            max_blocks: config.plab_max_blocks,
            num_refills: config.plab_num_refills,
            weight: config.plab_weight,
            resize_quicker: config.plab_resize_quicker,
            tolerance_factor: config.plab_tolerance_factor,
            reactivity_factor: config.plab_reactivity_factor,
        }
    }
}

/// Demand for one size, accumulated across workers within an epoch.
#[derive(Debug, Clone, Copy)]
struct ClaimDemand {
    blocks_to_claim: AdaptiveWeightedAverage,
    global_blocks: usize,
    global_workers: usize,
}

/// Read-only view of one size's claim demand.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClaimSnapshot {
    pub size: usize,
    pub blocks_to_claim: f64,
    pub global_blocks: usize,
    pub global_workers: usize,
}

pub struct AllocatorContext {
    lists: SizeClassFreeLists,
    dictionary: RankedMutex<Dictionary>,
    /// Leaf locks: never held while acquiring another lock.
    claims: Box<[Mutex<ClaimDemand>]>,
    plab: PlabTuning,
}

impl AllocatorContext {
    pub(crate) fn new(config: &SpaceConfig) -> Self {
        let policy = DemandPolicy {
            weight: config.census_weight,
            padding: config.census_padding,
            threshold_secs: config.sweep_timer_threshold_secs,
            extrapolate: config.extrapolate_sweep,
        };
        let plab = PlabTuning::from_config(config);
        let claims = (0..config.index_set_size)
            .map(|_| {
                Mutex::new(ClaimDemand {
                    blocks_to_claim: AdaptiveWeightedAverage::with_average(
                        plab.weight,
                        plab.initial_blocks as f64,
                    ),
                    global_blocks: 0,
                    global_workers: 0,
                })
            })
            .collect();
        Self {
            lists: SizeClassFreeLists::new(
                config.index_set_size,
                config.min_chunk_size(),
                config.object_alignment_words,
                policy,
            ),
            dictionary: RankedMutex::new(DICTIONARY_RANK, Dictionary::new(config.dictionary_fit, policy)),
            claims,
            plab,
        }
    }

    #[must_use]
    pub fn lists(&self) -> &SizeClassFreeLists {
        &self.lists
    }

    /// Takes the dictionary lock. The guard is the token for every
    /// dictionary mutation.
    pub(crate) fn dictionary(&self) -> RankedGuard<'_, Dictionary> {
        self.dictionary.lock()
    }

    #[must_use]
    pub fn plab_tuning(&self) -> &PlabTuning {
        &self.plab
    }

    /// Smoothed number of `size`-word chunks a worker claims per refill.
    #[must_use]
    pub fn blocks_to_claim(&self, size: usize) -> usize {
        let average = self.claims[size].lock().blocks_to_claim.average();
        (average as usize).max(1)
    }

    /// Folds one retiring worker's consumption into the epoch totals.
    pub(crate) fn record_retire(&self, size: usize, used_blocks: usize) {
        let mut claim = self.claims[size].lock();
        claim.global_blocks += used_blocks;
        claim.global_workers += 1;
    }

    /// Epoch end: samples each size's per-worker, per-refill consumption into
    /// its claim average and clears the epoch totals.
    pub fn compute_desired_plab_size(&self) {
        let tuning = self.plab;
        for slot in self.claims.iter() {
            let mut claim = slot.lock();
            debug_assert!(
                claim.global_workers > 0 || claim.global_blocks == 0,
                "blocks recorded without a retiring worker"
            );
            if claim.global_workers == 0 {
                continue;
            }
            let per_refill = claim.global_blocks / (claim.global_workers * tuning.num_refills);
            let sample = per_refill.clamp(tuning.min_blocks, tuning.max_blocks);
            claim.blocks_to_claim.sample(sample as f64);
            claim.global_blocks = 0;
            claim.global_workers = 0;
        }
    }

    #[must_use]
    pub fn claim_snapshot(&self, size: usize) -> ClaimSnapshot {
        let claim = self.claims[size].lock();
        ClaimSnapshot {
            size,
            blocks_to_claim: claim.blocks_to_claim.average(),
            global_blocks: claim.global_blocks,
            global_workers: claim.global_workers,
        }
    }
}
