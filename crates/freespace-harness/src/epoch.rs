//! Parallel collector epochs.
//!
//! Each epoch spawns `workers` threads that allocate through their own
//! [`ParallelAllocationBuffer`] while one mutator thread allocates directly.
//! Everything handed out is checked for overlap, buffers retire on drop, and
//! the context folds the epoch's consumption into the next claim size.

use std::thread;
use std::time::Instant;

use freespace_core::{FreeListSpace, LockingRegime, ParallelAllocationBuffer, SpaceConfig};
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::rng::XorShift64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochConfig {
    pub epochs: usize,
    pub workers: usize,
    pub blocks_per_worker: usize,
    /// Largest worker request; sizes are drawn from `min_chunk..=max_size`.
    pub max_size: usize,
    pub mutator_blocks: usize,
    pub mutator_size: usize,
    pub capacity: usize,
    pub seed: u64,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            workers: 4,
            blocks_per_worker: 500,
            max_size: 32,
            mutator_blocks: 200,
            mutator_size: 40,
            capacity: 1 << 20,
            seed: 0x5EED,
        }
    }
}

/// One size's claim average after an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClaimSample {
    pub size: usize,
    pub blocks_to_claim: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub blocks: usize,
    pub words: usize,
    pub plab_refills: u64,
    pub free_words_after: usize,
    pub claims: Vec<ClaimSample>,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochReport {
    pub locking: LockingRegime,
    pub config: EpochConfig,
    pub epochs: Vec<EpochSummary>,
    pub disjoint: bool,
    pub integrity_check_passed: bool,
}

fn worker_blocks(
    space: &FreeListSpace,
    seed: u64,
    blocks: usize,
    max_size: usize,
) -> Vec<(usize, usize)> {
    let mut rng = XorShift64::new(seed);
    let min = space.min_chunk_size();
    let mut plab = ParallelAllocationBuffer::new(space);
    let mut got = Vec::with_capacity(blocks);
    for _ in 0..blocks {
        let size = space.adjust_object_size(rng.gen_range(min, max_size.max(min)));
        match plab.alloc(size) {
            Some(addr) => got.push((addr, size)),
            None => break,
        }
    }
    got
}

fn mutator_blocks(space: &FreeListSpace, blocks: usize, size: usize) -> Vec<(usize, usize)> {
    let size = space.adjust_object_size(size);
    (0..blocks)
        .map_while(|_| space.allocate(size).map(|addr| (addr, size)))
        .collect()
}

fn check_disjoint(blocks: &mut [(usize, usize)]) -> Result<(), HarnessError> {
    blocks.sort_unstable();
    for pair in blocks.windows(2) {
        let (first, first_size) = pair[0];
        let (second, second_size) = pair[1];
        if first + first_size > second {
            return Err(HarnessError::Overlap {
                first,
                first_size,
                second,
                second_size,
            });
        }
    }
    Ok(())
}

fn run_one_epoch(
    space: &FreeListSpace,
    config: &EpochConfig,
    epoch: usize,
) -> Result<Vec<(usize, usize)>, HarnessError> {
    thread::scope(|scope| {
        let workers: Vec<_> = (0..config.workers)
            .map(|w| {
                let seed = config.seed ^ ((epoch as u64) << 32) ^ (w as u64 + 1);
                scope.spawn(move || worker_blocks(space, seed, config.blocks_per_worker, config.max_size))
            })
            .collect();
        let mutator = scope.spawn(|| mutator_blocks(space, config.mutator_blocks, config.mutator_size));

        let mut all = Vec::new();
        for (worker, handle) in workers.into_iter().enumerate() {
            all.extend(handle.join().map_err(|_| HarnessError::WorkerPanicked { worker })?);
        }
        all.extend(
            mutator
                .join()
                .map_err(|_| HarnessError::WorkerPanicked { worker: config.workers })?,
        );
        Ok(all)
    })
}

/// Runs `config.epochs` epochs on one space. Blocks handed out in earlier
/// epochs stay live, so the disjointness check spans the whole run.
pub fn run_epochs(
    space_config: &SpaceConfig,
    config: &EpochConfig,
) -> Result<EpochReport, HarnessError> {
    let space = FreeListSpace::new(space_config.clone(), config.capacity)?;
    let ctx = space.context();
    let tracked: Vec<usize> = (space.min_chunk_size()..=config.max_size.max(space.min_chunk_size()))
        .map(|size| space.adjust_object_size(size))
        .filter(|&size| ctx.lists().is_indexed(size))
        .collect();

    let mut everything = Vec::new();
    let mut epochs = Vec::with_capacity(config.epochs);
    for epoch in 0..config.epochs {
        let started = Instant::now();
        let refills_before = space.metrics().snapshot().plab_refills;
        let blocks = run_one_epoch(&space, config, epoch)?;
        ctx.compute_desired_plab_size();

        let words = blocks.iter().map(|&(_, size)| size).sum();
        let mut claims: Vec<ClaimSample> = tracked
            .iter()
            .map(|&size| ClaimSample {
                size,
                blocks_to_claim: ctx.blocks_to_claim(size),
            })
            .collect();
        claims.dedup_by_key(|c| c.size);
        epochs.push(EpochSummary {
            epoch,
            blocks: blocks.len(),
            words,
            plab_refills: space.metrics().snapshot().plab_refills - refills_before,
            free_words_after: space.free_words(),
            claims,
            elapsed_ms: started.elapsed().as_millis(),
        });
        everything.extend(blocks);
    }

    check_disjoint(&mut everything)?;
    let handed_out: usize = everything.iter().map(|&(_, size)| size).sum();
    let free = space.free_words();
    if free + handed_out != config.capacity {
        return Err(HarnessError::Conservation {
            free,
            live: handed_out,
            capacity: config.capacity,
            ops: everything.len(),
        });
    }
    space.check_integrity()?;

    Ok(EpochReport {
        locking: space_config.locking,
        config: *config,
        epochs,
        disjoint: true,
        integrity_check_passed: true,
    })
}
