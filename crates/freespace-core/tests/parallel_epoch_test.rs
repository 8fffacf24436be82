//! Collector workers allocating through their own buffers while a mutator
//! allocates directly: nothing handed out in one epoch may overlap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use freespace_core::{FreeListSpace, LockingRegime, ParallelAllocationBuffer, SpaceConfig};

const CAPACITY: usize = 1 << 17;
const WORKERS: usize = 4;
const SMALL_PER_WORKER: usize = 500;
const MUTATOR_BLOCKS: usize = 200;

fn space(locking: LockingRegime) -> FreeListSpace {
    let config = SpaceConfig {
        locking,
        ..SpaceConfig::default()
    };
    FreeListSpace::new(config, CAPACITY).expect("valid config")
}

fn worker(space: &FreeListSpace, seed: usize) -> Vec<(usize, usize)> {
    let mut plab = ParallelAllocationBuffer::new(space);
    let mut got = Vec::with_capacity(SMALL_PER_WORKER * 5 / 4 + 1);
    for i in 0..SMALL_PER_WORKER {
        let addr = plab.alloc(8).expect("space has room");
        got.push((addr, 8));
        if i % 4 == seed % 4 {
            let addr = plab.alloc(24).expect("space has room");
            got.push((addr, 24));
        }
    }
    // Above the index limit: straight from the dictionary.
    let big = plab.alloc(300).expect("space has room");
    got.push((big, 300));
    got
}

fn mutator(space: &FreeListSpace) -> Vec<(usize, usize)> {
    (0..MUTATOR_BLOCKS)
        .map(|_| (space.allocate(40).expect("space has room"), 40))
        .collect()
}

fn run_epoch(space: &FreeListSpace) -> Vec<(usize, usize)> {
    thread::scope(|scope| {
        let workers: Vec<_> = (0..WORKERS)
            .map(|seed| scope.spawn(move || worker(space, seed)))
            .collect();
        let direct = scope.spawn(|| mutator(space));
        let mut all: Vec<(usize, usize)> = workers
            .into_iter()
            .flat_map(|handle| handle.join().expect("worker panicked"))
            .collect();
        all.extend(direct.join().expect("mutator panicked"));
        all
    })
}

fn assert_disjoint(blocks: &[(usize, usize)]) {
    let mut sorted = blocks.to_vec();
    sorted.sort_unstable();
    for pair in sorted.windows(2) {
        let (a, a_size) = pair[0];
        let (b, b_size) = pair[1];
        assert!(a + a_size <= b, "[{a}, +{a_size}) overlaps [{b}, +{b_size})");
    }
    if let Some(&(last, size)) = sorted.last() {
        assert!(last + size <= CAPACITY);
    }
}

fn handed_out(blocks: &[(usize, usize)]) -> usize {
    blocks.iter().map(|&(_, size)| size).sum()
}

#[test]
fn parallel_workers_never_share_a_chunk() {
    let space = space(LockingRegime::Parallel);
    let blocks = run_epoch(&space);
    assert_disjoint(&blocks);
    // Every buffer retired on drop; what they did not use is free again.
    assert_eq!(space.free_words() + handed_out(&blocks), CAPACITY);
    for &(addr, _) in &blocks {
        assert!(!space.is_free_block(addr));
    }
    space.verify();
}

#[test]
fn unlocked_snapshots_stay_in_bounds_during_an_epoch() {
    let space = space(LockingRegime::Parallel);
    let done = AtomicBool::new(false);
    let (blocks, samples) = thread::scope(|scope| {
        let observer = scope.spawn(|| {
            let mut samples = 0usize;
            while !done.load(Ordering::Acquire) || samples == 0 {
                let free = space.free_words();
                assert!(free <= CAPACITY, "free_words {free} exceeds the space");
                assert!(space.used_words() <= CAPACITY);
                assert!(space.max_alloc_in_words() <= CAPACITY);
                let frag = space.fragmentation_metric();
                assert!((0.0..=1.0).contains(&frag), "fragmentation {frag} out of bounds");
                samples += 1;
                thread::yield_now();
            }
            samples
        });
        let blocks = run_epoch(&space);
        done.store(true, Ordering::Release);
        (blocks, observer.join().expect("observer panicked"))
    });
    assert!(samples > 0);
    // Quiescent again: the snapshot is exact.
    assert_eq!(space.free_words() + handed_out(&blocks), CAPACITY);
    assert_disjoint(&blocks);
    space.verify();
}

#[test]
fn huge_worker_requests_fail_without_claiming() {
    let space = space(LockingRegime::Parallel);
    let mut plab = ParallelAllocationBuffer::new(&space);
    assert_eq!(plab.alloc(usize::MAX), None);
    assert_eq!(plab.alloc(CAPACITY + 1), None);
    assert_eq!(plab.total_cached(), 0);
    drop(plab);
    assert_eq!(space.free_words(), CAPACITY);
    space.verify();
}

#[test]
fn serial_regime_hands_out_disjoint_chunks_too() {
    let space = space(LockingRegime::Serial);
    let blocks = run_epoch(&space);
    assert_disjoint(&blocks);
    assert_eq!(space.free_words() + handed_out(&blocks), CAPACITY);
    space.verify();
}

#[test]
fn epoch_consumption_resizes_the_next_claim() {
    let space = space(LockingRegime::Parallel);
    let ctx = space.context();
    assert_eq!(ctx.blocks_to_claim(8), 16);
    let blocks = run_epoch(&space);
    let small = blocks.iter().filter(|&&(_, size)| size == 8).count();
    assert_eq!(small, WORKERS * SMALL_PER_WORKER);

    let snap = ctx.claim_snapshot(8);
    assert_eq!(snap.global_workers, WORKERS);
    assert_eq!(snap.global_blocks, WORKERS * SMALL_PER_WORKER);

    ctx.compute_desired_plab_size();
    // 2000 blocks over 4 workers and 4 refills each.
    assert_eq!(ctx.blocks_to_claim(8), 125);
    assert_eq!(ctx.claim_snapshot(8).global_workers, 0);

    // A second epoch claims in the larger batches and stays disjoint.
    let refills_before = space.metrics().snapshot().plab_refills;
    let more = run_epoch(&space);
    let refills = space.metrics().snapshot().plab_refills - refills_before;
    assert!(refills < (WORKERS * SMALL_PER_WORKER / 16) as u64);
    let mut everything = blocks;
    everything.extend(more);
    assert_disjoint(&everything);
    space.verify();
}

#[test]
fn buffers_retire_unused_chunks_to_the_shared_lists() {
    let space = space(LockingRegime::Parallel);
    {
        let mut plab = ParallelAllocationBuffer::new(&space);
        plab.alloc(12).expect("space has room");
        assert_eq!(plab.cached(12), 15);
    }
    assert_eq!(space.context().lists().count(12), 15);
    assert_eq!(space.metrics().snapshot().plab_retired_chunks, 15);
    assert_eq!(space.free_words(), CAPACITY - 12);
    space.verify();
}
