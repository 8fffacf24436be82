//! Error types.
//!
//! Allocation failure is never an error: it is `None`. These types cover
//! caller mistakes (bad config, out-of-range chunks) and heap corruption,
//! which is fatal once detected.

use thiserror::Error;

/// Rejected configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("object alignment {alignment} is not a non-zero power of two")]
    Alignment { alignment: usize },
    #[error("index set size {index_set_size} must exceed the minimum chunk size {min_chunk}")]
    IndexSetSize {
        index_set_size: usize,
        min_chunk: usize,
    },
    #[error("LAB refill of {refill} words cannot serve its size limit (needs {needed})")]
    LabRefill { refill: usize, needed: usize },
    #[error("indexed list replenish factor must be at least 1")]
    Replenish,
    #[error("{name} must be a finite non-negative number, got {value}")]
    Ratio { name: &'static str, value: f64 },
    #[error("{name} must be in 1..=100, got {weight}")]
    Weight { name: &'static str, weight: u32 },
    #[error("PLAB bounds must satisfy 0 < min <= initial <= max (min={min} initial={initial} max={max})")]
    PlabBounds {
        min: usize,
        initial: usize,
        max: usize,
    },
    #[error("PLAB refill count and tolerance factor must be at least 1")]
    PlabFactor,
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A broken free-structure invariant. Seeing one means the heap is corrupt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorruptionError {
    #[error("{structure} list for size {size} records {recorded} chunks but links {linked}")]
    CountMismatch {
        structure: &'static str,
        size: usize,
        recorded: usize,
        linked: usize,
    },
    #[error("chunk {addr} has prev link {found:?}, expected {expected:?}")]
    BrokenLink {
        addr: usize,
        expected: Option<usize>,
        found: Option<usize>,
    },
    #[error("chunk {addr} of size {size} is queued in the size-{class} list")]
    WrongClass {
        addr: usize,
        size: usize,
        class: usize,
    },
    #[error("chunk {addr} is queued but not marked free")]
    NotFree { addr: usize },
    #[error("chunk {addr} is already free")]
    AlreadyFree { addr: usize },
    #[error("chunks [{first}, +{first_size}) and [{second}, +{second_size}) overlap")]
    Overlap {
        first: usize,
        first_size: usize,
        second: usize,
        second_size: usize,
    },
    #[error("chunk [{addr}, +{size}) lies outside the space of {capacity} words")]
    OutsideSpace {
        addr: usize,
        size: usize,
        capacity: usize,
    },
    #[error("LAB [{lab_start}, +{lab_size}) overlaps chunk [{addr}, +{size})")]
    LabOverlap {
        lab_start: usize,
        lab_size: usize,
        addr: usize,
        size: usize,
    },
    #[error("dictionary records {recorded} free words but holds {actual}")]
    DictionaryTotalMismatch { recorded: usize, actual: usize },
    #[error("free chunk [{addr}, +{size}) is not a single block in the block index")]
    UnindexedChunk { addr: usize, size: usize },
}

/// Errors surfaced by space operations.
#[derive(Debug, Error)]
pub enum SpaceError {
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    #[error("range [{start}, +{size}) exceeds space capacity {capacity}")]
    RangeOutOfBounds {
        start: usize,
        size: usize,
        capacity: usize,
    },
    #[error("chunk of {size} words is below the minimum chunk size {min}")]
    ChunkTooSmall { size: usize, min: usize },
    #[error("chunk of {size} words is not a multiple of the {alignment}-word alignment")]
    Misaligned { size: usize, alignment: usize },
    #[error("chunk {addr} is not in a free structure")]
    NotQueued { addr: usize },
    #[error("heap corruption: {0}")]
    Corruption(#[from] CorruptionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_converts_into_space_error() {
        let err: SpaceError = CorruptionError::NotFree { addr: 12 }.into();
        assert!(matches!(err, SpaceError::Corruption(CorruptionError::NotFree { addr: 12 })));
        assert_eq!(err.to_string(), "heap corruption: chunk 12 is queued but not marked free");
    }

    #[test]
    fn config_error_is_transparent() {
        let err: SpaceError = ConfigError::Replenish.into();
        assert_eq!(err.to_string(), "indexed list replenish factor must be at least 1");
    }
}
