//! Harness failures.

use freespace_core::SpaceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Space(#[from] SpaceError),
    #[error("free {free} + live {live} words != capacity {capacity} after {ops} ops")]
    Conservation {
        free: usize,
        live: usize,
        capacity: usize,
        ops: usize,
    },
    #[error("handed-out blocks [{first}, +{first_size}) and [{second}, +{second_size}) overlap")]
    Overlap {
        first: usize,
        first_size: usize,
        second: usize,
        second_size: usize,
    },
    #[error("fragmentation metric {value} outside [0, 1]")]
    FragmentationBounds { value: f64 },
    #[error("worker {worker} panicked")]
    WorkerPanicked { worker: usize },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
