//! Workload drivers for freespace-core.
//!
//! This crate provides:
//! - Storms: deterministic single-threaded allocate/free churn with a
//!   sweeper that merges freed blocks with free neighbours, checking word
//!   conservation and structural integrity along the way
//! - Epochs: collector workers allocating through per-thread buffers,
//!   checked for disjointness and claim-size adaptation
//! - Reports: JSON and markdown renderings of both

#![forbid(unsafe_code)]

pub mod epoch;
pub mod error;
pub mod report;
pub mod rng;
pub mod storm;

pub use epoch::{EpochConfig, EpochReport, run_epochs};
pub use error::HarnessError;
pub use report::HarnessReport;
pub use rng::XorShift64;
pub use storm::{StormConfig, StormKind, StormReport, run_storm};
