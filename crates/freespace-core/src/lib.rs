//! # freespace-core
//!
//! A free-list space allocator for a mark-sweep collector with optional
//! compaction. Freed memory is tracked in place: chunk headers overlay the
//! first words of each free run, and chunk addresses are word indices into a
//! fixed arena.
//!
//! Small chunks live in exact-size classes ([`SizeClassFreeLists`]); larger
//! ones in a size-ordered [`Dictionary`]. A [`LinearAllocationBlock`] serves
//! tiny requests by bumping a pointer. Collector workers allocate through
//! [`ParallelAllocationBuffer`]s that claim chunks in batches sized from
//! per-size demand history held by the [`AllocatorContext`]. Per-size census
//! counters steer replenishment and tell a sweeper which sizes are safe to
//! coalesce.
//!
//! Allocation failure is `None`. Heap corruption is fatal.

#![deny(unsafe_code)]

pub mod arena;
pub mod block_index;
pub mod census;
pub mod config;
pub mod context;
pub mod dictionary;
pub mod error;
pub mod free_list;
pub mod lab;
pub mod lifecycle;
pub mod metrics;
pub mod plab;
pub mod size_class;
pub mod space;
pub mod stats;
pub(crate) mod sync;

pub use arena::{ChunkArena, NIL};
pub use block_index::{BlockIndex, BlockStartTable, NoBlockIndex};
pub use census::CensusReport;
pub use config::{DictionaryFit, LockingRegime, SpaceConfig};
pub use context::{AllocatorContext, ClaimSnapshot, PlabTuning};
pub use dictionary::{Dictionary, Dither};
pub use error::{ConfigError, CorruptionError, SpaceError};
pub use free_list::{FreeList, InsertAt};
pub use lab::LinearAllocationBlock;
pub use lifecycle::{LogLevel, SpaceLog, SpaceLogRecord};
pub use metrics::{AllocPath, MetricsSnapshot, SpaceMetrics};
pub use plab::ParallelAllocationBuffer;
pub use size_class::SizeClassFreeLists;
pub use space::FreeListSpace;
pub use stats::{CensusEvent, CensusStats, SweepTiming};
