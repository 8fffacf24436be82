//! Space configuration.
//!
//! Tuning knobs for the free-list space. Defaults mirror the long-standing
//! collector defaults (257 indexed size classes, a 16K-word linear
//! allocation block serving requests under 16 words, 4-way replenishment).
//!
//! The locking regime and log filter can be overridden from the environment:
//! - `FREESPACE_LOCKING`: `serial` (default) or `parallel`.
//! - `FREESPACE_LOG`: `trace`, `debug`, `info` (default), `warn`, `error`.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::lifecycle::LogLevel;

/// Environment variable selecting the locking regime.
pub const LOCKING_ENV: &str = "FREESPACE_LOCKING";

/// Environment variable selecting the retained log level.
pub const LOG_ENV: &str = "FREESPACE_LOG";

/// Header words a free chunk needs: size/tag, next, prev.
pub const CHUNK_HEADER_WORDS: usize = 3;

/// Which locks guard the shared free structures.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockingRegime {
    /// One lock covers the size-class lists, the LAB and the dictionary.
    /// Sweep-time operations assume exclusive access.
    #[default]
    Serial,
    /// One lock per size class plus a dedicated dictionary lock. Collector
    /// workers never take the space-wide lock.
    Parallel,
}

impl LockingRegime {
    /// Parse from string (case-insensitive). Unknown values select `Serial`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "parallel" | "par" | "fine" | "fine-grained" => Self::Parallel,
            _ => Self::Serial,
        }
    }

    /// Returns true if collector workers must also take the space-wide lock.
    #[must_use]
    pub const fn is_serial(self) -> bool {
        matches!(self, Self::Serial)
    }
}

/// How the dictionary picks a chunk for an at-least request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DictionaryFit {
    /// Smallest chunk that is large enough.
    #[default]
    BestFit,
    /// Always carve from the largest chunk, exhausting huge regions first.
    LargestFirst,
}

/// Complete tuning for one free-list space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    pub locking: LockingRegime,
    pub dictionary_fit: DictionaryFit,
    /// Object alignment in words; must be a power of two.
    pub object_alignment_words: usize,
    /// Sizes below this are held in the indexed size-class lists.
    pub index_set_size: usize,
    /// Words requested when the linear allocation block is refilled.
    /// Zero disables the LAB.
    pub lab_refill_words: usize,
    /// Requests of this many words or more bypass the LAB.
    pub lab_allocation_size_limit: usize,
    /// Pieces carved when an exact class is replenished from a larger one.
    pub indexed_list_replenish: usize,
    /// Try the hint chain before the dictionary.
    pub best_fit_first: bool,
    pub small_coal_surplus_percent: f64,
    pub large_coal_surplus_percent: f64,
    pub small_split_surplus_percent: f64,
    pub large_split_surplus_percent: f64,
    /// Weight (percent) of a new demand-rate sample.
    pub census_weight: u32,
    /// Deviations added on top of the demand-rate average.
    pub census_padding: f64,
    /// Sweep intervals shorter than this do not update demand estimates.
    pub sweep_timer_threshold_secs: f64,
    /// Include the expected sweep duration when projecting demand.
    pub extrapolate_sweep: bool,
    pub plab_initial_blocks: usize,
    pub plab_min_blocks: usize,
    pub plab_max_blocks: usize,
    pub plab_num_refills: usize,
    pub plab_weight: u32,
    pub plab_resize_quicker: bool,
    pub plab_tolerance_factor: usize,
    pub plab_reactivity_factor: usize,
    /// Minimum level retained in the lifecycle log ring.
    pub log_level: LogLevel,
    /// Records kept before the oldest are dropped.
    pub log_capacity: usize,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            locking: LockingRegime::Serial,
            dictionary_fit: DictionaryFit::BestFit,
            object_alignment_words: 1,
            index_set_size: 257,
            lab_refill_words: 16 * 1024,
            lab_allocation_size_limit: 16,
            indexed_list_replenish: 4,
            best_fit_first: true,
            small_coal_surplus_percent: 1.05,
            large_coal_surplus_percent: 0.95,
            small_split_surplus_percent: 1.10,
            large_split_surplus_percent: 1.00,
            census_weight: 75,
            census_padding: 1.0,
            sweep_timer_threshold_secs: 0.01,
            extrapolate_sweep: false,
            plab_initial_blocks: 16,
            plab_min_blocks: 16,
            plab_max_blocks: 1024,
            plab_num_refills: 4,
            plab_weight: 50,
            plab_resize_quicker: false,
            plab_tolerance_factor: 4,
            plab_reactivity_factor: 2,
            log_level: LogLevel::Info,
            log_capacity: 4096,
        }
    }
}

impl SpaceConfig {
    /// Defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults with overrides drawn from `lookup` instead of the process
    /// environment.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup(LOCKING_ENV) {
            config.locking = LockingRegime::from_str_loose(&raw);
        }
        if let Some(raw) = lookup(LOG_ENV) {
            config.log_level = LogLevel::from_str_loose(&raw);
        }
        config
    }

    /// Parse and validate a JSON config. Missing fields take defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Smallest chunk that can carry a free header, in words.
    #[must_use]
    pub fn min_chunk_size(&self) -> usize {
        align_up(CHUNK_HEADER_WORDS, self.object_alignment_words.max(1))
    }

    /// Rounds a request up to the minimum chunk size and the alignment.
    #[must_use]
    pub fn adjust_object_size(&self, size: usize) -> usize {
        align_up(size.max(self.min_chunk_size()), self.object_alignment_words.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let align = self.object_alignment_words;
        if align == 0 || !align.is_power_of_two() {
            return Err(ConfigError::Alignment { alignment: align });
        }
        let min_chunk = self.min_chunk_size();
        if self.index_set_size <= min_chunk {
            return Err(ConfigError::IndexSetSize {
                index_set_size: self.index_set_size,
                min_chunk,
            });
        }
        if self.lab_refill_words != 0 {
            let needed = self.lab_allocation_size_limit + min_chunk;
            if self.lab_refill_words < needed {
                return Err(ConfigError::LabRefill {
                    refill: self.lab_refill_words,
                    needed,
                });
            }
        }
        if self.indexed_list_replenish == 0 {
            return Err(ConfigError::Replenish);
        }
        for (name, value) in [
            ("small_coal_surplus_percent", self.small_coal_surplus_percent),
            ("large_coal_surplus_percent", self.large_coal_surplus_percent),
            ("small_split_surplus_percent", self.small_split_surplus_percent),
            ("large_split_surplus_percent", self.large_split_surplus_percent),
            ("census_padding", self.census_padding),
            ("sweep_timer_threshold_secs", self.sweep_timer_threshold_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Ratio { name, value });
            }
        }
        for (name, weight) in [
            ("census_weight", self.census_weight),
            ("plab_weight", self.plab_weight),
        ] {
            if weight == 0 || weight > 100 {
                return Err(ConfigError::Weight { name, weight });
            }
        }
        if self.plab_min_blocks == 0
            || self.plab_min_blocks > self.plab_max_blocks
            || self.plab_initial_blocks < self.plab_min_blocks
            || self.plab_initial_blocks > self.plab_max_blocks
        {
            return Err(ConfigError::PlabBounds {
                min: self.plab_min_blocks,
                initial: self.plab_initial_blocks,
                max: self.plab_max_blocks,
            });
        }
        if self.plab_num_refills == 0 || self.plab_tolerance_factor == 0 {
            return Err(ConfigError::PlabFactor);
        }
        Ok(())
    }
}

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
