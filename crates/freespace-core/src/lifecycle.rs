//! Structured lifecycle log.
//!
//! Every boundary-changing decision the space makes is captured as a
//! [`SpaceLogRecord`] in a bounded ring and forwarded to the `log` facade
//! under the `freespace` target. Records below the configured level are
//! dropped before their details are formatted.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// `log` target used for forwarded records.
pub const LOG_TARGET: &str = "freespace";

/// Lifecycle log level.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse from string (case-insensitive). Unknown values select `Info`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }

    fn as_log(self) -> ::log::Level {
        match self {
            Self::Trace => ::log::Level::Trace,
            Self::Debug => ::log::Level::Debug,
            Self::Info => ::log::Level::Info,
            Self::Warn => ::log::Level::Warn,
            Self::Error => ::log::Level::Error,
        }
    }
}

/// One structured lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpaceLogRecord {
    /// Monotonic decision id.
    pub decision_id: u64,
    /// Correlation id, `space::<op>::<hex id>`.
    pub trace_id: String,
    pub level: LogLevel,
    /// Operation that made the decision (`allocate`, `plab_refill`, ...).
    pub op: &'static str,
    /// Event kind within the operation.
    pub event: &'static str,
    /// Chunk address (word index) involved, if any.
    pub addr: Option<usize>,
    /// Size in words involved, if any.
    pub size: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details.
    pub details: String,
}

struct LogRing {
    next_decision_id: u64,
    records: VecDeque<SpaceLogRecord>,
}

/// Bounded ring of lifecycle records.
pub struct SpaceLog {
    level: LogLevel,
    capacity: usize,
    ring: Mutex<LogRing>,
}

impl SpaceLog {
    #[must_use]
    pub fn new(level: LogLevel, capacity: usize) -> Self {
        Self {
            level,
            capacity,
            ring: Mutex::new(LogRing {
                next_decision_id: 1,
                records: VecDeque::with_capacity(capacity.min(1024)),
            }),
        }
    }

    /// Minimum level retained.
    #[must_use]
    pub fn level(&self) -> LogLevel {
        self.level
    }

    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level
    }

    /// Records a decision. The ring lock is a leaf: callers may hold any
    /// space lock while recording.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        level: LogLevel,
        op: &'static str,
        event: &'static str,
        addr: Option<usize>,
        size: Option<usize>,
        outcome: &'static str,
        details: fmt::Arguments<'_>,
    ) {
        if !self.enabled(level) {
            return;
        }
        let details = details.to_string();
        let mut ring = self.ring.lock();
        let decision_id = ring.next_decision_id;
        ring.next_decision_id = ring.next_decision_id.wrapping_add(1);
        let trace_id = format!("space::{}::{:016x}", op, decision_id);
        ::log::log!(
            target: LOG_TARGET,
            level.as_log(),
            "{} {}.{} outcome={} addr={:?} size={:?} {}",
            trace_id,
            op,
            event,
            outcome,
            addr,
            size,
            details
        );
        if self.capacity == 0 {
            return;
        }
        if ring.records.len() == self.capacity {
            ring.records.pop_front();
        }
        ring.records.push_back(SpaceLogRecord {
            decision_id,
            trace_id,
            level,
            op,
            event,
            addr,
            size,
            outcome,
            details,
        });
    }

    /// Copy of the retained records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<SpaceLogRecord> {
        self.ring.lock().records.iter().cloned().collect()
    }

    /// Removes and returns the retained records.
    pub fn drain(&self) -> Vec<SpaceLogRecord> {
        self.ring.lock().records.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the retained records as JSON lines.
    pub fn export_jsonl(&self) -> Result<String, serde_json::Error> {
        let ring = self.ring.lock();
        let mut out = String::new();
        for record in &ring.records {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out)
    }
}
