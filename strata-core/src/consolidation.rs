//! Consolidation: moving hot and important records toward slower tiers.
//!
//! A consolidation pass (driven by the coordinator) decays the fast tier,
//! then copies every *candidate* to the network tier and the durable-worthy
//! candidates to the durable tier. Scheduling is external: the caller ticks
//! a [`ConsolidationSchedule`] and the schedule says when a pass is due.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::record::MemoryRecord;

/// Default number of reads that makes a record worth consolidating.
pub const DEFAULT_ACCESS_THRESHOLD: u64 = 3;

/// Whether a fast-tier record should be copied outward during consolidation.
///
/// Important and critical records always qualify; others qualify once
/// they have been read `access_threshold` times.
#[must_use]
pub fn is_candidate(record: &MemoryRecord, access_threshold: u64) -> bool {
    record.importance.is_durable() || record.access_count >= access_threshold
}

/// Outcome of one consolidation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationStats {
    /// Records forgotten from the fast tier by decay.
    pub decayed: usize,
    /// Candidates successfully written to the network tier.
    pub promoted_to_network: usize,
    /// Candidates successfully written to the durable tier.
    pub promoted_to_durable: usize,
}

/// Fixed-interval schedule advanced by an external tick.
#[derive(Debug, Clone)]
pub struct ConsolidationSchedule {
    interval: Duration,
    last_run: DateTime<Utc>,
}

impl ConsolidationSchedule {
    /// Start a schedule whose first pass is due one interval after `start`.
    #[must_use]
    pub fn new(interval: std::time::Duration, start: DateTime<Utc>) -> Self {
        Self {
            interval: Duration::from_std(interval).unwrap_or(Duration::minutes(5)),
            last_run: start,
        }
    }

    /// Whether a pass should run at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now - self.last_run >= self.interval
    }

    /// Hours elapsed since the previous pass (the decay window for the next one).
    #[must_use]
    pub fn hours_since_last(&self, now: DateTime<Utc>) -> f64 {
        let millis = (now - self.last_run).num_milliseconds().max(0);
        millis as f64 / 3_600_000.0
    }

    /// Record that a pass ran at `now`.
    pub fn mark_run(&mut self, now: DateTime<Utc>) {
        self.last_run = now;
    }

    /// When the previous pass ran.
    #[must_use]
    pub fn last_run(&self) -> DateTime<Utc> {
        self.last_run
    }
}
