//! Runtime counters and latency tracking.
//!
//! Counters are lock-free `AtomicU64`s bumped on the hot path and read on
//! export. Latency history uses a `parking_lot::Mutex` ring buffer that is
//! only contended when someone asks for percentiles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::types::Tier;

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Atomic counters for coordinator events.
#[derive(Debug)]
pub struct StrataCounters {
    /// Records accepted by `store`.
    pub stores: AtomicU64,
    /// Retrievals answered by the fast tier.
    pub fast_hits: AtomicU64,
    /// Retrievals answered by the network tier.
    pub network_hits: AtomicU64,
    /// Retrievals answered by the durable tier.
    pub durable_hits: AtomicU64,
    /// Retrievals no tier could answer.
    pub misses: AtomicU64,
    /// Records copied into a faster tier after a hit further down.
    pub promotions: AtomicU64,
    /// Records removed because their strength fell below the threshold.
    pub forgotten: AtomicU64,
    /// Consolidation passes completed.
    pub consolidation_passes: AtomicU64,
    /// Network-tier operations that failed or timed out.
    pub network_failures: AtomicU64,
    /// Durable-tier operations that failed or timed out.
    pub durable_failures: AtomicU64,
}

impl StrataCounters {
    /// Zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stores: AtomicU64::new(0),
            fast_hits: AtomicU64::new(0),
            network_hits: AtomicU64::new(0),
            durable_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            forgotten: AtomicU64::new(0),
            consolidation_passes: AtomicU64::new(0),
            network_failures: AtomicU64::new(0),
            durable_failures: AtomicU64::new(0),
        }
    }

    /// Count a retrieval hit in `tier`.
    pub fn record_hit(&self, tier: Tier) {
        let counter = match tier {
            Tier::Fast => &self.fast_hits,
            Tier::Network => &self.network_hits,
            Tier::Durable => &self.durable_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed operation against `tier`. Fast-tier calls cannot fail.
    pub fn record_failure(&self, tier: Tier) {
        match tier {
            Tier::Fast => {}
            Tier::Network => {
                self.network_failures.fetch_add(1, Ordering::Relaxed);
            }
            Tier::Durable => {
                self.durable_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Bump a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot every counter. `evictions` comes from the fast store,
    /// which owns that count.
    #[must_use]
    pub fn snapshot(&self, evictions: u64) -> CounterSnapshot {
        CounterSnapshot {
            stores: self.stores.load(Ordering::Relaxed),
            hits: [
                self.fast_hits.load(Ordering::Relaxed),
                self.network_hits.load(Ordering::Relaxed),
                self.durable_hits.load(Ordering::Relaxed),
            ],
            misses: self.misses.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            evictions,
            forgotten: self.forgotten.load(Ordering::Relaxed),
            consolidation_passes: self.consolidation_passes.load(Ordering::Relaxed),
            network_failures: self.network_failures.load(Ordering::Relaxed),
            durable_failures: self.durable_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for StrataCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter values at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Records stored.
    pub stores: u64,
    /// Hits by tier: `[fast, network, durable]`.
    pub hits: [u64; 3],
    /// Retrievals found nowhere.
    pub misses: u64,
    /// Promotions into faster tiers.
    pub promotions: u64,
    /// Fast-tier capacity evictions.
    pub evictions: u64,
    /// Records dropped after decaying below the threshold.
    pub forgotten: u64,
    /// Consolidation passes.
    pub consolidation_passes: u64,
    /// Network failures.
    pub network_failures: u64,
    /// Durable failures.
    pub durable_failures: u64,
}

impl CounterSnapshot {
    /// Fraction of retrievals that found something, 0.0 when none ran.
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let hits: u64 = self.hits.iter().sum();
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Format as Prometheus text exposition.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP strata_stores_total Records stored\n\
             # TYPE strata_stores_total counter\n\
             strata_stores_total {}\n\
             # HELP strata_hits_total Retrieval hits by tier\n\
             # TYPE strata_hits_total counter\n\
             strata_hits_total{{tier=\"fast\"}} {}\n\
             strata_hits_total{{tier=\"network\"}} {}\n\
             strata_hits_total{{tier=\"durable\"}} {}\n\
             # HELP strata_misses_total Retrievals found in no tier\n\
             # TYPE strata_misses_total counter\n\
             strata_misses_total {}\n\
             # HELP strata_promotions_total Records promoted into faster tiers\n\
             # TYPE strata_promotions_total counter\n\
             strata_promotions_total {}\n\
             # HELP strata_evictions_total Fast-tier capacity evictions\n\
             # TYPE strata_evictions_total counter\n\
             strata_evictions_total {}\n\
             # HELP strata_forgotten_total Records dropped after decay\n\
             # TYPE strata_forgotten_total counter\n\
             strata_forgotten_total {}\n\
             # HELP strata_consolidation_passes_total Consolidation passes completed\n\
             # TYPE strata_consolidation_passes_total counter\n\
             strata_consolidation_passes_total {}\n\
             # HELP strata_tier_failures_total Failed tier operations\n\
             # TYPE strata_tier_failures_total counter\n\
             strata_tier_failures_total{{tier=\"network\"}} {}\n\
             strata_tier_failures_total{{tier=\"durable\"}} {}\n",
            self.stores,
            self.hits[0],
            self.hits[1],
            self.hits[2],
            self.misses,
            self.promotions,
            self.evictions,
            self.forgotten,
            self.consolidation_passes,
            self.network_failures,
            self.durable_failures,
        )
    }
}

// ---------------------------------------------------------------------------
// Latency tracking
// ---------------------------------------------------------------------------

const LATENCY_WINDOW: usize = 256;

/// Ring buffer of recent operation latencies.
///
/// ```rust
/// # use strata_core::metrics::LatencyTracker;
/// let tracker = LatencyTracker::new();
/// {
///     let _guard = tracker.start();
///     // ... timed work ...
/// }
/// assert_eq!(tracker.count(), 1);
/// ```
#[derive(Debug)]
pub struct LatencyTracker {
    history: Mutex<LatencyHistory>,
}

#[derive(Debug)]
struct LatencyHistory {
    samples_us: Vec<u64>,
    write_idx: usize,
    count: u64,
}

impl LatencyTracker {
    /// An empty tracker keeping the last 256 samples.
    #[must_use]
    pub fn new() -> Self {
        Self {
            history: Mutex::new(LatencyHistory {
                samples_us: vec![0; LATENCY_WINDOW],
                write_idx: 0,
                count: 0,
            }),
        }
    }

    /// Start timing; the sample is recorded when the guard drops.
    pub fn start(&self) -> LatencyGuard<'_> {
        LatencyGuard {
            tracker: self,
            start: Instant::now(),
        }
    }

    /// Record one sample.
    pub fn record(&self, elapsed: Duration) {
        let mut h = self.history.lock();
        let idx = h.write_idx;
        h.samples_us[idx] = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        h.write_idx = (idx + 1) % LATENCY_WINDOW;
        h.count += 1;
    }

    /// Total samples recorded since creation.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.history.lock().count
    }

    /// Percentiles over the retained window, in microseconds.
    #[must_use]
    pub fn percentiles(&self) -> LatencyPercentiles {
        let h = self.history.lock();
        let n = usize::try_from(h.count).unwrap_or(usize::MAX).min(LATENCY_WINDOW);
        if n == 0 {
            return LatencyPercentiles::default();
        }
        let mut sorted = h.samples_us[..n].to_vec();
        drop(h);
        sorted.sort_unstable();

        let at = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
        LatencyPercentiles {
            p50_us: at(0.5),
            p95_us: at(0.95),
            p99_us: at(0.99),
            max_us: sorted[n - 1],
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Records elapsed time into its tracker on drop.
pub struct LatencyGuard<'a> {
    tracker: &'a LatencyTracker,
    start: Instant,
}

impl Drop for LatencyGuard<'_> {
    fn drop(&mut self) {
        self.tracker.record(self.start.elapsed());
    }
}

/// Latency percentiles in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencyPercentiles {
    /// Median.
    pub p50_us: u64,
    /// 95th percentile.
    pub p95_us: u64,
    /// 99th percentile.
    pub p99_us: u64,
    /// Slowest retained sample.
    pub max_us: u64,
}

impl LatencyPercentiles {
    /// One-line human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "P50={}us  P95={}us  P99={}us  Max={}us",
            self.p50_us, self.p95_us, self.p99_us, self.max_us
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let snap = StrataCounters::new().snapshot(0);
        assert_eq!(snap, CounterSnapshot::default());
        assert!(snap.hit_ratio().abs() < f64::EPSILON);
    }

    #[test]
    fn hits_land_in_their_tier() {
        let c = StrataCounters::new();
        c.record_hit(Tier::Fast);
        c.record_hit(Tier::Fast);
        c.record_hit(Tier::Durable);
        StrataCounters::incr(&c.misses);
        c.record_failure(Tier::Network);
        c.record_failure(Tier::Fast);

        let snap = c.snapshot(4);
        assert_eq!(snap.hits, [2, 0, 1]);
        assert_eq!(snap.evictions, 4);
        assert_eq!(snap.network_failures, 1);
        assert_eq!(snap.durable_failures, 0);
        assert!((snap.hit_ratio() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn prometheus_format() {
        let c = StrataCounters::new();
        c.record_hit(Tier::Network);
        c.record_failure(Tier::Durable);
        let text = c.snapshot(0).to_prometheus();
        assert!(text.contains("strata_hits_total{tier=\"network\"} 1"));
        assert!(text.contains("strata_tier_failures_total{tier=\"durable\"} 1"));
        assert!(text.contains("# TYPE strata_evictions_total counter"));
    }

    #[test]
    fn latency_percentiles() {
        let t = LatencyTracker::new();
        assert_eq!(t.percentiles(), LatencyPercentiles::default());
        for us in 1..=100 {
            t.record(Duration::from_micros(us));
        }
        let p = t.percentiles();
        assert_eq!(t.count(), 100);
        assert_eq!(p.max_us, 100);
        assert!(p.p50_us >= 50 && p.p50_us <= 51);
        assert!(p.p99_us >= 99);
    }

    #[test]
    fn latency_window_wraps() {
        let t = LatencyTracker::new();
        for _ in 0..LATENCY_WINDOW {
            t.record(Duration::from_micros(1000));
        }
        for _ in 0..LATENCY_WINDOW {
            t.record(Duration::from_micros(5));
        }
        assert_eq!(t.percentiles().max_us, 5);
        assert_eq!(t.count(), 2 * LATENCY_WINDOW as u64);
    }

    #[test]
    fn guard_records_on_drop() {
        let t = LatencyTracker::new();
        drop(t.start());
        assert_eq!(t.count(), 1);
    }
}
