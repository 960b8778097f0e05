//! Coordinator: routes writes, promotes reads, merges queries and runs
//! consolidation across the three tiers.
//!
//! | Operation     | Fast           | Network              | Durable                      |
//! |---------------|----------------|----------------------|------------------------------|
//! | `store`       | always, first  | never (consolidation)| critical or forced, awaited  |
//! | `retrieve`    | first          | second, promoted     | third, promoted              |
//! | `query`       | first          | per kind, if short   | pushdown, if still short     |
//! | `consolidate` | decay + sweep  | every candidate      | important/critical candidates|
//!
//! The fast tier is populated synchronously before any I/O, so a `store`
//! followed by a `retrieve` on the same coordinator always sees the write.
//! The network tier is optional and never produces a hard error; the
//! durable tier does only for records whose durability was requested.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::StrataConfig;
use crate::consolidation::{ConsolidationSchedule, ConsolidationStats};
use crate::error::{Result, StrataError};
use crate::fast::FastStore;
use crate::metrics::{CounterSnapshot, LatencyPercentiles, LatencyTracker, StrataCounters};
use crate::network::{KvNetworkStore, NetworkStore, NullNetworkStore};
use crate::persistence::DurableStore;
use crate::query::MemoryQuery;
use crate::record::MemoryRecord;
use crate::types::{Context, DecisionRecord, Importance, MemoryId, MemoryKind, Payload, Tier};

/// Which tiers came up during [`Coordinator::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierStatus {
    /// Always available.
    pub fast: bool,
    /// Network tier connected.
    pub network: bool,
    /// Durable tier opened.
    pub durable: bool,
}

impl TierStatus {
    /// True when only the fast tier is running.
    #[must_use]
    pub fn fast_only(&self) -> bool {
        !self.network && !self.durable
    }
}

/// Orchestrates the fast, network and durable tiers.
pub struct Coordinator {
    config: StrataConfig,
    fast: FastStore,
    network: Box<dyn NetworkStore>,
    durable: DurableStore,
    counters: StrataCounters,
    retrieve_latency: LatencyTracker,
    schedule: Mutex<ConsolidationSchedule>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("fast", &self.fast)
            .field("network_connected", &self.network.is_connected())
            .field("durable", &self.durable)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Build from explicit tiers. Nothing connects until [`Self::initialize`].
    #[must_use]
    pub fn new(config: StrataConfig, network: Box<dyn NetworkStore>, durable: DurableStore) -> Self {
        let fast = FastStore::with_access_threshold(
            config.fast.max_records,
            config.fast.consolidation_access_threshold,
        );
        let schedule = ConsolidationSchedule::new(config.coordinator.consolidation_interval(), Utc::now());
        Self {
            config,
            fast,
            network,
            durable,
            counters: StrataCounters::new(),
            retrieve_latency: LatencyTracker::new(),
            schedule: Mutex::new(schedule),
        }
    }

    /// Build every tier from configuration: a RESP network tier when
    /// `network.enabled`, otherwise the null tier.
    #[must_use]
    pub fn from_config(config: StrataConfig) -> Self {
        let network: Box<dyn NetworkStore> = if config.network.enabled {
            Box::new(KvNetworkStore::resp(config.network.clone()))
        } else {
            Box::new(NullNetworkStore)
        };
        let durable = DurableStore::new(config.durable.clone());
        Self::new(config, network, durable)
    }

    /// Fast tier, for inspection.
    #[must_use]
    pub fn fast(&self) -> &FastStore {
        &self.fast
    }

    /// Network tier, for inspection.
    #[must_use]
    pub fn network(&self) -> &dyn NetworkStore {
        self.network.as_ref()
    }

    /// Durable tier, for strategy, entity and maintenance operations.
    #[must_use]
    pub fn durable(&self) -> &DurableStore {
        &self.durable
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    fn durable_enabled(&self) -> bool {
        self.config.durable.enabled
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Connect the network tier and open the durable tier. Idempotent.
    ///
    /// Never fails: a tier that does not come up is reported as `false`
    /// and the coordinator runs without it.
    pub async fn initialize(&self) -> TierStatus {
        let network = self.network.is_connected() || self.network.connect().await;
        let durable = self.durable_enabled() && self.durable.initialize().await;
        let status = TierStatus {
            fast: true,
            network,
            durable,
        };
        if status.fast_only() {
            warn!("Running in fast-tier-only mode");
        }
        info!(
            network = status.network,
            durable = status.durable,
            max_records = self.fast.max_records(),
            "Coordinator initialized"
        );
        status
    }

    /// Close network and durable connections. Idempotent; the fast tier
    /// keeps serving.
    pub async fn shutdown(&self) {
        self.network.shutdown().await;
        self.durable.shutdown().await;
        debug!("Coordinator shut down");
    }

    // ------------------------------------------------------------------
    // Store / retrieve
    // ------------------------------------------------------------------

    /// Store a record in the fast tier, and also in the durable tier when
    /// it is critical or `force_durable` is set.
    ///
    /// The network tier is not written here; consolidation copies records
    /// there.
    ///
    /// # Errors
    ///
    /// [`StrataError::DurableWriteFailed`] if a required durable write
    /// failed. The record is still in the fast tier.
    pub async fn store(&self, record: MemoryRecord, force_durable: bool) -> Result<MemoryId> {
        let needs_durable = force_durable || record.importance == Importance::Critical;
        let durable_copy = (needs_durable && self.durable_enabled()).then(|| record.clone());

        let id = self.fast.store(record);
        StrataCounters::incr(&self.counters.stores);

        if let Some(copy) = durable_copy {
            if let Err(e) = self.durable.store_checked(&copy).await {
                self.counters.record_failure(Tier::Durable);
                warn!(id = %id, error = %e, "Durable write failed for record requiring durability");
                return Err(StrataError::DurableWriteFailed {
                    id,
                    reason: e.to_string(),
                });
            }
            debug!(id = %id, "Record written through to durable tier");
        }
        Ok(id)
    }

    /// Find a record: fast, then network, then durable. A hit in a slower
    /// tier is copied into the fast tier.
    pub async fn retrieve(&self, id: &MemoryId) -> Option<MemoryRecord> {
        let _timer = self.retrieve_latency.start();

        if let Some(record) = self.fast.retrieve(id) {
            self.counters.record_hit(Tier::Fast);
            return Some(record);
        }

        if self.network.is_connected() {
            if let Some(record) = self.network.retrieve(id).await {
                self.counters.record_hit(Tier::Network);
                self.promote(&record);
                return Some(record);
            }
        }

        if self.durable.is_open() {
            if let Some(record) = self.durable.retrieve(id).await {
                self.counters.record_hit(Tier::Durable);
                self.promote(&record);
                return Some(record);
            }
        }

        StrataCounters::incr(&self.counters.misses);
        debug!(id = %id, "Record not found in any tier");
        None
    }

    fn promote(&self, record: &MemoryRecord) {
        debug!(id = %record.id, from = %record.tier, "Promoting record into fast tier");
        self.fast.store(record.clone());
        StrataCounters::incr(&self.counters.promotions);
    }

    /// Records matching `query` from all tiers, fast tier first, each id
    /// at most once.
    ///
    /// Slower tiers are consulted only while the result is short of
    /// `query.limit`. With no kind filter the network tier is scanned
    /// kind by kind.
    pub async fn query(&self, query: &MemoryQuery) -> Vec<MemoryRecord> {
        let limit = query.limit;
        let mut results = self.fast.query(query);
        results.truncate(limit);
        let mut seen: HashSet<MemoryId> = results.iter().map(|r| r.id).collect();

        if results.len() < limit && self.network.is_connected() {
            let now = Utc::now();
            'kinds: for kind in query.kinds_to_scan() {
                // Records already seen may come back again; fetch enough to cover them.
                let wanted = limit - results.len() + seen.len();
                for record in self.network.query_matching(kind, query, wanted).await {
                    if results.len() >= limit {
                        break 'kinds;
                    }
                    if query.matches(&record, now) && seen.insert(record.id) {
                        results.push(record);
                    }
                }
            }
        }

        if results.len() < limit && self.durable.is_open() {
            for record in self.durable.query(query).await {
                if results.len() >= limit {
                    break;
                }
                if seen.insert(record.id) {
                    results.push(record);
                }
            }
        }

        results
    }

    /// Remove a record from every tier. Returns whether any tier had it.
    pub async fn forget(&self, id: &MemoryId) -> bool {
        let mut removed = self.fast.remove(id).is_some();
        if self.network.is_connected() {
            removed |= self.network.delete(id).await;
        }
        if self.durable.is_open() {
            removed |= self.durable.delete(id).await;
        }
        debug!(id = %id, removed, "Forget requested");
        removed
    }

    // ------------------------------------------------------------------
    // Consolidation
    // ------------------------------------------------------------------

    /// Run a consolidation pass now.
    pub async fn consolidate(&self) -> ConsolidationStats {
        self.consolidate_at(Utc::now()).await
    }

    /// Scheduling hook: run a pass if the configured interval has elapsed
    /// since the previous one.
    pub async fn tick(&self, now: DateTime<Utc>) -> Option<ConsolidationStats> {
        if self.schedule.lock().is_due(now) {
            Some(self.consolidate_at(now).await)
        } else {
            None
        }
    }

    async fn consolidate_at(&self, now: DateTime<Utc>) -> ConsolidationStats {
        let hours = {
            let mut schedule = self.schedule.lock();
            let hours = schedule.hours_since_last(now);
            schedule.mark_run(now);
            hours
        };

        let mut stats = ConsolidationStats {
            decayed: self.fast.apply_decay_all(hours),
            ..ConsolidationStats::default()
        };
        self.counters
            .forgotten
            .fetch_add(stats.decayed as u64, std::sync::atomic::Ordering::Relaxed);

        let candidates = self.fast.consolidation_candidates();
        let network_up = self.network.is_connected();
        let durable_up = self.durable.is_open();

        for record in &candidates {
            if network_up {
                if self.network.store(record).await {
                    stats.promoted_to_network += 1;
                } else {
                    self.counters.record_failure(Tier::Network);
                }
            }
            if durable_up && record.importance.is_durable() {
                if self.durable.store(record).await {
                    stats.promoted_to_durable += 1;
                } else {
                    self.counters.record_failure(Tier::Durable);
                }
            }
        }

        StrataCounters::incr(&self.counters.consolidation_passes);
        info!(
            hours,
            candidates = candidates.len(),
            forgotten = stats.decayed,
            to_network = stats.promoted_to_network,
            to_durable = stats.promoted_to_durable,
            "Consolidation pass complete"
        );
        stats
    }

    // ------------------------------------------------------------------
    // Convenience helpers
    // ------------------------------------------------------------------

    /// Store an event record. `details` becomes the structured payload.
    ///
    /// # Errors
    ///
    /// Same as [`Self::store`].
    pub async fn remember_event(
        &self,
        event_type: &str,
        details: Context,
        importance: Importance,
    ) -> Result<MemoryId> {
        let mut context = Context::new();
        context.insert("event_type".to_string(), serde_json::Value::from(event_type));
        let record = MemoryRecord::new(MemoryKind::Event, event_type)
            .with_payload(Payload::Structured(details))
            .with_context(context)
            .with_tags([event_type])
            .with_importance(importance)
            .with_decay_rate(self.config.coordinator.default_decay_rate);
        self.store(record, false).await
    }

    /// Store a decision as a record sharing the decision's id, then append
    /// it to the network and durable decision histories (best-effort).
    ///
    /// # Errors
    ///
    /// Same as [`Self::store`], plus [`StrataError::Serialization`] if the
    /// decision's context cannot be encoded.
    pub async fn remember_decision(
        &self,
        decision: DecisionRecord,
        importance: Importance,
    ) -> Result<MemoryId> {
        let payload = match serde_json::to_value(&decision)? {
            serde_json::Value::Object(map) => Payload::Structured(map.into_iter().collect()),
            other => Payload::Text(other.to_string()),
        };
        let mut record = MemoryRecord::new(
            MemoryKind::Decision,
            format!("{}: {}", decision.decision_type, decision.action),
        )
        .with_payload(payload)
        .with_context(decision.context.clone())
        .with_tags([decision.decision_type.as_str()])
        .with_importance(importance)
        .with_decay_rate(self.config.coordinator.default_decay_rate);
        record.id = decision.id;
        record.created_at = decision.timestamp;

        let id = self.store(record, false).await?;

        if self.network.is_connected() && !self.network.store_decision(&decision).await {
            self.counters.record_failure(Tier::Network);
        }
        if self.durable.is_open() && !self.durable.record_decision(&decision).await {
            self.counters.record_failure(Tier::Durable);
        }
        Ok(id)
    }

    /// Recent decisions of a type: the network list if it has any,
    /// otherwise the durable history.
    pub async fn recent_decisions(&self, decision_type: &str, limit: usize) -> Vec<DecisionRecord> {
        if self.network.is_connected() {
            let recent = self.network.recent_decisions(decision_type, limit).await;
            if !recent.is_empty() {
                return recent;
            }
        }
        if self.durable.is_open() {
            return self.durable.recent_decisions(decision_type, limit).await;
        }
        Vec::new()
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    /// Snapshot of coordinator counters.
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot(self.fast.evictions())
    }

    /// Latency percentiles of recent `retrieve` calls.
    #[must_use]
    pub fn retrieve_latency(&self) -> LatencyPercentiles {
        self.retrieve_latency.percentiles()
    }
}
