//! Fast tier: bounded in-process store.
//!
//! Records live in an unbounded [`LruCache`] that only tracks recency;
//! capacity is enforced here by strength-based eviction (see
//! [`crate::eviction`]). Secondary indices by kind and tag are private and
//! only mutated under the write lock.
//!
//! Every operation is synchronous and never fails. Mutations (`store`,
//! `retrieve` which reinforces, decay sweeps, removal) take the write lock;
//! `peek`, `query` and candidate listing share the read lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use lru::LruCache;
use parking_lot::RwLock;
use tracing::debug;

use crate::consolidation;
use crate::eviction::{self, RemovalCause};
use crate::query::MemoryQuery;
use crate::record::MemoryRecord;
use crate::types::{MemoryId, MemoryKind, Tier};

/// Default capacity of the fast tier.
pub const DEFAULT_MAX_RECORDS: usize = 1000;

struct FastInner {
    records: LruCache<MemoryId, MemoryRecord>,
    by_kind: HashMap<MemoryKind, HashSet<MemoryId>>,
    by_tag: HashMap<String, HashSet<MemoryId>>,
}

impl FastInner {
    fn index(&mut self, record: &MemoryRecord) {
        self.by_kind.entry(record.kind).or_default().insert(record.id);
        for tag in &record.tags {
            self.by_tag.entry(tag.clone()).or_default().insert(record.id);
        }
    }

    fn unindex(&mut self, record: &MemoryRecord) {
        if let Some(ids) = self.by_kind.get_mut(&record.kind) {
            ids.remove(&record.id);
            if ids.is_empty() {
                self.by_kind.remove(&record.kind);
            }
        }
        for tag in &record.tags {
            if let Some(ids) = self.by_tag.get_mut(tag) {
                ids.remove(&record.id);
                if ids.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
    }

    fn remove(&mut self, id: &MemoryId, cause: RemovalCause) -> Option<MemoryRecord> {
        let record = self.records.pop(id)?;
        self.unindex(&record);
        debug!(id = %id, strength = record.strength, cause = %cause, "Fast tier removed record");
        Some(record)
    }

    /// Ids that could match `query`, narrowed through the indices when possible.
    fn candidate_ids(&self, query: &MemoryQuery) -> Option<HashSet<MemoryId>> {
        if !query.kinds.is_empty() {
            let ids = query
                .kinds
                .iter()
                .filter_map(|k| self.by_kind.get(k))
                .flatten()
                .copied()
                .collect();
            return Some(ids);
        }
        if !query.tags.is_empty() {
            let ids = query
                .tags
                .iter()
                .filter_map(|t| self.by_tag.get(t))
                .flatten()
                .copied()
                .collect();
            return Some(ids);
        }
        None
    }
}

/// The in-process tier.
pub struct FastStore {
    inner: RwLock<FastInner>,
    max_records: usize,
    access_threshold: u64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for FastStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastStore")
            .field("len", &self.len())
            .field("max_records", &self.max_records)
            .finish_non_exhaustive()
    }
}

impl Default for FastStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORDS)
    }
}

impl FastStore {
    /// Create a store holding at most `max_records` records (minimum 1).
    #[must_use]
    pub fn new(max_records: usize) -> Self {
        Self::with_access_threshold(max_records, consolidation::DEFAULT_ACCESS_THRESHOLD)
    }

    /// Create a store with a custom consolidation access threshold.
    #[must_use]
    pub fn with_access_threshold(max_records: usize, access_threshold: u64) -> Self {
        Self {
            inner: RwLock::new(FastInner {
                records: LruCache::unbounded(),
                by_kind: HashMap::new(),
                by_tag: HashMap::new(),
            }),
            max_records: max_records.max(1),
            access_threshold,
            evictions: AtomicU64::new(0),
        }
    }

    /// Insert or overwrite a record, evicting the weakest record if full.
    pub fn store(&self, mut record: MemoryRecord) -> MemoryId {
        record.tier = Tier::Fast;
        let id = record.id;
        let mut inner = self.inner.write();

        if let Some(old) = inner.records.pop(&id) {
            inner.unindex(&old);
        } else if inner.records.len() >= self.max_records {
            let victim = eviction::select_victim(inner.records.iter().rev().map(|(_, r)| r));
            if let Some(victim) = victim {
                inner.remove(&victim, RemovalCause::Capacity);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        inner.index(&record);
        inner.records.put(id, record);
        id
    }

    /// Look up a record, reinforcing it and marking it most recently used.
    pub fn retrieve(&self, id: &MemoryId) -> Option<MemoryRecord> {
        let mut inner = self.inner.write();
        let record = inner.records.get_mut(id)?;
        record.touch();
        Some(record.clone())
    }

    /// Look up a record without reinforcing it or changing recency.
    #[must_use]
    pub fn peek(&self, id: &MemoryId) -> Option<MemoryRecord> {
        self.inner.read().records.peek(id).cloned()
    }

    /// Whether a record is present.
    #[must_use]
    pub fn contains(&self, id: &MemoryId) -> bool {
        self.inner.read().records.contains(id)
    }

    /// Records matching `query`, at most `query.limit` of them.
    #[must_use]
    pub fn query(&self, query: &MemoryQuery) -> Vec<MemoryRecord> {
        if query.limit == 0 {
            return Vec::new();
        }
        let now = Utc::now();
        let inner = self.inner.read();
        match inner.candidate_ids(query) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| inner.records.peek(id))
                .filter(|r| query.matches(r, now))
                .take(query.limit)
                .cloned()
                .collect(),
            None => inner
                .records
                .iter()
                .map(|(_, r)| r)
                .filter(|r| query.matches(r, now))
                .take(query.limit)
                .cloned()
                .collect(),
        }
    }

    /// Decay every record by `hours` and drop those that fall below the
    /// forget threshold. Returns how many were dropped.
    pub fn apply_decay_all(&self, hours: f64) -> usize {
        let mut inner = self.inner.write();
        let mut forgotten = Vec::new();
        for (id, record) in inner.records.iter_mut() {
            record.apply_decay(hours);
            if record.should_forget() {
                forgotten.push(*id);
            }
        }
        for id in &forgotten {
            inner.remove(id, RemovalCause::Forgotten);
        }
        if !forgotten.is_empty() {
            debug!(hours, forgotten = forgotten.len(), "Fast tier decay sweep");
        }
        forgotten.len()
    }

    /// Records worth copying to slower tiers: important or frequently read.
    #[must_use]
    pub fn consolidation_candidates(&self) -> Vec<MemoryRecord> {
        self.inner
            .read()
            .records
            .iter()
            .map(|(_, r)| r)
            .filter(|r| consolidation::is_candidate(r, self.access_threshold))
            .cloned()
            .collect()
    }

    /// Remove a record. Returns it if it was present.
    pub fn remove(&self, id: &MemoryId) -> Option<MemoryRecord> {
        self.inner.write().remove(id, RemovalCause::Explicit)
    }

    /// Ids of every stored record of `kind`.
    #[must_use]
    pub fn ids_by_kind(&self, kind: MemoryKind) -> Vec<MemoryId> {
        self.inner
            .read()
            .by_kind
            .get(&kind)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop every record.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.records.clear();
        inner.by_kind.clear();
        inner.by_tag.clear();
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    #[must_use]
    pub fn max_records(&self) -> usize {
        self.max_records
    }

    /// Records evicted for capacity since creation.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Importance;

    fn event(summary: &str) -> MemoryRecord {
        MemoryRecord::new(MemoryKind::Event, summary)
    }

    #[test]
    fn store_then_retrieve_reinforces() {
        let store = FastStore::new(10);
        let id = store.store(event("a"));
        let got = store.retrieve(&id).expect("hit");
        assert_eq!(got.access_count, 1);
        assert_eq!(got.tier, Tier::Fast);
        assert_eq!(store.peek(&id).expect("hit").access_count, 1);
    }

    #[test]
    fn eviction_keeps_capacity_and_drops_weakest() {
        let store = FastStore::new(3);
        let mut weak = event("weak");
        weak.strength = 0.2;
        let weak_id = weak.id;
        store.store(event("a"));
        store.store(weak);
        store.store(event("b"));
        store.store(event("c"));

        assert_eq!(store.len(), 3);
        assert!(!store.contains(&weak_id));
        assert_eq!(store.evictions(), 1);
        assert!(store.ids_by_kind(MemoryKind::Event).len() == 3);
    }

    #[test]
    fn eviction_tie_breaks_on_least_recent() {
        let store = FastStore::new(2);
        let first = store.store(event("first"));
        let second = store.store(event("second"));
        // Reading `first` makes `second` the least recently used of two
        // equally strong records.
        store.retrieve(&first);
        store.store(event("third"));
        assert!(store.contains(&first));
        assert!(!store.contains(&second));
    }

    #[test]
    fn overwrite_does_not_evict() {
        let store = FastStore::new(2);
        let a = event("a");
        let a_id = a.id;
        store.store(a.clone());
        store.store(event("b"));
        store.store(a.with_tags(["new"]));
        assert_eq!(store.len(), 2);
        assert_eq!(store.evictions(), 0);
        let tagged = store.query(&MemoryQuery::new().tags(["new"]));
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].id, a_id);
    }

    #[test]
    fn query_respects_filters_and_limit() {
        let store = FastStore::new(100);
        for i in 0..5 {
            store.store(event(&format!("e{i}")).with_tags(["combat"]));
        }
        store.store(MemoryRecord::new(MemoryKind::Fact, "f").with_importance(Importance::Critical));

        assert_eq!(store.query(&MemoryQuery::new().limit(100)).len(), 6);
        assert_eq!(store.query(&MemoryQuery::new().kinds([MemoryKind::Event]).limit(3)).len(), 3);
        assert_eq!(store.query(&MemoryQuery::new().tags(["combat"]).limit(100)).len(), 5);
        let critical = store.query(&MemoryQuery::new().min_importance(Importance::Critical));
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].kind, MemoryKind::Fact);
        assert!(store.query(&MemoryQuery::new().limit(0)).is_empty());
    }

    #[test]
    fn decay_sweep_forgets_weak_records() {
        let store = FastStore::new(10);
        store.store(event("normal"));
        store.store(event("trivial").with_importance(Importance::Trivial));
        let critical = store.store(event("critical").with_importance(Importance::Critical));

        // 4 hours: trivial loses 1.2 (gone), normal loses 0.4.
        assert_eq!(store.apply_decay_all(4.0), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.peek(&critical).expect("kept").strength, 1.0);
        assert!(store.query(&MemoryQuery::new().tags(["x"])).is_empty());
    }

    #[test]
    fn candidates_are_important_or_hot() {
        let store = FastStore::new(10);
        let hot = store.store(event("hot"));
        store.store(event("cold"));
        let important = store.store(event("imp").with_importance(Importance::Important));
        for _ in 0..3 {
            store.retrieve(&hot);
        }
        let mut ids: Vec<_> = store.consolidation_candidates().iter().map(|r| r.id).collect();
        ids.sort();
        let mut expected = vec![hot, important];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn remove_and_clear() {
        let store = FastStore::new(10);
        let id = store.store(event("a").with_tags(["t"]));
        assert!(store.remove(&id).is_some());
        assert!(store.remove(&id).is_none());
        assert!(store.query(&MemoryQuery::new().tags(["t"])).is_empty());
        store.store(event("b"));
        store.clear();
        assert!(store.is_empty());
    }
}
