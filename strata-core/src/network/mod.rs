//! Network tier: cross-process storage with automatic expiry.
//!
//! The tier is optional. [`NetworkStore`] is the seam the coordinator talks
//! to; [`NullNetworkStore`] is the degraded-mode implementation used when no
//! server is configured, and [`KvNetworkStore`] lays records out over any
//! [`KvBackend`]:
//!
//! ```text
//! {prefix}:memory:{id}          JSON record, expiry by importance
//! {prefix}:kind:{kind}          set of ids, expiry never shortened
//! {prefix}:decisions:{type}     capped list of JSON decisions, newest first
//! ```
//!
//! Every operation is soft-fail: transport errors and timeouts are logged
//! and turned into `false` / `None` / empty results.

pub mod backend;
pub mod resp;

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

pub use backend::{KvBackend, MemoryKvBackend};
pub use resp::RespBackend;

use crate::config::NetworkConfig;
use crate::error::{Result, StrataError};
use crate::query::MemoryQuery;
use crate::record::MemoryRecord;
use crate::types::{DecisionRecord, MemoryId, MemoryKind, Tier};

/// Operations the coordinator needs from the network tier.
#[async_trait]
pub trait NetworkStore: Send + Sync {
    /// Establish the backing connection. `false` means run without this tier.
    async fn connect(&self) -> bool;

    /// Whether the last `connect` succeeded and `shutdown` has not been called.
    fn is_connected(&self) -> bool;

    /// Write a record with an importance-derived expiry and index it by kind.
    async fn store(&self, record: &MemoryRecord) -> bool;

    /// Read and reinforce a record, keeping its remaining expiry.
    async fn retrieve(&self, id: &MemoryId) -> Option<MemoryRecord>;

    /// Up to `limit` live records of `kind`.
    async fn query_by_kind(&self, kind: MemoryKind, limit: usize) -> Vec<MemoryRecord>;

    /// Up to `limit` live records of `kind` that match `filter`. The scan
    /// runs past non-matching members, so `limit` counts matches only.
    async fn query_matching(&self, kind: MemoryKind, filter: &MemoryQuery, limit: usize) -> Vec<MemoryRecord>;

    /// Push a decision onto its type's capped history list.
    async fn store_decision(&self, decision: &DecisionRecord) -> bool;

    /// Most recent decisions of a type, newest first.
    async fn recent_decisions(&self, decision_type: &str, limit: usize) -> Vec<DecisionRecord>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, id: &MemoryId) -> bool;

    /// Close the connection. Idempotent.
    async fn shutdown(&self);
}

// ---------------------------------------------------------------------------
// Degraded mode
// ---------------------------------------------------------------------------

/// A network tier that is never available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNetworkStore;

#[async_trait]
impl NetworkStore for NullNetworkStore {
    async fn connect(&self) -> bool {
        debug!("Network tier disabled; running without it");
        false
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn store(&self, _record: &MemoryRecord) -> bool {
        false
    }

    async fn retrieve(&self, _id: &MemoryId) -> Option<MemoryRecord> {
        None
    }

    async fn query_by_kind(&self, _kind: MemoryKind, _limit: usize) -> Vec<MemoryRecord> {
        Vec::new()
    }

    async fn query_matching(&self, _kind: MemoryKind, _filter: &MemoryQuery, _limit: usize) -> Vec<MemoryRecord> {
        Vec::new()
    }

    async fn store_decision(&self, _decision: &DecisionRecord) -> bool {
        false
    }

    async fn recent_decisions(&self, _decision_type: &str, _limit: usize) -> Vec<DecisionRecord> {
        Vec::new()
    }

    async fn delete(&self, _id: &MemoryId) -> bool {
        false
    }

    async fn shutdown(&self) {}
}

// ---------------------------------------------------------------------------
// Key-value implementation
// ---------------------------------------------------------------------------

/// Network tier over a Redis-style key-value backend.
pub struct KvNetworkStore<B: KvBackend> {
    backend: B,
    config: NetworkConfig,
    connected: AtomicBool,
}

impl<B: KvBackend> std::fmt::Debug for KvNetworkStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvNetworkStore")
            .field("prefix", &self.config.key_prefix)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl KvNetworkStore<RespBackend> {
    /// Network tier talking to the server named in `config.address`.
    #[must_use]
    pub fn resp(config: NetworkConfig) -> Self {
        let backend = RespBackend::new(config.address.clone(), config.timeout());
        Self::new(backend, config)
    }
}

impl<B: KvBackend> KvNetworkStore<B> {
    /// Wrap a backend. Call [`NetworkStore::connect`] before use.
    #[must_use]
    pub fn new(backend: B, config: NetworkConfig) -> Self {
        Self {
            backend,
            config,
            connected: AtomicBool::new(false),
        }
    }

    /// The underlying backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Key holding a record.
    #[must_use]
    pub fn record_key(&self, id: &MemoryId) -> String {
        format!("{}:memory:{id}", self.config.key_prefix)
    }

    /// Key of the per-kind id set.
    #[must_use]
    pub fn kind_key(&self, kind: MemoryKind) -> String {
        format!("{}:kind:{kind}", self.config.key_prefix)
    }

    /// Key of a decision-type history list.
    #[must_use]
    pub fn decisions_key(&self, decision_type: &str) -> String {
        format!("{}:decisions:{decision_type}", self.config.key_prefix)
    }

    /// Run one backend call under the configured timeout.
    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl std::future::Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        tokio::time::timeout(self.config.timeout(), fut)
            .await
            .unwrap_or_else(|_| {
                Err(StrataError::Timeout {
                    tier: Tier::Network,
                    operation,
                    timeout_ms: self.config.timeout_ms,
                })
            })
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StrataError::TierUnavailable(Tier::Network))
        }
    }

    async fn try_store(&self, record: &MemoryRecord) -> Result<()> {
        self.ensure_connected()?;
        let mut copy = record.clone();
        copy.tier = Tier::Network;
        let json = serde_json::to_vec(&copy)?;
        let ttl = self.config.ttl_for(record.importance);

        self.call("set", self.backend.set_ex(&self.record_key(&record.id), &json, ttl))
            .await?;

        let kind_key = self.kind_key(record.kind);
        self.call("sadd", self.backend.sadd(&kind_key, &record.id.to_string()))
            .await?;
        // The index must outlive every member, so its expiry only grows.
        let remaining = self.call("pttl", self.backend.pttl(&kind_key)).await?;
        if remaining.is_none_or(|left| left < ttl) {
            self.call("expire", self.backend.expire(&kind_key, ttl)).await?;
        }
        Ok(())
    }

    async fn read(&self, id: &MemoryId) -> Result<Option<MemoryRecord>> {
        let Some(bytes) = self.call("get", self.backend.get(&self.record_key(id))).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice::<MemoryRecord>(&bytes)?;
        if record.id != *id {
            return Err(StrataError::Integrity {
                id: id.to_string(),
                expected: id.to_string(),
                actual: record.id.to_string(),
            });
        }
        Ok(Some(record))
    }

    async fn try_retrieve(&self, id: &MemoryId) -> Result<Option<MemoryRecord>> {
        self.ensure_connected()?;
        let key = self.record_key(id);
        let Some(mut record) = self.read(id).await? else {
            return Ok(None);
        };
        record.touch();
        record.tier = Tier::Network;

        let ttl = match self.call("pttl", self.backend.pttl(&key)).await? {
            Some(left) => left,
            // Expired between the two reads; report the hit without resurrecting it.
            None => return Ok(Some(record)),
        };
        let json = serde_json::to_vec(&record)?;
        self.call("set", self.backend.set_ex(&key, &json, ttl)).await?;
        Ok(Some(record))
    }

    async fn try_query_by_kind(
        &self,
        kind: MemoryKind,
        filter: Option<&MemoryQuery>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        self.ensure_connected()?;
        let now = Utc::now();
        let kind_key = self.kind_key(kind);
        let members = self.call("smembers", self.backend.smembers(&kind_key)).await?;
        let mut records = Vec::with_capacity(limit.min(members.len()));
        for member in members {
            if records.len() >= limit {
                break;
            }
            let Ok(id) = member.parse::<MemoryId>() else {
                continue;
            };
            match self.read(&id).await {
                Ok(Some(mut record)) => {
                    record.tier = Tier::Network;
                    if filter.is_none_or(|f| f.matches(&record, now)) {
                        records.push(record);
                    }
                }
                Ok(None) => {
                    // Record expired independently of its index entry.
                    self.call("srem", self.backend.srem(&kind_key, &member)).await?;
                }
                Err(e @ (StrataError::Serialization(_) | StrataError::Integrity { .. })) => {
                    warn!(tier = %Tier::Network, id = %id, error = %e, "Skipping undecodable record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn try_store_decision(&self, decision: &DecisionRecord) -> Result<()> {
        self.ensure_connected()?;
        let key = self.decisions_key(&decision.decision_type);
        let json = serde_json::to_vec(decision)?;
        let keep = i64::try_from(self.config.decision_history_len.max(1)).unwrap_or(i64::MAX);
        self.call("lpush", self.backend.lpush(&key, &json)).await?;
        self.call("ltrim", self.backend.ltrim(&key, 0, keep - 1)).await?;
        self.call("expire", self.backend.expire(&key, self.config.decision_ttl()))
            .await?;
        Ok(())
    }

    async fn try_recent_decisions(&self, decision_type: &str, limit: usize) -> Result<Vec<DecisionRecord>> {
        self.ensure_connected()?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = i64::try_from(limit).unwrap_or(i64::MAX) - 1;
        let items = self
            .call("lrange", self.backend.lrange(&self.decisions_key(decision_type), 0, stop))
            .await?;
        Ok(items
            .iter()
            .filter_map(|bytes| serde_json::from_slice(bytes).ok())
            .collect())
    }

    async fn try_delete(&self, id: &MemoryId) -> Result<bool> {
        self.ensure_connected()?;
        let Some(record) = self.read(id).await? else {
            return Ok(false);
        };
        self.call("srem", self.backend.srem(&self.kind_key(record.kind), &id.to_string()))
            .await?;
        self.call("del", self.backend.del(&self.record_key(id))).await
    }
}

/// Log a soft failure. `TierUnavailable` is expected in degraded mode and
/// only traced.
fn log_failure(operation: &'static str, id: Option<&MemoryId>, err: &StrataError) {
    let id = id.map(ToString::to_string).unwrap_or_default();
    if matches!(err, StrataError::TierUnavailable(_)) {
        debug!(tier = %Tier::Network, operation, id = %id, "Network tier not connected");
    } else {
        warn!(tier = %Tier::Network, operation, id = %id, error = %err, "Network tier operation failed");
    }
}

#[async_trait]
impl<B: KvBackend> NetworkStore for KvNetworkStore<B> {
    async fn connect(&self) -> bool {
        match self.call("ping", self.backend.ping()).await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                info!(prefix = %self.config.key_prefix, "Network tier available");
                true
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                warn!(error = %e, "Network tier unreachable; continuing without it");
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn store(&self, record: &MemoryRecord) -> bool {
        match self.try_store(record).await {
            Ok(()) => {
                debug!(id = %record.id, kind = %record.kind, "Stored record in network tier");
                true
            }
            Err(e) => {
                log_failure("store", Some(&record.id), &e);
                false
            }
        }
    }

    async fn retrieve(&self, id: &MemoryId) -> Option<MemoryRecord> {
        self.try_retrieve(id).await.unwrap_or_else(|e| {
            log_failure("retrieve", Some(id), &e);
            None
        })
    }

    async fn query_by_kind(&self, kind: MemoryKind, limit: usize) -> Vec<MemoryRecord> {
        self.try_query_by_kind(kind, None, limit).await.unwrap_or_else(|e| {
            log_failure("query_by_kind", None, &e);
            Vec::new()
        })
    }

    async fn query_matching(&self, kind: MemoryKind, filter: &MemoryQuery, limit: usize) -> Vec<MemoryRecord> {
        self.try_query_by_kind(kind, Some(filter), limit)
            .await
            .unwrap_or_else(|e| {
                log_failure("query_matching", None, &e);
                Vec::new()
            })
    }

    async fn store_decision(&self, decision: &DecisionRecord) -> bool {
        match self.try_store_decision(decision).await {
            Ok(()) => true,
            Err(e) => {
                log_failure("store_decision", Some(&decision.id), &e);
                false
            }
        }
    }

    async fn recent_decisions(&self, decision_type: &str, limit: usize) -> Vec<DecisionRecord> {
        self.try_recent_decisions(decision_type, limit)
            .await
            .unwrap_or_else(|e| {
                log_failure("recent_decisions", None, &e);
                Vec::new()
            })
    }

    async fn delete(&self, id: &MemoryId) -> bool {
        self.try_delete(id).await.unwrap_or_else(|e| {
            log_failure("delete", Some(id), &e);
            false
        })
    }

    async fn shutdown(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.backend.close().await;
            info!("Network tier shut down");
        }
    }
}
