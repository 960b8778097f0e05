//! Durable tier: SQLite storage for long-lived records.
//!
//! ```sql
//! memories   (id PK, kind, importance, importance_rank, payload, summary, context,
//!             tags, created_at, accessed_at, access_count, strength, related_ids,
//!             decay_rate, checksum)
//! decisions  (id PK, decision_type, action, context, outcome, lesson, timestamp, success)
//! strategies (id PK, strategy_type, parameters, success_rate, usage_count,
//!             last_updated, active)
//! entities   (id PK, entity_type, name, properties, first_seen, last_seen,
//!             interaction_count, sentiment)
//! ```
//!
//! - Structured columns are JSON text; timestamps are Unix milliseconds.
//! - Each memory row carries a CRC-32 of its column values. A mismatch on
//!   read is treated as not-found, never returned.
//! - The connection is owned here and used only from blocking tasks, each
//!   bounded by `timeout_ms`.
//! - Public operations are soft-fail: errors are logged with tier,
//!   operation and id, then collapsed to `false` / `None` / empty.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::config::DurableConfig;
use crate::error::{Result, StrataError};
use crate::query::MemoryQuery;
use crate::record::MemoryRecord;
use crate::types::{Context, DecisionRecord, EntityRecord, MemoryId, StrategyStat, Tier};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memories (
    id              TEXT PRIMARY KEY,
    kind            TEXT NOT NULL,
    importance      TEXT NOT NULL,
    importance_rank INTEGER NOT NULL,
    payload         TEXT NOT NULL,
    summary         TEXT NOT NULL,
    context         TEXT NOT NULL,
    tags            TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    accessed_at     INTEGER NOT NULL,
    access_count    INTEGER NOT NULL,
    strength        REAL NOT NULL,
    related_ids     TEXT NOT NULL,
    decay_rate      REAL NOT NULL,
    checksum        TEXT
);
CREATE INDEX IF NOT EXISTS idx_memories_kind ON memories(kind);
CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at);
CREATE INDEX IF NOT EXISTS idx_memories_accessed_at ON memories(accessed_at);

CREATE TABLE IF NOT EXISTS decisions (
    id            TEXT PRIMARY KEY,
    decision_type TEXT NOT NULL,
    action        TEXT NOT NULL,
    context       TEXT NOT NULL,
    outcome       TEXT,
    lesson        TEXT,
    timestamp     INTEGER NOT NULL,
    success       INTEGER
);
CREATE INDEX IF NOT EXISTS idx_decisions_type ON decisions(decision_type);

CREATE TABLE IF NOT EXISTS strategies (
    id            TEXT PRIMARY KEY,
    strategy_type TEXT NOT NULL,
    parameters    TEXT NOT NULL,
    success_rate  REAL NOT NULL,
    usage_count   INTEGER NOT NULL,
    last_updated  INTEGER NOT NULL,
    active        INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_strategies_type ON strategies(strategy_type);

CREATE TABLE IF NOT EXISTS entities (
    id                TEXT PRIMARY KEY,
    entity_type       TEXT NOT NULL,
    name              TEXT NOT NULL,
    properties        TEXT NOT NULL,
    first_seen        INTEGER NOT NULL,
    last_seen         INTEGER NOT NULL,
    interaction_count INTEGER NOT NULL,
    sentiment         REAL NOT NULL
);
";

const MEMORY_COLUMNS: &str = "id, kind, importance, importance_rank, payload, summary, context, \
     tags, created_at, accessed_at, access_count, strength, related_ids, decay_rate, checksum";

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StrataError::Serialization(format!("timestamp out of range: {ms}")))
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

/// A memory row exactly as stored.
#[derive(Debug, Clone)]
struct MemoryRow {
    id: String,
    kind: String,
    importance: String,
    importance_rank: i64,
    payload: String,
    summary: String,
    context: String,
    tags: String,
    created_at: i64,
    accessed_at: i64,
    access_count: i64,
    strength: f64,
    related_ids: String,
    decay_rate: f64,
}

impl MemoryRow {
    fn from_record(record: &MemoryRecord) -> Result<Self> {
        Ok(Self {
            id: record.id.to_string(),
            kind: record.kind.as_str().to_string(),
            importance: record.importance.as_str().to_string(),
            importance_rank: i64::from(record.importance.rank()),
            payload: serde_json::to_string(&record.payload)?,
            summary: record.summary.clone(),
            context: serde_json::to_string(&record.context)?,
            tags: serde_json::to_string(&record.tags)?,
            created_at: record.created_at.timestamp_millis(),
            accessed_at: record.accessed_at.timestamp_millis(),
            access_count: to_i64(record.access_count),
            strength: record.strength,
            related_ids: serde_json::to_string(&record.related_ids)?,
            decay_rate: record.decay_rate,
        })
    }

    fn into_record(self) -> Result<MemoryRecord> {
        Ok(MemoryRecord {
            id: self.id.parse()?,
            kind: self.kind.parse()?,
            tier: Tier::Durable,
            importance: self.importance.parse()?,
            payload: serde_json::from_str(&self.payload)?,
            summary: self.summary,
            context: serde_json::from_str(&self.context)?,
            tags: serde_json::from_str(&self.tags)?,
            related_ids: serde_json::from_str(&self.related_ids)?,
            created_at: millis_to_datetime(self.created_at)?,
            accessed_at: millis_to_datetime(self.accessed_at)?,
            access_count: to_u64(self.access_count),
            decay_rate: self.decay_rate,
            strength: self.strength.clamp(0.0, 1.0),
        })
    }

    /// CRC-32 over every column value, as lowercase hex.
    fn checksum(&self) -> String {
        let mut hasher = crc32fast::Hasher::new();
        for text in [
            &self.id,
            &self.kind,
            &self.importance,
            &self.payload,
            &self.summary,
            &self.context,
            &self.tags,
            &self.related_ids,
        ] {
            hasher.update(text.as_bytes());
            hasher.update(&[0x1f]);
        }
        for n in [self.importance_rank, self.created_at, self.accessed_at, self.access_count] {
            hasher.update(&n.to_le_bytes());
        }
        hasher.update(&self.strength.to_bits().to_le_bytes());
        hasher.update(&self.decay_rate.to_bits().to_le_bytes());
        format!("{:08x}", hasher.finalize())
    }

    fn read(row: &Row<'_>) -> rusqlite::Result<(Self, Option<String>)> {
        Ok((
            Self {
                id: row.get(0)?,
                kind: row.get(1)?,
                importance: row.get(2)?,
                importance_rank: row.get(3)?,
                payload: row.get(4)?,
                summary: row.get(5)?,
                context: row.get(6)?,
                tags: row.get(7)?,
                created_at: row.get(8)?,
                accessed_at: row.get(9)?,
                access_count: row.get(10)?,
                strength: row.get(11)?,
                related_ids: row.get(12)?,
                decay_rate: row.get(13)?,
            },
            row.get(14)?,
        ))
    }

    fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.prepare_cached(
            "INSERT INTO memories (id, kind, importance, importance_rank, payload, summary, context,
                                   tags, created_at, accessed_at, access_count, strength,
                                   related_ids, decay_rate, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                importance = excluded.importance,
                importance_rank = excluded.importance_rank,
                payload = excluded.payload,
                summary = excluded.summary,
                context = excluded.context,
                tags = excluded.tags,
                created_at = excluded.created_at,
                accessed_at = excluded.accessed_at,
                access_count = excluded.access_count,
                strength = excluded.strength,
                related_ids = excluded.related_ids,
                decay_rate = excluded.decay_rate,
                checksum = excluded.checksum",
        )?
        .execute(params![
            self.id,
            self.kind,
            self.importance,
            self.importance_rank,
            self.payload,
            self.summary,
            self.context,
            self.tags,
            self.created_at,
            self.accessed_at,
            self.access_count,
            self.strength,
            self.related_ids,
            self.decay_rate,
            self.checksum(),
        ])?;
        Ok(())
    }
}

/// Check a row against its stored checksum.
fn verify(row: &MemoryRow, stored: Option<&str>, enabled: bool) -> Result<()> {
    if !enabled {
        return Ok(());
    }
    let actual = row.checksum();
    let Some(expected) = stored else {
        return Err(StrataError::Integrity {
            id: row.id.clone(),
            expected: "<missing>".to_string(),
            actual,
        });
    };
    if expected == actual {
        Ok(())
    } else {
        Err(StrataError::Integrity {
            id: row.id.clone(),
            expected: expected.to_string(),
            actual,
        })
    }
}

fn read_strategy(row: &Row<'_>) -> rusqlite::Result<(String, String, String, f64, i64, i64, bool)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

type DecisionColumns = (String, String, String, String, Option<String>, Option<String>, i64, Option<bool>);

fn read_decision(row: &Row<'_>) -> rusqlite::Result<DecisionColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decision_from_columns(cols: DecisionColumns) -> Result<DecisionRecord> {
    let (id, decision_type, action, context, outcome, lesson, timestamp, success) = cols;
    Ok(DecisionRecord {
        id: id.parse()?,
        decision_type,
        action,
        context: serde_json::from_str(&context)?,
        outcome,
        lesson,
        timestamp: millis_to_datetime(timestamp)?,
        success,
    })
}

// ---------------------------------------------------------------------------
// DurableStore
// ---------------------------------------------------------------------------

/// Handle to the SQLite tier.
///
/// Cheap to share behind an `Arc`; the connection itself is opened by
/// [`DurableStore::initialize`] and closed by [`DurableStore::shutdown`].
///
/// ```no_run
/// # use strata_core::config::DurableConfig;
/// # use strata_core::persistence::DurableStore;
/// # use strata_core::record::MemoryRecord;
/// # use strata_core::types::MemoryKind;
/// # async fn demo() {
/// let store = DurableStore::new(DurableConfig::default());
/// assert!(store.initialize().await);
/// let record = MemoryRecord::new(MemoryKind::Fact, "the bridge is out");
/// assert!(store.store(&record).await);
/// let loaded = store.retrieve(&record.id).await;
/// # }
/// ```
pub struct DurableStore {
    conn: Arc<Mutex<Option<Connection>>>,
    config: DurableConfig,
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("path", &self.config.path)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl DurableStore {
    /// A store for `config.path`. Nothing is opened until [`Self::initialize`].
    #[must_use]
    pub fn new(config: DurableConfig) -> Self {
        Self {
            conn: Arc::new(Mutex::new(None)),
            config,
        }
    }

    /// An unopened store backed by a private in-memory database.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(DurableConfig {
            path: PathBuf::from(":memory:"),
            ..DurableConfig::default()
        })
    }

    /// Whether a connection is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    /// Database path (`:memory:` for in-memory databases).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn is_memory(&self) -> bool {
        self.config.path.as_os_str() == ":memory:"
    }

    /// Run `f` against the open connection on a blocking thread, bounded
    /// by the configured timeout.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            let conn = guard
                .as_mut()
                .ok_or(StrataError::TierUnavailable(Tier::Durable))?;
            f(conn)
        });
        match tokio::time::timeout(self.config.timeout(), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(StrataError::Transport {
                tier: Tier::Durable,
                operation,
                reason: join.to_string(),
            }),
            Err(_) => Err(StrataError::Timeout {
                tier: Tier::Durable,
                operation,
                timeout_ms: self.config.timeout_ms,
            }),
        }
    }

    fn log_failure(operation: &'static str, id: &str, err: &StrataError) {
        warn!(tier = %Tier::Durable, operation, id = %id, error = %err, "Durable tier operation failed");
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the database and create the schema if absent. Idempotent.
    pub async fn initialize(&self) -> bool {
        if self.is_open() {
            return true;
        }
        let config = self.config.clone();
        let opened = tokio::task::spawn_blocking(move || open_connection(&config)).await;
        match opened {
            Ok(Ok(conn)) => {
                let mut guard = self.conn.lock();
                if guard.is_none() {
                    *guard = Some(conn);
                }
                info!(
                    path = %self.config.path.display(),
                    wal = self.config.wal_mode,
                    "Durable tier opened"
                );
                true
            }
            Ok(Err(e)) => {
                Self::log_failure("initialize", "", &e);
                false
            }
            Err(join) => {
                warn!(tier = %Tier::Durable, error = %join, "Durable tier open task failed");
                false
            }
        }
    }

    /// Close the connection. Idempotent.
    pub async fn shutdown(&self) {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            if let Err((_, e)) = conn.close() {
                warn!(tier = %Tier::Durable, error = %e, "Error closing durable tier");
            }
            info!(path = %self.config.path.display(), "Durable tier closed");
        }
    }

    // ------------------------------------------------------------------
    // Memory records
    // ------------------------------------------------------------------

    /// Upsert a record, reporting why it failed.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::TierUnavailable`] if not initialized, or the
    /// underlying database, serialization or timeout error.
    pub async fn store_checked(&self, record: &MemoryRecord) -> Result<()> {
        let row = MemoryRow::from_record(record)?;
        let start = Instant::now();
        self.with_conn("store", move |conn| row.upsert(conn)).await?;
        debug!(
            id = %record.id,
            kind = %record.kind,
            elapsed_us = start.elapsed().as_micros(),
            "Stored record in durable tier"
        );
        Ok(())
    }

    /// Upsert a record (replace on conflict).
    pub async fn store(&self, record: &MemoryRecord) -> bool {
        match self.store_checked(record).await {
            Ok(()) => true,
            Err(e) => {
                Self::log_failure("store", &record.id.to_string(), &e);
                false
            }
        }
    }

    /// Read a record, reinforce it and persist the reinforcement.
    ///
    /// Rows that fail their checksum are reported as missing.
    pub async fn retrieve(&self, id: &MemoryId) -> Option<MemoryRecord> {
        let key = id.to_string();
        let checksums = self.config.checksum_enabled;
        let result = self
            .with_conn("retrieve", move |conn| {
                let tx = conn.transaction()?;
                let found = tx
                    .prepare_cached(&format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"))?
                    .query_row(params![key], MemoryRow::read)
                    .optional()?;
                let Some((row, stored)) = found else {
                    return Ok(None);
                };
                verify(&row, stored.as_deref(), checksums)?;

                let mut record = row.into_record()?;
                record.touch();
                MemoryRow::from_record(&record)?.upsert(&tx)?;
                tx.commit()?;
                Ok(Some(record))
            })
            .await;

        match result {
            Ok(found) => found,
            Err(e) => {
                Self::log_failure("retrieve", &id.to_string(), &e);
                None
            }
        }
    }

    /// Records matching `query`, most recently accessed first.
    ///
    /// Filters are pushed down into SQL; corrupt rows are skipped.
    pub async fn query(&self, query: &MemoryQuery) -> Vec<MemoryRecord> {
        if query.limit == 0 {
            return Vec::new();
        }
        let (sql, values) = build_query_sql(query, Utc::now());
        let checksums = self.config.checksum_enabled;
        let result = self
            .with_conn("query", move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values.iter()), MemoryRow::read)?;
                let mut records = Vec::new();
                for row in rows {
                    let (row, stored) = row?;
                    if let Err(e) = verify(&row, stored.as_deref(), checksums) {
                        warn!(tier = %Tier::Durable, operation = "query", error = %e, "Skipping corrupt row");
                        continue;
                    }
                    match row.into_record() {
                        Ok(record) => records.push(record),
                        Err(e) => {
                            warn!(tier = %Tier::Durable, operation = "query", error = %e, "Skipping undecodable row");
                        }
                    }
                }
                Ok(records)
            })
            .await;

        result.unwrap_or_else(|e| {
            Self::log_failure("query", "", &e);
            Vec::new()
        })
    }

    /// Remove a record. Returns `false` if it did not exist.
    pub async fn delete(&self, id: &MemoryId) -> bool {
        let key = id.to_string();
        let result = self
            .with_conn("delete", move |conn| {
                Ok(conn.execute("DELETE FROM memories WHERE id = ?1", params![key])? > 0)
            })
            .await;
        result.unwrap_or_else(|e| {
            Self::log_failure("delete", &id.to_string(), &e);
            false
        })
    }

    /// Whether a record exists, without reinforcing it.
    pub async fn contains(&self, id: &MemoryId) -> bool {
        let key = id.to_string();
        self.with_conn("contains", move |conn| {
            let found: Option<i64> = conn
                .query_row("SELECT 1 FROM memories WHERE id = ?1", params![key], |r| r.get(0))
                .optional()?;
            Ok(found.is_some())
        })
        .await
        .unwrap_or(false)
    }

    /// Number of stored records, or `None` if the tier is unavailable.
    pub async fn count(&self) -> Option<usize> {
        self.with_conn("count", |conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
            Ok(usize::try_from(n).unwrap_or(0))
        })
        .await
        .ok()
    }

    // ------------------------------------------------------------------
    // Strategies
    // ------------------------------------------------------------------

    /// Upsert a strategy. Each write bumps its usage count by one.
    pub async fn store_strategy(
        &self,
        strategy_id: &str,
        strategy_type: &str,
        parameters: &Context,
        success_rate: f64,
    ) -> bool {
        let params_json = match serde_json::to_string(parameters) {
            Ok(json) => json,
            Err(e) => {
                Self::log_failure("store_strategy", strategy_id, &StrataError::from(e));
                return false;
            }
        };
        let (id, kind) = (strategy_id.to_string(), strategy_type.to_string());
        let now = Utc::now().timestamp_millis();
        let result = self
            .with_conn("store_strategy", move |conn| {
                conn.prepare_cached(
                    "INSERT INTO strategies (id, strategy_type, parameters, success_rate,
                                             usage_count, last_updated, active)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5, 1)
                     ON CONFLICT(id) DO UPDATE SET
                        strategy_type = excluded.strategy_type,
                        parameters = excluded.parameters,
                        success_rate = excluded.success_rate,
                        usage_count = strategies.usage_count + 1,
                        last_updated = excluded.last_updated,
                        active = 1",
                )?
                .execute(params![id, kind, params_json, success_rate, now])?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                Self::log_failure("store_strategy", strategy_id, &e);
                false
            }
        }
    }

    /// The active strategy of `strategy_type` with the highest success
    /// rate, ties broken by usage count.
    pub async fn get_best_strategy(&self, strategy_type: &str) -> Option<StrategyStat> {
        let kind = strategy_type.to_string();
        let result = self
            .with_conn("get_best_strategy", move |conn| {
                let found = conn
                    .prepare_cached(
                        "SELECT id, strategy_type, parameters, success_rate, usage_count,
                                last_updated, active
                         FROM strategies
                         WHERE strategy_type = ?1 AND active = 1
                         ORDER BY success_rate DESC, usage_count DESC
                         LIMIT 1",
                    )?
                    .query_row(params![kind], read_strategy)
                    .optional()?;
                let Some((strategy_id, strategy_type, parameters, success_rate, usage, updated, active)) =
                    found
                else {
                    return Ok(None);
                };
                Ok(Some(StrategyStat {
                    strategy_id,
                    strategy_type,
                    parameters: serde_json::from_str(&parameters)?,
                    success_rate,
                    usage_count: to_u64(usage),
                    last_updated: millis_to_datetime(updated)?,
                    active,
                }))
            })
            .await;
        result.unwrap_or_else(|e| {
            Self::log_failure("get_best_strategy", strategy_type, &e);
            None
        })
    }

    /// Exclude a strategy from "best" lookups until it is written again.
    pub async fn deactivate_strategy(&self, strategy_id: &str) -> bool {
        let id = strategy_id.to_string();
        self.with_conn("deactivate_strategy", move |conn| {
            Ok(conn.execute("UPDATE strategies SET active = 0 WHERE id = ?1", params![id])? > 0)
        })
        .await
        .unwrap_or_else(|e| {
            Self::log_failure("deactivate_strategy", strategy_id, &e);
            false
        })
    }

    // ------------------------------------------------------------------
    // Decision history
    // ------------------------------------------------------------------

    /// Append (or replace) a decision in the history table.
    pub async fn record_decision(&self, decision: &DecisionRecord) -> bool {
        let context = match serde_json::to_string(&decision.context) {
            Ok(json) => json,
            Err(e) => {
                Self::log_failure("record_decision", &decision.id.to_string(), &StrataError::from(e));
                return false;
            }
        };
        let d = decision.clone();
        let result = self
            .with_conn("record_decision", move |conn| {
                conn.prepare_cached(
                    "INSERT OR REPLACE INTO decisions
                        (id, decision_type, action, context, outcome, lesson, timestamp, success)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?
                .execute(params![
                    d.id.to_string(),
                    d.decision_type,
                    d.action,
                    context,
                    d.outcome,
                    d.lesson,
                    d.timestamp.timestamp_millis(),
                    d.success,
                ])?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                Self::log_failure("record_decision", &decision.id.to_string(), &e);
                false
            }
        }
    }

    /// Most recent decisions of a type, newest first.
    pub async fn recent_decisions(&self, decision_type: &str, limit: usize) -> Vec<DecisionRecord> {
        let kind = decision_type.to_string();
        let limit = to_i64(limit as u64);
        let result = self
            .with_conn("recent_decisions", move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, decision_type, action, context, outcome, lesson, timestamp, success
                     FROM decisions WHERE decision_type = ?1
                     ORDER BY timestamp DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![kind, limit], read_decision)?;
                let mut out = Vec::new();
                for cols in rows {
                    out.push(decision_from_columns(cols?)?);
                }
                Ok(out)
            })
            .await;
        result.unwrap_or_else(|e| {
            Self::log_failure("recent_decisions", decision_type, &e);
            Vec::new()
        })
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Insert an entity, or update it and count one more interaction.
    /// `first_seen` is kept from the original row.
    pub async fn upsert_entity(&self, entity: &EntityRecord) -> bool {
        let properties = match serde_json::to_string(&entity.properties) {
            Ok(json) => json,
            Err(e) => {
                Self::log_failure("upsert_entity", &entity.id, &StrataError::from(e));
                return false;
            }
        };
        let e = entity.clone();
        let result = self
            .with_conn("upsert_entity", move |conn| {
                conn.prepare_cached(
                    "INSERT INTO entities (id, entity_type, name, properties, first_seen,
                                           last_seen, interaction_count, sentiment)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(id) DO UPDATE SET
                        entity_type = excluded.entity_type,
                        name = excluded.name,
                        properties = excluded.properties,
                        last_seen = excluded.last_seen,
                        interaction_count = entities.interaction_count + 1,
                        sentiment = excluded.sentiment",
                )?
                .execute(params![
                    e.id,
                    e.entity_type,
                    e.name,
                    properties,
                    e.first_seen.timestamp_millis(),
                    e.last_seen.timestamp_millis(),
                    to_i64(e.interaction_count),
                    e.sentiment,
                ])?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => true,
            Err(err) => {
                Self::log_failure("upsert_entity", &entity.id, &err);
                false
            }
        }
    }

    /// Look up an entity.
    pub async fn get_entity(&self, entity_id: &str) -> Option<EntityRecord> {
        let id = entity_id.to_string();
        let result = self
            .with_conn("get_entity", move |conn| {
                let found = conn
                    .prepare_cached(
                        "SELECT id, entity_type, name, properties, first_seen, last_seen,
                                interaction_count, sentiment
                         FROM entities WHERE id = ?1",
                    )?
                    .query_row(params![id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, f64>(7)?,
                        ))
                    })
                    .optional()?;
                let Some((id, entity_type, name, properties, first, last, count, sentiment)) = found
                else {
                    return Ok(None);
                };
                Ok(Some(EntityRecord {
                    id,
                    entity_type,
                    name,
                    properties: serde_json::from_str(&properties)?,
                    first_seen: millis_to_datetime(first)?,
                    last_seen: millis_to_datetime(last)?,
                    interaction_count: to_u64(count),
                    sentiment,
                }))
            })
            .await;
        result.unwrap_or_else(|e| {
            Self::log_failure("get_entity", entity_id, &e);
            None
        })
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Run SQLite's integrity check. `false` on corruption or when closed.
    pub async fn integrity_check(&self) -> bool {
        self.with_conn("integrity_check", |conn| {
            let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
            Ok(result == "ok")
        })
        .await
        .unwrap_or(false)
    }

    /// Copy the database to `dest` with SQLite's online-backup API.
    pub async fn backup(&self, dest: impl AsRef<Path>) -> bool {
        let dest = dest.as_ref().to_path_buf();
        let shown = dest.display().to_string();
        let result = self
            .with_conn("backup", move |conn| backup_to(conn, &dest))
            .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                Self::log_failure("backup", &shown, &e);
                false
            }
        }
    }

    /// Back up next to the database file as `<name>.bak.1`, shifting older
    /// backups up and keeping at most `backup_count`. No-op for in-memory
    /// databases.
    pub async fn create_rotating_backup(&self) -> bool {
        let max = self.config.backup_count;
        if self.is_memory() || max == 0 {
            return true;
        }
        let db_path = self.config.path.clone();
        let result = self
            .with_conn("rotating_backup", move |conn| {
                for i in (1..max).rev() {
                    let src = backup_path(&db_path, i);
                    if src.exists() {
                        std::fs::rename(&src, backup_path(&db_path, i + 1))?;
                    }
                }
                let oldest = backup_path(&db_path, max + 1);
                if oldest.exists() {
                    std::fs::remove_file(&oldest)?;
                }
                backup_to(conn, &backup_path(&db_path, 1))
            })
            .await;
        match result {
            Ok(()) => {
                info!(max_backups = max, "Rotating backup created");
                true
            }
            Err(e) => {
                Self::log_failure("rotating_backup", "", &e);
                false
            }
        }
    }
}

/// Open and prepare a connection: pragmas, then schema.
fn open_connection(config: &DurableConfig) -> Result<Connection> {
    let conn = if config.path.as_os_str() == ":memory:" {
        Connection::open_in_memory()?
    } else {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&config.path, flags)?;
        if config.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn
    };
    // Acknowledged writes must survive power loss.
    conn.execute_batch("PRAGMA synchronous = FULL;")?;
    conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

fn backup_to(conn: &Connection, dest: &Path) -> Result<()> {
    let start = Instant::now();
    let mut target = Connection::open(dest)?;
    let backup = rusqlite::backup::Backup::new(conn, &mut target)?;
    backup.run_to_completion(256, Duration::from_millis(10), None)?;
    info!(
        dest = %dest.display(),
        elapsed_ms = start.elapsed().as_millis(),
        "Durable tier backup completed"
    );
    Ok(())
}

/// Path to a numbered backup file (e.g. `strata.db.bak.1`).
fn backup_path(db_path: &Path, n: u32) -> PathBuf {
    let mut name = db_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".bak.{n}"));
    db_path.with_file_name(name)
}

/// Append `items` as positional parameters, returning their `?N` list.
fn placeholders(values: &mut Vec<SqlValue>, items: Vec<SqlValue>) -> String {
    let start = values.len() + 1;
    let n = items.len();
    values.extend(items);
    (start..start + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Translate a query into SQL plus positional parameters.
fn build_query_sql(query: &MemoryQuery, now: DateTime<Utc>) -> (String, Vec<SqlValue>) {
    let mut sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE strength >= ?1");
    let mut values = vec![SqlValue::Real(query.min_strength)];

    if !query.kinds.is_empty() {
        let kinds = query
            .kinds
            .iter()
            .map(|k| SqlValue::Text(k.as_str().to_string()))
            .collect();
        let p = placeholders(&mut values, kinds);
        sql.push_str(&format!(" AND kind IN ({p})"));
    }
    if !query.tags.is_empty() {
        let tags = query.tags.iter().map(|t| SqlValue::Text(t.clone())).collect();
        let p = placeholders(&mut values, tags);
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM json_each(memories.tags) WHERE json_each.value IN ({p}))"
        ));
    }
    if let Some(min) = query.min_importance {
        let p = placeholders(&mut values, vec![SqlValue::Integer(i64::from(min.rank()))]);
        sql.push_str(&format!(" AND importance_rank >= {p}"));
    }
    if let Some(hours) = query.max_age_hours {
        let cutoff = now.timestamp_millis() - (hours.max(0.0) * 3_600_000.0) as i64;
        let p = placeholders(&mut values, vec![SqlValue::Integer(cutoff)]);
        sql.push_str(&format!(" AND created_at >= {p}"));
    }
    let p = placeholders(&mut values, vec![SqlValue::Integer(to_i64(query.limit as u64))]);
    sql.push_str(&format!(" ORDER BY accessed_at DESC LIMIT {p}"));
    (sql, values)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Importance, MemoryKind, Payload};
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap;

    async fn open() -> DurableStore {
        let store = DurableStore::in_memory();
        assert!(store.initialize().await);
        store
    }

    fn structured() -> MemoryRecord {
        let mut map = BTreeMap::new();
        map.insert("hp".to_string(), serde_json::json!(42));
        map.insert("zone".to_string(), serde_json::json!("Elwynn"));
        MemoryRecord::new(MemoryKind::CombatPattern, "kited the mob")
            .with_payload(map)
            .with_tags(["combat", "kite"])
            .with_importance(Importance::Important)
    }

    #[tokio::test]
    async fn round_trip_preserves_content() {
        let store = open().await;
        let rec = structured();
        assert!(store.store(&rec).await);

        let got = store.retrieve(&rec.id).await.expect("found");
        assert_eq!(got.payload, rec.payload);
        assert_eq!(got.kind, rec.kind);
        assert_eq!(got.tags, rec.tags);
        assert_eq!(got.tier, Tier::Durable);
        assert_eq!(got.access_count, 1);
    }

    #[tokio::test]
    async fn retrieve_persists_reinforcement() {
        let store = open().await;
        let rec = MemoryRecord::new(MemoryKind::Fact, "f");
        store.store(&rec).await;
        store.retrieve(&rec.id).await.expect("first");
        let second = store.retrieve(&rec.id).await.expect("second");
        assert_eq!(second.access_count, 2);
    }

    #[tokio::test]
    async fn upsert_replaces() {
        let store = open().await;
        let mut rec = MemoryRecord::new(MemoryKind::Fact, "old");
        store.store(&rec).await;
        rec.summary = "new".to_string();
        rec.payload = Payload::Text("new".to_string());
        store.store(&rec).await;
        assert_eq!(store.count().await, Some(1));
        assert_eq!(store.retrieve(&rec.id).await.expect("found").summary, "new");
    }

    #[tokio::test]
    async fn corrupt_rows_fail_closed() {
        let store = open().await;
        let rec = MemoryRecord::new(MemoryKind::Fact, "trust me");
        store.store(&rec).await;

        let key = rec.id.to_string();
        store
            .with_conn("corrupt", move |conn| {
                conn.execute("UPDATE memories SET summary = 'tampered' WHERE id = ?1", params![key])?;
                Ok(())
            })
            .await
            .expect("tamper");

        assert!(store.retrieve(&rec.id).await.is_none());
        assert!(store.query(&MemoryQuery::new()).await.is_empty());
    }

    #[tokio::test]
    async fn missing_checksum_fails_closed() {
        let store = open().await;
        let rec = MemoryRecord::new(MemoryKind::Fact, "trust me");
        store.store(&rec).await;

        let key = rec.id.to_string();
        store
            .with_conn("strip checksum", move |conn| {
                conn.execute(
                    "UPDATE memories SET summary = 'tampered', checksum = NULL WHERE id = ?1",
                    params![key],
                )?;
                Ok(())
            })
            .await
            .expect("tamper");

        assert!(store.retrieve(&rec.id).await.is_none());
        assert!(store.query(&MemoryQuery::new()).await.is_empty());
    }

    #[tokio::test]
    async fn query_pushes_filters_down() {
        let store = open().await;
        let combat = structured();
        let mut weak = MemoryRecord::new(MemoryKind::Event, "weak").with_tags(["combat"]);
        weak.strength = 0.2;
        let mut old = MemoryRecord::new(MemoryKind::Event, "old");
        old.created_at = Utc::now() - ChronoDuration::hours(48);
        let fresh = MemoryRecord::new(MemoryKind::Event, "fresh");
        for r in [&combat, &weak, &old, &fresh] {
            assert!(store.store(r).await);
        }

        let all = store.query(&MemoryQuery::new().limit(10)).await;
        assert_eq!(all.len(), 4);

        let events = store.query(&MemoryQuery::new().kinds([MemoryKind::Event])).await;
        assert_eq!(events.len(), 3);

        let tagged = store.query(&MemoryQuery::new().tags(["combat"])).await;
        assert_eq!(tagged.len(), 2);

        let strong_tagged = store
            .query(&MemoryQuery::new().tags(["combat"]).min_strength(0.5))
            .await;
        assert_eq!(strong_tagged.len(), 1);
        assert_eq!(strong_tagged[0].id, combat.id);

        let recent = store.query(&MemoryQuery::new().within_hours(24.0)).await;
        assert!(recent.iter().all(|r| r.id != old.id));
        assert_eq!(recent.len(), 3);

        let important = store
            .query(&MemoryQuery::new().min_importance(Importance::Important))
            .await;
        assert_eq!(important.len(), 1);

        assert_eq!(store.query(&MemoryQuery::new().limit(2)).await.len(), 2);
    }

    #[tokio::test]
    async fn query_orders_by_recent_access() {
        let store = open().await;
        let a = MemoryRecord::new(MemoryKind::Fact, "a");
        let b = MemoryRecord::new(MemoryKind::Fact, "b");
        store.store(&a).await;
        store.store(&b).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.retrieve(&a.id).await.expect("a");
        let results = store.query(&MemoryQuery::new()).await;
        assert_eq!(results[0].id, a.id);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = open().await;
        let rec = MemoryRecord::new(MemoryKind::Fact, "f");
        store.store(&rec).await;
        assert!(store.delete(&rec.id).await);
        assert!(!store.delete(&rec.id).await);
        assert!(store.retrieve(&rec.id).await.is_none());
    }

    #[tokio::test]
    async fn best_strategy_by_rate_then_usage() {
        let store = open().await;
        let params = Context::new();
        assert!(store.store_strategy("kite", "combat", &params, 0.6).await);
        assert!(store.store_strategy("burst", "combat", &params, 0.8).await);
        assert!(store.store_strategy("haggle", "economy", &params, 0.99).await);

        let best = store.get_best_strategy("combat").await.expect("best");
        assert_eq!(best.strategy_id, "burst");
        assert_eq!(best.usage_count, 1);

        // Equal rates: the more used one wins.
        store.store_strategy("kite", "combat", &params, 0.8).await;
        store.store_strategy("kite", "combat", &params, 0.8).await;
        let best = store.get_best_strategy("combat").await.expect("best");
        assert_eq!(best.strategy_id, "kite");
        assert_eq!(best.usage_count, 3);

        assert!(store.deactivate_strategy("kite").await);
        assert_eq!(
            store.get_best_strategy("combat").await.expect("best").strategy_id,
            "burst"
        );
        assert!(store.get_best_strategy("pvp").await.is_none());
    }

    #[tokio::test]
    async fn decision_history_newest_first() {
        let store = open().await;
        let mut first = DecisionRecord::new("combat", "flee");
        first.timestamp = Utc::now() - ChronoDuration::minutes(5);
        let second = DecisionRecord::new("combat", "fight").with_outcome("won", true);
        store.record_decision(&first).await;
        store.record_decision(&second).await;
        store.record_decision(&DecisionRecord::new("trade", "sell")).await;

        let recent = store.recent_decisions("combat", 10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action, "fight");
        assert_eq!(recent[0].success, Some(true));
        assert_eq!(store.recent_decisions("combat", 1).await.len(), 1);
    }

    #[tokio::test]
    async fn entity_upsert_counts_interactions() {
        let store = open().await;
        let first = EntityRecord::new("npc-1", "npc", "Marshal Dughan");
        assert!(store.upsert_entity(&first).await);
        let mut again = first.clone().with_sentiment(0.5);
        again.first_seen = Utc::now() + ChronoDuration::hours(1);
        assert!(store.upsert_entity(&again).await);

        let got = store.get_entity("npc-1").await.expect("found");
        assert_eq!(got.interaction_count, 2);
        assert_eq!(got.first_seen.timestamp_millis(), first.first_seen.timestamp_millis());
        assert!((got.sentiment - 0.5).abs() < f64::EPSILON);
        assert!(store.get_entity("npc-2").await.is_none());
    }

    #[tokio::test]
    async fn closed_store_soft_fails() {
        let store = DurableStore::in_memory();
        let rec = MemoryRecord::new(MemoryKind::Fact, "f");
        assert!(!store.store(&rec).await);
        assert!(store.retrieve(&rec.id).await.is_none());
        assert!(store.query(&MemoryQuery::new()).await.is_empty());
        assert!(!store.delete(&rec.id).await);
        assert!(store.get_best_strategy("combat").await.is_none());
        assert!(matches!(
            store.store_checked(&rec).await,
            Err(StrataError::TierUnavailable(Tier::Durable))
        ));
    }

    #[tokio::test]
    async fn lifecycle_is_idempotent() {
        let store = open().await;
        assert!(store.initialize().await);
        assert!(store.integrity_check().await);
        store.shutdown().await;
        store.shutdown().await;
        assert!(!store.is_open());
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen_and_backs_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = DurableConfig {
            path: dir.path().join("agent.db"),
            backup_count: 2,
            ..DurableConfig::default()
        };
        let rec = MemoryRecord::new(MemoryKind::Location, "Goldshire inn");

        let store = DurableStore::new(config.clone());
        assert!(store.initialize().await);
        assert!(store.store(&rec).await);
        assert!(store.create_rotating_backup().await);
        assert!(store.create_rotating_backup().await);
        assert!(store.create_rotating_backup().await);
        store.shutdown().await;

        assert!(dir.path().join("agent.db.bak.1").exists());
        assert!(dir.path().join("agent.db.bak.2").exists());
        assert!(!dir.path().join("agent.db.bak.3").exists());

        let reopened = DurableStore::new(config);
        assert!(reopened.initialize().await);
        assert_eq!(reopened.retrieve(&rec.id).await.expect("found").summary, "Goldshire inn");

        let backup = DurableStore::new(DurableConfig {
            path: dir.path().join("agent.db.bak.1"),
            ..DurableConfig::default()
        });
        assert!(backup.initialize().await);
        assert!(backup.contains(&rec.id).await);
    }

    #[test]
    fn checksum_covers_every_column() {
        let row = MemoryRow::from_record(&structured()).expect("row");
        let mut changed = row.clone();
        changed.strength = 0.5;
        assert_ne!(row.checksum(), changed.checksum());
        let mut changed = row.clone();
        changed.tags = "[]".to_string();
        assert_ne!(row.checksum(), changed.checksum());
        assert_eq!(row.checksum(), row.clone().checksum());
    }

    #[test]
    fn backup_paths_append_suffix() {
        assert_eq!(
            backup_path(Path::new("/tmp/world.db"), 2),
            PathBuf::from("/tmp/world.db.bak.2")
        );
    }
}
