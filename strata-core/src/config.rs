//! Configuration for the strata memory system.
//!
//! Maps directly to `strata.toml`. Every field has a default, so an empty
//! file (or no file at all) yields a working fast + durable setup with the
//! network tier disabled.
//!
//! ```toml
//! [general]
//! log_level = "debug"
//!
//! [fast]
//! max_records = 5000
//!
//! [network]
//! enabled = true
//! address = "10.0.0.5:6379"
//!
//! [durable]
//! path = "/var/lib/agent/strata.db"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Importance;

/// Top-level configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Logging settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// In-process tier.
    #[serde(default)]
    pub fast: FastConfig,
    /// Networked key-value tier.
    #[serde(default)]
    pub network: NetworkConfig,
    /// SQLite tier.
    #[serde(default)]
    pub durable: DurableConfig,
    /// Orchestration settings.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

impl StrataConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `StrataError::Config` if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> crate::error::Result<Self> {
        toml::from_str(toml_str).map_err(|e| crate::StrataError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// A configuration for tests and embedding: in-memory durable tier,
    /// network tier off.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            durable: DurableConfig {
                path: PathBuf::from(":memory:"),
                ..DurableConfig::default()
            },
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error. `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

/// In-process tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastConfig {
    /// Maximum number of records held in process.
    #[serde(default = "default_1000")]
    pub max_records: usize,
    /// Reads after which a record is copied outward during consolidation.
    #[serde(default = "default_3_u64")]
    pub consolidation_access_threshold: u64,
}

impl Default for FastConfig {
    fn default() -> Self {
        Self {
            max_records: 1000,
            consolidation_access_threshold: 3,
        }
    }
}

/// Networked key-value tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Whether to use the network tier at all.
    #[serde(default)]
    pub enabled: bool,
    /// `host:port` of a Redis-compatible server.
    #[serde(default = "default_address")]
    pub address: String,
    /// Namespace prepended to every key.
    #[serde(default = "default_prefix")]
    pub key_prefix: String,
    /// Expiry for a normal-importance record, in hours.
    #[serde(default = "default_24_f64")]
    pub base_ttl_hours: f64,
    /// Entries kept per decision-type history list.
    #[serde(default = "default_100")]
    pub decision_history_len: usize,
    /// Expiry of decision-type history lists, in hours.
    #[serde(default = "default_168_f64")]
    pub decision_ttl_hours: f64,
    /// Bound on every network call, in milliseconds.
    #[serde(default = "default_2000")]
    pub timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_address(),
            key_prefix: default_prefix(),
            base_ttl_hours: 24.0,
            decision_history_len: 100,
            decision_ttl_hours: 168.0,
            timeout_ms: 2000,
        }
    }
}

impl NetworkConfig {
    /// Expiry for a record of the given importance.
    ///
    /// Scales `base_ttl_hours` by 0.5 / 1 / 3 / 24 for trivial through critical.
    #[must_use]
    pub fn ttl_for(&self, importance: Importance) -> Duration {
        let multiplier = match importance {
            Importance::Trivial => 0.5,
            Importance::Normal => 1.0,
            Importance::Important => 3.0,
            Importance::Critical => 24.0,
        };
        hours_to_duration(self.base_ttl_hours * multiplier)
    }

    /// Expiry for decision history lists.
    #[must_use]
    pub fn decision_ttl(&self) -> Duration {
        hours_to_duration(self.decision_ttl_hours)
    }

    /// Bound on each network call.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// SQLite tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableConfig {
    /// Whether to use the durable tier at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Database file; `:memory:` for a private in-memory database.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Use WAL mode for concurrent reads.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
    /// Store and verify a CRC-32 per record row.
    #[serde(default = "default_true")]
    pub checksum_enabled: bool,
    /// Bound on every durable call, in milliseconds.
    #[serde(default = "default_5000")]
    pub timeout_ms: u64,
    /// Number of rotating backups to keep.
    #[serde(default = "default_3_u32")]
    pub backup_count: u32,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_db_path(),
            wal_mode: true,
            checksum_enabled: true,
            timeout_ms: 5000,
            backup_count: 3,
        }
    }
}

impl DurableConfig {
    /// Bound on each durable call.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Minimum spacing between consolidation passes driven by `tick`.
    #[serde(default = "default_300")]
    pub consolidation_interval_seconds: u64,
    /// Decay rate given to records built by the convenience helpers.
    #[serde(default = "default_decay_rate")]
    pub default_decay_rate: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            consolidation_interval_seconds: 300,
            default_decay_rate: 0.1,
        }
    }
}

impl CoordinatorConfig {
    /// Consolidation interval as a duration.
    #[must_use]
    pub fn consolidation_interval(&self) -> Duration {
        Duration::from_secs(self.consolidation_interval_seconds)
    }
}

fn hours_to_duration(hours: f64) -> Duration {
    Duration::from_secs_f64((hours * 3600.0).max(1.0))
}

// ---------------------------------------------------------------------------
// Serde default helpers
// ---------------------------------------------------------------------------

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_address() -> String { "127.0.0.1:6379".to_string() }
fn default_prefix() -> String { "strata".to_string() }
fn default_db_path() -> PathBuf { PathBuf::from("strata.db") }
fn default_decay_rate() -> f64 { 0.1 }
fn default_24_f64() -> f64 { 24.0 }
fn default_168_f64() -> f64 { 168.0 }
fn default_3_u32() -> u32 { 3 }
fn default_3_u64() -> u64 { 3 }
fn default_100() -> usize { 100 }
fn default_300() -> u64 { 300 }
fn default_1000() -> usize { 1000 }
fn default_2000() -> u64 { 2000 }
fn default_5000() -> u64 { 5000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = StrataConfig::from_toml("").expect("parse");
        assert_eq!(config.fast.max_records, 1000);
        assert!(!config.network.enabled);
        assert!(config.durable.enabled);
        assert_eq!(config.coordinator.consolidation_interval(), Duration::from_secs(300));
    }

    #[test]
    fn partial_sections_fill_in() {
        let config = StrataConfig::from_toml(
            r#"
            [fast]
            max_records = 5

            [network]
            enabled = true
            base_ttl_hours = 2.0
            "#,
        )
        .expect("parse");
        assert_eq!(config.fast.max_records, 5);
        assert_eq!(config.fast.consolidation_access_threshold, 3);
        assert!(config.network.enabled);
        assert_eq!(config.network.key_prefix, "strata");
        assert_eq!(config.network.ttl_for(Importance::Important), Duration::from_secs(6 * 3600));
    }

    #[test]
    fn ttl_scales_with_importance() {
        let net = NetworkConfig::default();
        assert_eq!(net.ttl_for(Importance::Trivial), Duration::from_secs(12 * 3600));
        assert_eq!(net.ttl_for(Importance::Normal), Duration::from_secs(24 * 3600));
        assert_eq!(net.ttl_for(Importance::Critical), Duration::from_secs(24 * 24 * 3600));
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = StrataConfig::from_toml("[fast]\nmax_records = \"lots\"").expect_err("invalid");
        assert!(matches!(err, crate::StrataError::Config(_)));
    }
}
