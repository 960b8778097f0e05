//! Error types for the strata core library.

use thiserror::Error;

use crate::types::{MemoryId, Tier};

/// Top-level error type for all strata operations.
///
/// Tier-internal code propagates these with `?`; the public network and
/// durable operations log them and collapse to `bool` / `Option` at the
/// boundary, so most callers only ever see [`StrataError::DurableWriteFailed`].
#[derive(Error, Debug)]
pub enum StrataError {
    /// SQLite error from the durable tier.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A backend call failed in transit.
    #[error("{tier} tier {operation} failed: {reason}")]
    Transport {
        /// Which tier.
        tier: Tier,
        /// Which operation.
        operation: &'static str,
        /// Backend-reported cause.
        reason: String,
    },

    /// A backend call did not complete in time.
    #[error("{tier} tier {operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Which tier.
        tier: Tier,
        /// Which operation.
        operation: &'static str,
        /// Configured bound.
        timeout_ms: u64,
    },

    /// Stored content failed its checksum.
    #[error("Integrity check failed for {id}: expected {expected}, got {actual}")]
    Integrity {
        /// Row identifier.
        id: String,
        /// Stored checksum.
        expected: String,
        /// Checksum of the bytes actually read.
        actual: String,
    },

    /// The tier has no open connection.
    #[error("{0} tier unavailable")]
    TierUnavailable(Tier),

    /// A record that must be durable could not be written durably.
    #[error("Durable write failed for {id}: {reason}")]
    DurableWriteFailed {
        /// Record that was not persisted.
        id: MemoryId,
        /// Why.
        reason: String,
    },
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, StrataError>;
