//! # Strata Core Library
//!
//! Tiered memory for autonomous agents. Records of what an agent saw,
//! decided and learned live in up to three tiers at once:
//!
//! - **Fast**: in-process, bounded, indexed by kind and tag
//! - **Network**: a Redis-compatible key-value server with per-key expiry
//! - **Durable**: SQLite, checksummed, never evicted by decay
//!
//! The [`Coordinator`] routes writes by importance, promotes reads from
//! slower tiers, merges queries across tiers and runs consolidation when
//! the host ticks it. Network and durable tiers are optional at runtime:
//! with neither available the coordinator keeps serving from the fast tier.
//!
//! ```no_run
//! use strata_core::{Coordinator, Importance, MemoryKind, MemoryQuery, MemoryRecord, StrataConfig};
//!
//! # async fn demo() -> strata_core::error::Result<()> {
//! let coordinator = Coordinator::from_config(StrataConfig::in_memory());
//! let status = coordinator.initialize().await;
//! assert!(status.fast);
//!
//! let record = MemoryRecord::new(MemoryKind::Location, "vendor sells cheap arrows")
//!     .with_importance(Importance::Important)
//!     .with_tags(["vendor", "arrows"]);
//! let id = coordinator.store(record, false).await?;
//!
//! let found = coordinator.retrieve(&id).await;
//! let vendors = coordinator.query(&MemoryQuery::new().tags(["vendor"])).await;
//! coordinator.consolidate().await;
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod consolidation;
pub mod coordinator;
pub mod decay;
pub mod error;
pub mod eviction;
pub mod fast;
pub mod logging;
pub mod metrics;
pub mod network;
pub mod persistence;
pub mod query;
pub mod record;
pub mod types;

pub use config::StrataConfig;
pub use coordinator::{Coordinator, TierStatus};
pub use error::StrataError;
pub use query::MemoryQuery;
pub use record::MemoryRecord;
pub use types::*;
