//! Capacity eviction for the fast tier.
//!
//! When the fast tier is full, the record with the globally lowest
//! strength is dropped. Ties go to the least recently used record, so the
//! choice is deterministic for a given access history.
//!
//! Unlike decay-driven forgetting this never looks at importance: a
//! critical record can be evicted from the fast tier, but it has already
//! been written to the durable tier by the coordinator.

use ordered_float::OrderedFloat;

use crate::record::MemoryRecord;
use crate::types::MemoryId;

/// Why a record left the fast tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Displaced to make room for a new record.
    Capacity,
    /// Strength fell below the forget threshold.
    Forgotten,
    /// Removed on request.
    Explicit,
}

impl std::fmt::Display for RemovalCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Capacity => write!(f, "capacity"),
            Self::Forgotten => write!(f, "forgotten"),
            Self::Explicit => write!(f, "explicit"),
        }
    }
}

/// Pick the eviction victim from records ordered least recently used first.
///
/// Returns the id with the minimal strength; among equal strengths the
/// earliest (least recently used) wins.
#[must_use]
pub fn select_victim<'a, I>(lru_first: I) -> Option<MemoryId>
where
    I: IntoIterator<Item = &'a MemoryRecord>,
{
    lru_first
        .into_iter()
        .min_by_key(|r| OrderedFloat(r.strength))
        .map(|r| r.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryKind;

    fn with_strength(s: f64) -> MemoryRecord {
        let mut r = MemoryRecord::new(MemoryKind::Event, "e");
        r.strength = s;
        r
    }

    #[test]
    fn picks_weakest() {
        let records = [with_strength(0.9), with_strength(0.2), with_strength(0.5)];
        assert_eq!(select_victim(&records), Some(records[1].id));
    }

    #[test]
    fn ties_go_to_least_recent() {
        let records = [with_strength(0.3), with_strength(0.3), with_strength(0.8)];
        assert_eq!(select_victim(&records), Some(records[0].id));
    }

    #[test]
    fn empty_has_no_victim() {
        let records: [MemoryRecord; 0] = [];
        assert_eq!(select_victim(&records), None);
    }
}
