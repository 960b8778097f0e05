//! Query filters shared by every tier.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::record::MemoryRecord;
use crate::types::{Importance, MemoryKind};

/// Default number of records returned by a query.
pub const DEFAULT_QUERY_LIMIT: usize = 10;

/// A conjunction of filters plus a result cap.
///
/// Empty `kinds` matches every kind; empty `tags` disables tag filtering,
/// otherwise a record matches if it carries any of the tags.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryQuery {
    /// Kinds to include; empty means all.
    pub kinds: BTreeSet<MemoryKind>,
    /// Tags of which at least one must be present; empty means no tag filter.
    pub tags: BTreeSet<String>,
    /// Lowest importance accepted.
    pub min_importance: Option<Importance>,
    /// Lowest strength accepted.
    pub min_strength: f64,
    /// Only records created within this many hours.
    pub max_age_hours: Option<f64>,
    /// Maximum number of results.
    pub limit: usize,
}

impl Default for MemoryQuery {
    fn default() -> Self {
        Self {
            kinds: BTreeSet::new(),
            tags: BTreeSet::new(),
            min_importance: None,
            min_strength: 0.0,
            max_age_hours: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl MemoryQuery {
    /// Match everything, up to the default limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given kinds.
    #[must_use]
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = MemoryKind>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    /// Require any of the given tags.
    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Require at least this importance.
    #[must_use]
    pub fn min_importance(mut self, importance: Importance) -> Self {
        self.min_importance = Some(importance);
        self
    }

    /// Require at least this strength.
    #[must_use]
    pub fn min_strength(mut self, strength: f64) -> Self {
        self.min_strength = strength;
        self
    }

    /// Only records created within the last `hours`.
    #[must_use]
    pub fn within_hours(mut self, hours: f64) -> Self {
        self.max_age_hours = Some(hours);
        self
    }

    /// Cap the number of results.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Whether `record` passes every filter at time `now`.
    #[must_use]
    pub fn matches(&self, record: &MemoryRecord, now: DateTime<Utc>) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&record.kind) {
            return false;
        }
        if !self.tags.is_empty() && self.tags.is_disjoint(&record.tags) {
            return false;
        }
        if let Some(min) = self.min_importance {
            if record.importance.rank() < min.rank() {
                return false;
            }
        }
        if record.strength < self.min_strength {
            return false;
        }
        if let Some(max_age) = self.max_age_hours {
            if record.age_hours(now) > max_age {
                return false;
            }
        }
        true
    }

    /// Kinds to enumerate when a tier can only list by kind.
    ///
    /// An empty kind filter expands to every kind.
    #[must_use]
    pub fn kinds_to_scan(&self) -> Vec<MemoryKind> {
        if self.kinds.is_empty() {
            MemoryKind::ALL.to_vec()
        } else {
            self.kinds.iter().copied().collect()
        }
    }
}
