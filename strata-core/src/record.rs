//! The memory record: the atomic unit stored in every tier.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decay::{self, DEFAULT_DECAY_RATE, FORGET_THRESHOLD, REINFORCE_STEP};
use crate::types::{Context, Importance, MemoryId, MemoryKind, Payload, Tier};

/// A single memory: identity, typed payload and decay state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier, immutable.
    pub id: MemoryId,
    /// What the record describes.
    pub kind: MemoryKind,
    /// Tier this copy was last written to or read from.
    #[serde(default)]
    pub tier: Tier,
    /// Fixed at creation.
    pub importance: Importance,
    /// Primary content.
    pub payload: Payload,
    /// Short human-readable description (may be empty).
    pub summary: String,
    /// Auxiliary key → value pairs.
    #[serde(default)]
    pub context: Context,
    /// Categorical labels.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Advisory links to other records; may dangle.
    #[serde(default)]
    pub related_ids: BTreeSet<MemoryId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last successful read.
    pub accessed_at: DateTime<Utc>,
    /// Number of successful reads.
    pub access_count: u64,
    /// Strength lost per hour at normal importance.
    pub decay_rate: f64,
    /// Current relevance in [0, 1].
    pub strength: f64,
}

impl MemoryRecord {
    /// Create a record whose payload defaults to the summary text.
    #[must_use]
    pub fn new(kind: MemoryKind, summary: impl Into<String>) -> Self {
        let summary = summary.into();
        let now = Utc::now();
        Self {
            id: MemoryId::new(),
            kind,
            tier: Tier::Fast,
            importance: Importance::Normal,
            payload: Payload::Text(summary.clone()),
            summary,
            context: Context::new(),
            tags: BTreeSet::new(),
            related_ids: BTreeSet::new(),
            created_at: now,
            accessed_at: now,
            access_count: 0,
            decay_rate: DEFAULT_DECAY_RATE,
            strength: 1.0,
        }
    }

    /// Set the importance.
    #[must_use]
    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    /// Replace the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Replace the context.
    #[must_use]
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Add tags; duplicates collapse.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Link to other records.
    #[must_use]
    pub fn with_related(mut self, ids: impl IntoIterator<Item = MemoryId>) -> Self {
        self.related_ids.extend(ids);
        self
    }

    /// Override the per-hour decay rate. Negative rates are treated as zero.
    #[must_use]
    pub fn with_decay_rate(mut self, rate: f64) -> Self {
        self.decay_rate = rate.max(0.0);
        self
    }

    /// Reinforce on a successful read.
    pub fn touch(&mut self) {
        self.touch_at(Utc::now());
    }

    /// Reinforce on a successful read at an explicit time.
    pub fn touch_at(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.strength = (self.strength + REINFORCE_STEP).clamp(0.0, 1.0);
        self.accessed_at = now;
    }

    /// Lose strength for `hours_elapsed` hours. Critical records are untouched.
    pub fn apply_decay(&mut self, hours_elapsed: f64) {
        self.strength = decay::decayed_strength(
            self.strength,
            self.decay_rate,
            self.importance,
            hours_elapsed,
        );
    }

    /// Whether the record is weak enough to drop from the fast tier.
    #[must_use]
    pub fn should_forget(&self) -> bool {
        self.strength < FORGET_THRESHOLD
    }

    /// Hours since creation, never negative.
    #[must_use]
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        let millis = (now - self.created_at).num_milliseconds().max(0);
        millis as f64 / 3_600_000.0
    }
}
