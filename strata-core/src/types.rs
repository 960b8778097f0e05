//! Core type definitions for the strata memory system.
//!
//! Identity, the closed tag sets used to classify records, and the
//! secondary durable-tier entities (decisions, strategies, entities).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StrataError;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Unique identifier for a memory record. Stable across tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Create a new random memory ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MemoryId {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| StrataError::Serialization(format!("invalid memory id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Closed tag sets
// ---------------------------------------------------------------------------

/// What a memory record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Something observed happening.
    Event,
    /// A choice the agent made.
    Decision,
    /// The result of a decision.
    Outcome,
    /// A recurring pattern.
    Pattern,
    /// A pattern observed in combat.
    CombatPattern,
    /// A learned strategy.
    Strategy,
    /// Knowledge about an entity.
    Entity,
    /// Knowledge about a place.
    Location,
    /// Prices, trades, market observations.
    Economic,
    /// Scratch memory with a short useful life.
    ShortTerm,
    /// A plain fact.
    Fact,
}

impl MemoryKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::Event,
        Self::Decision,
        Self::Outcome,
        Self::Pattern,
        Self::CombatPattern,
        Self::Strategy,
        Self::Entity,
        Self::Location,
        Self::Economic,
        Self::ShortTerm,
        Self::Fact,
    ];

    /// Stable lowercase name, used in storage keys and columns.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Decision => "decision",
            Self::Outcome => "outcome",
            Self::Pattern => "pattern",
            Self::CombatPattern => "combat_pattern",
            Self::Strategy => "strategy",
            Self::Entity => "entity",
            Self::Location => "location",
            Self::Economic => "economic",
            Self::ShortTerm => "short_term",
            Self::Fact => "fact",
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryKind {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| StrataError::Serialization(format!("unknown memory kind: {s}")))
    }
}

/// How much a record matters. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    /// Noise; decays three times faster than normal.
    Trivial,
    /// The default.
    #[default]
    Normal,
    /// Decays slowly and is persisted during consolidation.
    Important,
    /// Never decays; written durably on store.
    Critical,
}

impl Importance {
    /// Every importance level, lowest first.
    pub const ALL: [Self; 4] = [Self::Trivial, Self::Normal, Self::Important, Self::Critical];

    /// Numeric rank (trivial = 0 … critical = 3) for minimum-importance filters.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Trivial => 0,
            Self::Normal => 1,
            Self::Important => 2,
            Self::Critical => 3,
        }
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Normal => "normal",
            Self::Important => "important",
            Self::Critical => "critical",
        }
    }

    /// Whether this level is persisted to the durable tier during consolidation.
    #[must_use]
    pub const fn is_durable(self) -> bool {
        matches!(self, Self::Important | Self::Critical)
    }
}

impl fmt::Display for Importance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Importance {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| StrataError::Serialization(format!("unknown importance: {s}")))
    }
}

/// Where a record was last written to or read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// In-process store.
    #[default]
    Fast,
    /// Networked key-value store with expiry.
    Network,
    /// Relational store on disk.
    Durable,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => f.write_str("fast"),
            Self::Network => f.write_str("network"),
            Self::Durable => f.write_str("durable"),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Primary content of a record: a plain string or a structured mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    /// A primitive text value.
    Text(String),
    /// A key → value mapping.
    Structured(BTreeMap<String, serde_json::Value>),
}

impl Payload {
    /// Borrow the text, if this is a text payload.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Structured(_) => None,
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<BTreeMap<String, serde_json::Value>> for Payload {
    fn from(map: BTreeMap<String, serde_json::Value>) -> Self {
        Self::Structured(map)
    }
}

/// Auxiliary key → value pairs.
pub type Context = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Secondary durable entities
// ---------------------------------------------------------------------------

/// A decision and, once known, its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Row identifier; shared with the memory record created for it.
    pub id: MemoryId,
    /// Category of decision ("combat", "trade", ...).
    pub decision_type: String,
    /// What was chosen.
    pub action: String,
    /// Inputs the decision was based on.
    #[serde(default)]
    pub context: Context,
    /// What happened, if already known.
    #[serde(default)]
    pub outcome: Option<String>,
    /// What was learned from it.
    #[serde(default)]
    pub lesson: Option<String>,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// Whether it worked out, if known.
    #[serde(default)]
    pub success: Option<bool>,
}

impl DecisionRecord {
    /// A decision made now with no outcome yet.
    #[must_use]
    pub fn new(decision_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: MemoryId::new(),
            decision_type: decision_type.into(),
            action: action.into(),
            context: Context::new(),
            outcome: None,
            lesson: None,
            timestamp: Utc::now(),
            success: None,
        }
    }

    /// Attach the decision's inputs.
    #[must_use]
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Record the outcome.
    #[must_use]
    pub fn with_outcome(mut self, outcome: impl Into<String>, success: bool) -> Self {
        self.outcome = Some(outcome.into());
        self.success = Some(success);
        self
    }

    /// Record the lesson learned.
    #[must_use]
    pub fn with_lesson(mut self, lesson: impl Into<String>) -> Self {
        self.lesson = Some(lesson.into());
        self
    }
}

/// Aggregate statistics for a learned strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyStat {
    /// Strategy identifier.
    pub strategy_id: String,
    /// Strategy category ("combat", "economy", ...).
    pub strategy_type: String,
    /// Tunable parameters.
    pub parameters: Context,
    /// Observed success rate.
    pub success_rate: f64,
    /// How many times this strategy has been written.
    pub usage_count: u64,
    /// Last write time.
    pub last_updated: DateTime<Utc>,
    /// Inactive strategies are never returned as "best".
    pub active: bool,
}

/// Something the agent has met: a player, NPC, vendor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Stable identifier.
    pub id: String,
    /// Category ("player", "npc", ...).
    pub entity_type: String,
    /// Display name.
    pub name: String,
    /// Free-form properties.
    #[serde(default)]
    pub properties: Context,
    /// First sighting.
    pub first_seen: DateTime<Utc>,
    /// Most recent sighting.
    pub last_seen: DateTime<Utc>,
    /// Number of recorded interactions.
    pub interaction_count: u64,
    /// -1.0 (hostile) to 1.0 (friendly).
    pub sentiment: f64,
}

impl EntityRecord {
    /// A freshly sighted entity.
    #[must_use]
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            name: name.into(),
            properties: Context::new(),
            first_seen: now,
            last_seen: now,
            interaction_count: 1,
            sentiment: 0.0,
        }
    }

    /// Set the sentiment, clamped to [-1, 1].
    #[must_use]
    pub fn with_sentiment(mut self, sentiment: f64) -> Self {
        self.sentiment = sentiment.clamp(-1.0, 1.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in MemoryKind::ALL {
            assert_eq!(kind.as_str().parse::<MemoryKind>().expect("parse"), kind);
        }
        assert!("nonsense".parse::<MemoryKind>().is_err());
    }

    #[test]
    fn importance_is_ordered_by_rank() {
        assert!(Importance::Trivial < Importance::Normal);
        assert!(Importance::Important < Importance::Critical);
        assert_eq!(Importance::Critical.rank(), 3);
        assert!(Importance::Important.is_durable());
        assert!(!Importance::Normal.is_durable());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&MemoryKind::CombatPattern).expect("json");
        assert_eq!(json, "\"combat_pattern\"");
    }

    #[test]
    fn memory_id_parses_its_display() {
        let id = MemoryId::new();
        assert_eq!(id.to_string().parse::<MemoryId>().expect("parse"), id);
    }
}
