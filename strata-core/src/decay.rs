//! Linear strength decay.
//!
//! Every record loses strength at a constant per-hour rate scaled by its
//! importance:
//!
//! ```text
//! strength' = max(0, strength - decay_rate × multiplier(importance) × hours)
//! ```
//!
//! | importance | multiplier |
//! |------------|-----------:|
//! | trivial    | 3.0        |
//! | normal     | 1.0        |
//! | important  | 0.3        |
//! | critical   | no decay   |
//!
//! Reads push strength back up by [`REINFORCE_STEP`]; a record whose
//! strength drops below [`FORGET_THRESHOLD`] is dropped from the fast tier.

use crate::types::Importance;

/// Default fraction of strength lost per hour.
pub const DEFAULT_DECAY_RATE: f64 = 0.1;

/// Strength regained on each successful read.
pub const REINFORCE_STEP: f64 = 0.1;

/// Records weaker than this are eligible for forgetting.
pub const FORGET_THRESHOLD: f64 = 0.1;

/// Decay speed multiplier for an importance level; `None` means "never decays".
#[must_use]
pub const fn importance_multiplier(importance: Importance) -> Option<f64> {
    match importance {
        Importance::Trivial => Some(3.0),
        Importance::Normal => Some(1.0),
        Importance::Important => Some(0.3),
        Importance::Critical => None,
    }
}

/// Strength after `hours_elapsed` hours of decay, clamped to [0, 1].
///
/// Negative or non-finite elapsed times are treated as zero so a clock
/// step backwards can never strengthen a record.
#[must_use]
pub fn decayed_strength(
    strength: f64,
    decay_rate: f64,
    importance: Importance,
    hours_elapsed: f64,
) -> f64 {
    let Some(multiplier) = importance_multiplier(importance) else {
        return strength;
    };
    let hours = if hours_elapsed.is_finite() { hours_elapsed.max(0.0) } else { 0.0 };
    (strength - decay_rate.max(0.0) * multiplier * hours).clamp(0.0, 1.0)
}

/// Hours until a fresh (strength 1.0) record would fall below the forget threshold.
///
/// Returns `None` for records that never decay.
#[must_use]
pub fn hours_until_forgotten(decay_rate: f64, importance: Importance) -> Option<f64> {
    let multiplier = importance_multiplier(importance)?;
    let per_hour = decay_rate * multiplier;
    if per_hour <= 0.0 {
        return None;
    }
    Some((1.0 - FORGET_THRESHOLD) / per_hour)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hours_is_identity() {
        for imp in Importance::ALL {
            assert_eq!(decayed_strength(0.42, 0.1, imp, 0.0), 0.42);
        }
    }

    #[test]
    fn floors_at_zero() {
        assert_eq!(decayed_strength(0.2, 0.1, Importance::Trivial, 1_000.0), 0.0);
    }

    #[test]
    fn negative_hours_do_not_strengthen() {
        assert_eq!(decayed_strength(0.5, 0.1, Importance::Normal, -5.0), 0.5);
        assert_eq!(decayed_strength(0.5, 0.1, Importance::Normal, f64::NAN), 0.5);
    }

    #[test]
    fn trivial_forgets_fastest() {
        let trivial = hours_until_forgotten(0.1, Importance::Trivial).expect("decays");
        let normal = hours_until_forgotten(0.1, Importance::Normal).expect("decays");
        let important = hours_until_forgotten(0.1, Importance::Important).expect("decays");
        assert!(trivial < normal && normal < important);
        assert!(hours_until_forgotten(0.1, Importance::Critical).is_none());
    }
}
