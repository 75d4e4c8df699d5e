//! Score calculation for promotion and eviction
//!
//! The score combines structural weight, resonance, emotional signal,
//! access frequency and age into a deterministic value in [0, 1].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ArborError, Result};
use crate::memory::types::{Category, Entry};

/// The golden ratio, used as a normalizing divisor for the resonance term
pub const PHI: f64 = 1.618_033_988_749_895;

/// Slack for threshold comparisons so a perfect score survives float summation
const THRESHOLD_EPSILON: f64 = 1e-9;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Configuration for score calculation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreConfig {
    /// Weight of the structural/resonance term (default: 0.40)
    #[serde(default = "default_phi_weight")]
    pub phi_weight: f64,
    /// Weight of the emotional term (default: 0.30)
    #[serde(default = "default_emotional_weight")]
    pub emotional_weight: f64,
    /// Weight of the access term (default: 0.20)
    #[serde(default = "default_access_weight")]
    pub access_weight: f64,
    /// Weight of the age term (default: 0.10)
    #[serde(default = "default_age_weight")]
    pub age_weight: f64,
    /// Access count at which the access term saturates (default: 10)
    #[serde(default = "default_access_saturation")]
    pub access_saturation: u32,
    /// Age in days at which the age term saturates (default: 30)
    #[serde(default = "default_age_saturation_days")]
    pub age_saturation_days: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            phi_weight: default_phi_weight(),
            emotional_weight: default_emotional_weight(),
            access_weight: default_access_weight(),
            age_weight: default_age_weight(),
            access_saturation: default_access_saturation(),
            age_saturation_days: default_age_saturation_days(),
        }
    }
}

fn default_phi_weight() -> f64 {
    0.40
}

fn default_emotional_weight() -> f64 {
    0.30
}

fn default_access_weight() -> f64 {
    0.20
}

fn default_age_weight() -> f64 {
    0.10
}

fn default_access_saturation() -> u32 {
    10
}

fn default_age_saturation_days() -> f64 {
    30.0
}

impl ScoreConfig {
    /// Reject weights that do not sum to 1.0 or saturation points that are not positive
    pub fn validate(&self) -> Result<()> {
        let weights = [
            self.phi_weight,
            self.emotional_weight,
            self.access_weight,
            self.age_weight,
        ];
        if weights.iter().any(|w| !(0.0..=1.0).contains(w)) {
            return Err(ArborError::Config(
                "score weights must each be within [0, 1]".to_string(),
            ));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ArborError::Config(format!(
                "score weights must sum to 1.0, got {sum}"
            )));
        }
        if self.access_saturation == 0 || self.age_saturation_days <= 0.0 {
            return Err(ArborError::Config(
                "score saturation points must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Breakdown of a score into its weighted terms
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub phi_term: f64,
    pub emotional_term: f64,
    pub access_term: f64,
    pub age_term: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        (self.phi_term + self.emotional_term + self.access_term + self.age_term).clamp(0.0, 1.0)
    }
}

/// Computes importance scores for entries.
///
/// Cheap to copy and free of side effects, so it can be handed to worker
/// tasks during consolidation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreEngine {
    config: ScoreConfig,
}

impl ScoreEngine {
    pub fn new(config: ScoreConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoreConfig {
        &self.config
    }

    /// Score an entry at `now`
    pub fn score(&self, entry: &Entry, now: DateTime<Utc>) -> f64 {
        self.breakdown(entry, now).total()
    }

    /// Score an entry and return the individual terms
    pub fn breakdown(&self, entry: &Entry, now: DateTime<Utc>) -> ScoreBreakdown {
        let config = &self.config;

        let phi = unit(entry.structural_weight * entry.resonance / PHI);
        let emotional = unit(entry.emotional_intensity * (0.5 + entry.emotional_valence / 2.0));
        let access = unit(entry.access_count as f64 / config.access_saturation as f64);
        let age_days = entry.age(now).num_seconds() as f64 / SECONDS_PER_DAY;
        let age = unit(age_days / config.age_saturation_days);

        ScoreBreakdown {
            phi_term: phi * config.phi_weight,
            emotional_term: emotional * config.emotional_weight,
            access_term: access * config.access_weight,
            age_term: age * config.age_weight,
        }
    }

    /// Highest category whose thresholds `score` clears, walking up from the
    /// entry's current category. `None` if the entry stays where it is.
    pub fn promotion_target(&self, current: Category, score: f64) -> Option<Category> {
        let mut target = current;
        while let (Some(threshold), Some(next)) = (target.promotion_threshold(), target.next()) {
            if score + THRESHOLD_EPSILON < threshold {
                break;
            }
            target = next;
        }
        (target != current).then_some(target)
    }
}

fn unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn create_test_entry(resonance: f64, access_count: u32, age_days: i64) -> (Entry, DateTime<Utc>) {
        let now = Utc::now();
        let mut entry = Entry::new_at(Category::Seed, "Test content", now - Duration::days(age_days))
            .with_resonance(resonance);
        entry.access_count = access_count;
        (entry, now)
    }

    #[test]
    fn test_score_config_default() {
        let config = ScoreConfig::default();
        assert_eq!(config.phi_weight, 0.40);
        assert_eq!(config.emotional_weight, 0.30);
        assert_eq!(config.access_weight, 0.20);
        assert_eq!(config.age_weight, 0.10);
        assert_eq!(config.access_saturation, 10);
        assert_eq!(config.age_saturation_days, 30.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_score_config_rejects_bad_weights() {
        let config = ScoreConfig {
            phi_weight: 0.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ArborError::Config(_))));

        let config = ScoreConfig {
            access_saturation: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fresh_seed_scores_resonance_only() {
        let engine = ScoreEngine::default();
        let (entry, now) = create_test_entry(0.8, 0, 0);

        let score = engine.score(&entry, now);
        let expected = 0.8 / PHI * 0.40;
        assert!((score - expected).abs() < 1e-9, "score={score}");
        assert!((score - 0.198).abs() < 1e-3);
        assert_eq!(engine.promotion_target(Category::Seed, score), None);
    }

    #[test]
    fn test_accessed_aged_seed_crosses_first_threshold() {
        let engine = ScoreEngine::default();
        let (entry, now) = create_test_entry(0.8, 10, 30);

        let breakdown = engine.breakdown(&entry, now);
        assert!((breakdown.access_term - 0.20).abs() < 1e-9);
        assert!((breakdown.age_term - 0.10).abs() < 1e-9);

        let score = breakdown.total();
        assert!((score - 0.498).abs() < 1e-3, "score={score}");
        assert_eq!(
            engine.promotion_target(Category::Seed, score),
            Some(Category::Leaf)
        );
    }

    #[test]
    fn test_terms_saturate() {
        let engine = ScoreEngine::default();
        let (mut entry, now) = create_test_entry(1.0, 500, 400);
        entry.structural_weight = 10.0;
        entry.emotional_intensity = 1.0;
        entry.emotional_valence = 1.0;

        let score = engine.score(&entry, now);
        assert!((score - 1.0).abs() < 1e-9);
        assert_eq!(
            engine.promotion_target(Category::Seed, score),
            Some(Category::Root)
        );
        assert_eq!(engine.promotion_target(Category::Root, score), None);
    }

    #[test]
    fn test_negative_valence_cancels_emotion() {
        let engine = ScoreEngine::default();
        let (mut entry, now) = create_test_entry(0.0, 0, 0);
        entry.emotional_intensity = 1.0;
        entry.emotional_valence = -1.0;
        assert_eq!(engine.breakdown(&entry, now).emotional_term, 0.0);

        entry.emotional_valence = 0.0;
        assert!((engine.breakdown(&entry, now).emotional_term - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_future_created_at_counts_as_zero_age() {
        let engine = ScoreEngine::default();
        let now = Utc::now();
        let entry = Entry::new_at(Category::Seed, "x", now + Duration::days(3));
        assert_eq!(engine.breakdown(&entry, now).age_term, 0.0);
    }

    #[test]
    fn test_score_is_deterministic() {
        let engine = ScoreEngine::default();
        let (entry, now) = create_test_entry(0.6, 3, 5);
        assert_eq!(engine.score(&entry, now), engine.score(&entry, now));
    }

    #[test]
    fn test_promotion_target_stops_at_first_unmet_threshold() {
        let engine = ScoreEngine::default();
        assert_eq!(
            engine.promotion_target(Category::Seed, 0.7),
            Some(Category::Branch)
        );
        assert_eq!(engine.promotion_target(Category::Leaf, 0.5), None);
        assert_eq!(
            engine.promotion_target(Category::Branch, 0.999_999_999_9),
            Some(Category::Root)
        );
    }
}
