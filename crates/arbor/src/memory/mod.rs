//! Entry types and scoring
//!
//! Defines the canonical memory unit, its categories, and the score
//! used to promote and evict entries across tiers.

pub mod score;
pub mod types;

pub use score::{PHI, ScoreBreakdown, ScoreConfig, ScoreEngine};
pub use types::{Category, Entry, EntryPatch, Tier};
