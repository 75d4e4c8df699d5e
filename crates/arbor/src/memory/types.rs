//! Entry types for the Arbor system
//!
//! Defines the canonical memory unit and the four ordered categories
//! that partition the mid-term store.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::memory::score::PHI;

/// A single memory unit stored in the Arbor system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique identifier, stable across tier moves
    pub id: Uuid,
    /// Rank within the categorized store
    pub category: Category,
    /// The payload, opaque to the engine
    pub content: String,
    /// Free-form labels for caller-side matching
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// When this entry was created
    pub created_at: DateTime<Utc>,
    /// When the content or tags last changed
    pub updated_at: DateTime<Utc>,
    /// When this entry was last returned by a retrieval
    pub last_accessed_at: DateTime<Utc>,
    /// Source importance, 1.0 unless the input was flagged foundational
    pub structural_weight: f64,
    /// Relatedness to existing high-value entries, in [0, 1]
    pub resonance: f64,
    /// Emotional intensity, in [0, 1]
    pub emotional_intensity: f64,
    /// Emotional valence, in [-1, 1]
    pub emotional_valence: f64,
    /// Number of successful retrievals
    pub access_count: u32,
    /// Weak back-reference to a parent entry
    pub parent_id: Option<Uuid>,
    /// Weak references to child entries
    #[serde(default)]
    pub children_ids: BTreeSet<Uuid>,
    /// Weak references to related entries
    #[serde(default)]
    pub related_ids: BTreeSet<Uuid>,
    /// `updated_at` of the version last copied into the archive
    #[serde(default)]
    pub archived_version: Option<DateTime<Utc>>,
    /// Summary produced by an extractor during consolidation
    #[serde(default)]
    pub summary: Option<String>,
}

impl Entry {
    /// Create a new entry with default scoring hints
    pub fn new(category: Category, content: impl Into<String>) -> Self {
        Self::new_at(category, content, Utc::now())
    }

    /// Create a new entry with an explicit creation time
    pub fn new_at(category: Category, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            content: content.into(),
            tags: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            structural_weight: 1.0,
            resonance: 0.0,
            emotional_intensity: 0.0,
            emotional_valence: 0.0,
            access_count: 0,
            parent_id: None,
            children_ids: BTreeSet::new(),
            related_ids: BTreeSet::new(),
            archived_version: None,
            summary: None,
        }
    }

    pub fn with_structural_weight(mut self, weight: f64) -> Self {
        self.structural_weight = weight.max(0.0);
        self
    }

    /// Boost the structural weight for explicitly foundational input
    pub fn foundational(mut self) -> Self {
        self.structural_weight = PHI;
        self
    }

    pub fn with_resonance(mut self, resonance: f64) -> Self {
        self.resonance = clamp_unit(resonance);
        self
    }

    pub fn with_emotion(mut self, intensity: f64, valence: f64) -> Self {
        self.emotional_intensity = clamp_unit(intensity);
        self.emotional_valence = clamp_signed(valence);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Mark this entry as accessed, updating access count and timestamp
    pub fn mark_accessed(&mut self, now: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed_at = now;
    }

    /// Age of the entry at `now`, never negative
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).max(Duration::zero())
    }

    /// Whether the current content still needs a copy in the archive
    pub fn needs_archiving(&self) -> bool {
        self.archived_version
            .is_none_or(|version| version < self.updated_at)
    }

    /// Take over the caller-writable fields of `incoming`, keeping identity.
    /// Used when an existing id is stored again.
    ///
    /// Access statistics merge (highest count, latest access) so a copy that
    /// was read elsewhere never loses those reads. `updated_at` moves only
    /// when content or tags actually change.
    pub fn overwrite_from(&mut self, incoming: Entry, now: DateTime<Utc>) {
        let content_changed = self.content != incoming.content || self.tags != incoming.tags;
        self.access_count = self.access_count.max(incoming.access_count);
        self.last_accessed_at = self.last_accessed_at.max(incoming.last_accessed_at);
        self.content = incoming.content;
        self.tags = incoming.tags;
        self.structural_weight = incoming.structural_weight;
        self.resonance = clamp_unit(incoming.resonance);
        self.emotional_intensity = clamp_unit(incoming.emotional_intensity);
        self.emotional_valence = clamp_signed(incoming.emotional_valence);
        if incoming.parent_id.is_some() {
            self.parent_id = incoming.parent_id;
        }
        self.children_ids.extend(incoming.children_ids);
        self.related_ids.extend(incoming.related_ids);
        self.updated_at = if content_changed {
            now.max(self.updated_at)
        } else {
            self.updated_at.max(incoming.updated_at)
        };
    }
}

/// In-place update applied to a stored entry without moving it.
///
/// Only `content` and `tags` count as content changes and bump `updated_at`.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub content: Option<String>,
    pub tags: Option<BTreeSet<String>>,
    pub structural_weight: Option<f64>,
    pub resonance: Option<f64>,
    pub emotional_intensity: Option<f64>,
    pub emotional_valence: Option<f64>,
    /// Number of accesses to add
    pub record_accesses: u32,
    /// Mark the given version as archived
    pub archived_version: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub add_children: Vec<Uuid>,
    pub add_related: Vec<Uuid>,
}

impl EntryPatch {
    pub fn record_access() -> Self {
        Self {
            record_accesses: 1,
            ..Default::default()
        }
    }

    pub fn archived(version: DateTime<Utc>) -> Self {
        Self {
            archived_version: Some(version),
            ..Default::default()
        }
    }

    pub fn summary(summary: String) -> Self {
        Self {
            summary: Some(summary),
            ..Default::default()
        }
    }

    pub fn add_child(child: Uuid) -> Self {
        Self {
            add_children: vec![child],
            ..Default::default()
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// Apply the patch to `entry`
    pub fn apply(self, entry: &mut Entry, now: DateTime<Utc>) {
        let mut content_changed = false;
        if let Some(content) = self.content {
            entry.content = content;
            content_changed = true;
        }
        if let Some(tags) = self.tags {
            entry.tags = tags;
            content_changed = true;
        }
        if let Some(weight) = self.structural_weight {
            entry.structural_weight = weight.max(0.0);
        }
        if let Some(resonance) = self.resonance {
            entry.resonance = clamp_unit(resonance);
        }
        if let Some(intensity) = self.emotional_intensity {
            entry.emotional_intensity = clamp_unit(intensity);
        }
        if let Some(valence) = self.emotional_valence {
            entry.emotional_valence = clamp_signed(valence);
        }
        if self.record_accesses > 0 {
            entry.access_count = entry.access_count.saturating_add(self.record_accesses);
            entry.last_accessed_at = now;
        }
        if let Some(version) = self.archived_version {
            entry.archived_version = Some(version);
        }
        if let Some(summary) = self.summary {
            entry.summary = Some(summary);
        }
        entry.children_ids.extend(self.add_children);
        entry.related_ids.extend(self.add_related);
        if content_changed {
            entry.updated_at = now.max(entry.updated_at);
        }
    }
}

/// Ordered ranks within the categorized store, lowest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Potential; the lowest rank
    Seed,
    /// Interaction
    Leaf,
    /// Development
    Branch,
    /// Foundational; never promoted further and never expires
    Root,
}

impl Category {
    /// All categories in rank order
    pub const ALL: [Category; 4] = [
        Category::Seed,
        Category::Leaf,
        Category::Branch,
        Category::Root,
    ];

    pub fn rank(self) -> usize {
        match self {
            Category::Seed => 0,
            Category::Leaf => 1,
            Category::Branch => 2,
            Category::Root => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Seed => "seed",
            Category::Leaf => "leaf",
            Category::Branch => "branch",
            Category::Root => "root",
        }
    }

    /// The next rank up, `None` for root
    pub fn next(self) -> Option<Category> {
        match self {
            Category::Seed => Some(Category::Leaf),
            Category::Leaf => Some(Category::Branch),
            Category::Branch => Some(Category::Root),
            Category::Root => None,
        }
    }

    /// Minimum score needed to leave this category, `None` for root
    pub fn promotion_threshold(self) -> Option<f64> {
        match self {
            Category::Seed => Some(PHI.powi(-2)),
            Category::Leaf => Some(PHI.powi(-1)),
            Category::Branch => Some(1.0),
            Category::Root => None,
        }
    }

    pub fn default_capacity(self) -> usize {
        match self {
            Category::Seed => 1500,
            Category::Leaf => 5000,
            Category::Branch => 2500,
            Category::Root => 1000,
        }
    }

    /// Default non-accessed expiry window, `None` means never
    pub fn default_retention(self) -> Option<Duration> {
        match self {
            Category::Seed => Some(Duration::days(7)),
            Category::Leaf => Some(Duration::days(30)),
            Category::Branch => Some(Duration::days(90)),
            Category::Root => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "seed" => Ok(Category::Seed),
            "leaf" => Ok(Category::Leaf),
            "branch" => Ok(Category::Branch),
            "root" => Ok(Category::Root),
            other => Err(format!(
                "Unknown category: {other}. Use seed, leaf, branch, or root."
            )),
        }
    }
}

/// Which tier currently holds an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Short-retention hot buffer
    Buffer,
    /// Categorized mid-term store
    Store,
    /// Encrypted long-term archive
    Archive,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Buffer => f.write_str("buffer"),
            Tier::Store => f.write_str("store"),
            Tier::Archive => f.write_str("archive"),
        }
    }
}

pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

pub(crate) fn clamp_signed(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(-1.0, 1.0) }
}
