//! The memory engine
//!
//! Owns the buffer, categorized store, archive and consolidator, and exposes
//! the operations callers use. Lookups search buffer, then store, then archive.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::consolidation::{
    CancelHandle, ConsolidationPhase, ConsolidationReport, Consolidator, Extractor,
};
use crate::crypto::{KdfParams, MasterSecret};
use crate::error::{ArborError, Result};
use crate::memory::score::ScoreEngine;
use crate::memory::types::{Category, Entry, EntryPatch, Tier};
use crate::storage::archive::Archive;
use crate::storage::buffer::{Buffer, PutOutcome};
use crate::storage::categorized::{CategorizedStore, EntryPredicate, StoreQuery};
use crate::storage::disk::timed;

/// Store writes tried before a still-changing buffered entry is taken out
/// of the buffer for its final write
const MOVE_ATTEMPTS: usize = 3;

/// Input for [`MemoryEngine::store`]
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub category: Category,
    pub content: String,
    pub tags: BTreeSet<String>,
    pub structural_weight: Option<f64>,
    /// Boost the structural weight for explicitly foundational input
    pub foundational: bool,
    pub resonance: f64,
    pub emotional_intensity: f64,
    pub emotional_valence: f64,
    pub parent_id: Option<Uuid>,
}

impl StoreRequest {
    pub fn new(category: Category, content: impl Into<String>) -> Self {
        Self {
            category,
            content: content.into(),
            tags: BTreeSet::new(),
            structural_weight: None,
            foundational: false,
            resonance: 0.0,
            emotional_intensity: 0.0,
            emotional_valence: 0.0,
            parent_id: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn foundational(mut self) -> Self {
        self.foundational = true;
        self
    }

    pub fn with_structural_weight(mut self, weight: f64) -> Self {
        self.structural_weight = Some(weight);
        self
    }

    pub fn with_resonance(mut self, resonance: f64) -> Self {
        self.resonance = resonance;
        self
    }

    pub fn with_emotion(mut self, intensity: f64, valence: f64) -> Self {
        self.emotional_intensity = intensity;
        self.emotional_valence = valence;
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    fn into_entry(self, now: DateTime<Utc>) -> Entry {
        let mut entry = Entry::new_at(self.category, self.content, now)
            .with_tags(self.tags)
            .with_resonance(self.resonance)
            .with_emotion(self.emotional_intensity, self.emotional_valence);
        if let Some(weight) = self.structural_weight {
            entry = entry.with_structural_weight(weight);
        }
        if self.foundational {
            entry = entry.foundational();
        }
        if let Some(parent_id) = self.parent_id {
            entry = entry.with_parent(parent_id);
        }
        entry
    }
}

/// Selection for [`MemoryEngine::retrieve`]
#[derive(Clone)]
pub struct RetrieveQuery {
    predicate: Option<EntryPredicate>,
    categories: Option<BTreeSet<Category>>,
    limit: Option<usize>,
    include_buffer: bool,
    include_archive: bool,
}

impl Default for RetrieveQuery {
    fn default() -> Self {
        Self {
            predicate: None,
            categories: None,
            limit: None,
            include_buffer: true,
            include_archive: false,
        }
    }
}

impl RetrieveQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matching<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Entry) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn in_categories(mut self, categories: impl IntoIterator<Item = Category>) -> Self {
        self.categories = Some(categories.into_iter().collect());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Also scan the buffer (default: true)
    pub fn include_buffer(mut self, include: bool) -> Self {
        self.include_buffer = include;
        self
    }

    /// Also decrypt and scan the archive (default: false). Expensive: every
    /// record costs one key derivation.
    pub fn include_archive(mut self, include: bool) -> Self {
        self.include_archive = include;
        self
    }

    fn admits(&self, entry: &Entry) -> bool {
        self.categories
            .as_ref()
            .is_none_or(|categories| categories.contains(&entry.category))
            && self.predicate.as_ref().is_none_or(|predicate| predicate(entry))
    }

    fn store_query(&self) -> StoreQuery {
        let mut query = StoreQuery::all();
        if let Some(predicate) = &self.predicate {
            query = query.with_predicate(predicate.clone());
        }
        if let Some(categories) = &self.categories {
            query = query.in_categories(categories.iter().copied());
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        query
    }
}

/// An entry together with the tier it was found in
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedEntry {
    pub tier: Tier,
    pub entry: Entry,
}

/// Per-category line of [`PhiStatus`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStatus {
    pub category: Category,
    pub count: usize,
    pub capacity: usize,
    pub retention_days: Option<i64>,
    /// Mean score at the time of the report, `None` when empty
    pub average_score: Option<f64>,
}

/// Snapshot of engine occupancy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhiStatus {
    pub generated_at: DateTime<Utc>,
    pub buffer_count: usize,
    pub buffer_capacity: usize,
    pub store_count: usize,
    pub categories: Vec<CategoryStatus>,
    pub archive_count: usize,
    pub archive_bytes: u64,
    pub consolidation_state: ConsolidationPhase,
    pub last_consolidation: Option<DateTime<Utc>>,
}

/// Optional collaborators for [`MemoryEngine::open_with`]
#[derive(Default)]
pub struct EngineOptions {
    /// Override the configured key derivation cost
    pub kdf: Option<KdfParams>,
    pub extractor: Option<Arc<dyn Extractor>>,
}

/// Entry point to the three-tier memory hierarchy
pub struct MemoryEngine {
    config: Config,
    buffer: Arc<Buffer>,
    store: Arc<CategorizedStore>,
    archive: Arc<Archive>,
    consolidator: Arc<Consolidator>,
}

impl MemoryEngine {
    /// Open the engine with the configured data directory
    pub async fn open(config: Config, secret: MasterSecret) -> Result<Self> {
        Self::open_with(config, secret, EngineOptions::default()).await
    }

    pub async fn open_with(config: Config, secret: MasterSecret, options: EngineOptions) -> Result<Self> {
        config.validate()?;
        let data_dir = config.storage.data_dir.clone();
        info!("Initializing storage at: {}", data_dir.display());
        tokio::fs::create_dir_all(&data_dir).await?;

        let mut archive_options = config.archive_options()?;
        if let Some(kdf) = options.kdf {
            archive_options.kdf = kdf;
        }

        let scorer = ScoreEngine::new(config.scoring);
        let archive = Arc::new(Archive::open(&data_dir, secret, archive_options).await?);
        let store = Arc::new(
            CategorizedStore::open(&data_dir, scorer, config.store_options(), Some(archive.clone()))
                .await?,
        );
        let buffer = Arc::new(Buffer::new(config.buffer_policy()));

        let mut consolidator =
            Consolidator::new(store.clone(), archive.clone(), config.consolidator_config());
        if let Some(extractor) = options.extractor {
            consolidator = consolidator.with_extractor(extractor);
        }

        Ok(Self {
            config,
            buffer,
            store,
            archive,
            consolidator: Arc::new(consolidator),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn store_tier(&self) -> &Arc<CategorizedStore> {
        &self.store
    }

    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    pub fn consolidator(&self) -> &Arc<Consolidator> {
        &self.consolidator
    }

    /// Create an entry in the buffer and return its id
    pub async fn store(&self, request: StoreRequest) -> Result<Uuid> {
        timed("store", self.store_entry(request)).await
    }

    async fn store_entry(&self, request: StoreRequest) -> Result<Uuid> {
        let entry = request.into_entry(Utc::now());
        let id = entry.id;
        let parent_id = entry.parent_id;

        match self.buffer.put(entry) {
            PutOutcome::Inserted { evicted } => self.place_in_store(evicted).await?,
            PutOutcome::Replaced => {}
            PutOutcome::Rejected { entry, evicted } => {
                self.place_in_store(evicted).await?;
                warn!(
                    "Buffer full of protected entries, rejecting entry {}",
                    entry.id
                );
                return Err(ArborError::CapacityExhausted {
                    tier: "buffer".to_string(),
                });
            }
        }

        if let Some(parent_id) = parent_id {
            self.link_child(parent_id, id).await?;
        }
        Ok(id)
    }

    async fn link_child(&self, parent_id: Uuid, child_id: Uuid) -> Result<()> {
        if self.buffer.add_child(parent_id, child_id) {
            return Ok(());
        }
        if self
            .store
            .mutate(parent_id, EntryPatch::add_child(child_id))
            .await?
            .is_none()
        {
            tracing::debug!("Parent {} of entry {} is not live", parent_id, child_id);
        }
        Ok(())
    }

    /// Move entries that already left the buffer into the store. Anything
    /// that cannot be placed goes back into the buffer.
    async fn place_in_store(&self, entries: Vec<Entry>) -> Result<()> {
        let mut pending = entries.into_iter();
        while let Some(entry) = pending.next() {
            if let Err(e) = self.store.store(entry.clone()).await {
                warn!("Could not move entry {} into the store: {}", entry.id, e);
                self.buffer.restore(entry);
                for rest in pending {
                    self.buffer.restore(rest);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Move each entry into the store. Returns how many left the buffer.
    async fn move_to_store(&self, entries: Vec<Entry>) -> Result<usize> {
        let mut moved = 0;
        for entry in entries {
            if self.move_entry(entry).await? {
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Write `entry` into the store, then drop it from the buffer.
    ///
    /// If the buffered copy changed after the write (a concurrent read or
    /// overwrite), the newer copy is written again; store overwrites merge
    /// access statistics, so no read is lost. An entry that keeps changing
    /// is taken out of the buffer first and put back if the final write fails.
    async fn move_entry(&self, entry: Entry) -> Result<bool> {
        let id = entry.id;
        let mut current = entry;

        for _ in 0..MOVE_ATTEMPTS {
            self.store.store(current.clone()).await?;
            if self.buffer.remove_if_unchanged(&current) {
                return Ok(true);
            }
            match self.buffer.peek(id) {
                Some(newer) => current = newer,
                // Removed by a concurrent delete or flush
                None => return Ok(false),
            }
        }

        let Some(last) = self.buffer.remove(id) else {
            return Ok(false);
        };
        if let Err(e) = self.store.store(last.clone()).await {
            warn!("Could not move entry {} into the store: {}", id, e);
            self.buffer.restore(last);
            self.store.delete(id).await?;
            return Err(e);
        }
        Ok(true)
    }

    /// Move every buffered entry into the store
    pub async fn flush(&self) -> Result<usize> {
        let moved = timed("flush", self.move_to_store(self.buffer.snapshot())).await?;
        if moved > 0 {
            info!("Flushed {} entries from buffer to store", moved);
        }
        Ok(moved)
    }

    /// Move buffered entries past the buffer's retention window into the store
    pub async fn flush_expired(&self) -> Result<usize> {
        let moved = self.move_to_store(self.buffer.expired(Utc::now())).await?;
        if moved > 0 {
            info!("Moved {} aged entries from buffer to store", moved);
        }
        Ok(moved)
    }

    /// First hit for `id` in buffer, store, then archive. Buffer and store
    /// hits count as an access.
    pub async fn get(&self, id: Uuid) -> Result<Option<RetrievedEntry>> {
        if let Some(entry) = self.buffer.get(id) {
            return Ok(Some(RetrievedEntry {
                tier: Tier::Buffer,
                entry,
            }));
        }
        if let Some(entry) = self.store.get(id).await? {
            return Ok(Some(RetrievedEntry {
                tier: Tier::Store,
                entry,
            }));
        }
        Ok(self.archive.retrieve(id).await?.map(|entry| RetrievedEntry {
            tier: Tier::Archive,
            entry,
        }))
    }

    /// Resolve a weak reference without counting an access
    pub async fn resolve(&self, id: Uuid) -> Result<Option<RetrievedEntry>> {
        if let Some(entry) = self.buffer.peek(id) {
            return Ok(Some(RetrievedEntry {
                tier: Tier::Buffer,
                entry,
            }));
        }
        if let Some(entry) = self.store.peek(id).await {
            return Ok(Some(RetrievedEntry {
                tier: Tier::Store,
                entry,
            }));
        }
        Ok(self.archive.retrieve(id).await?.map(|entry| RetrievedEntry {
            tier: Tier::Archive,
            entry,
        }))
    }

    /// Resolve the children of `id`, skipping dangling references
    pub async fn children_of(&self, id: Uuid) -> Result<Vec<RetrievedEntry>> {
        let Some(parent) = self.resolve(id).await? else {
            return Ok(Vec::new());
        };

        let mut children = Vec::with_capacity(parent.entry.children_ids.len());
        for child_id in &parent.entry.children_ids {
            if let Some(child) = self.resolve(*child_id).await? {
                children.push(child);
            }
        }
        Ok(children)
    }

    /// Matching entries across tiers, newest first. Returned buffer and store
    /// entries count as accessed.
    pub async fn retrieve(&self, query: RetrieveQuery) -> Result<Vec<RetrievedEntry>> {
        timed("retrieve", self.retrieve_entries(query)).await
    }

    async fn retrieve_entries(&self, query: RetrieveQuery) -> Result<Vec<RetrievedEntry>> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();

        if query.include_buffer {
            for entry in self.buffer.search(|e| query.admits(e)) {
                seen.insert(entry.id);
                found.push(RetrievedEntry {
                    tier: Tier::Buffer,
                    entry,
                });
            }
        }

        for entry in self.store.scan(&query.store_query()).await {
            if seen.insert(entry.id) {
                found.push(RetrievedEntry {
                    tier: Tier::Store,
                    entry,
                });
            }
        }

        if query.include_archive {
            for id in self.archive.ids() {
                if seen.contains(&id) {
                    continue;
                }
                match self.archive.retrieve(id).await {
                    Ok(Some(entry)) if query.admits(&entry) => {
                        seen.insert(id);
                        found.push(RetrievedEntry {
                            tier: Tier::Archive,
                            entry,
                        });
                    }
                    Ok(_) => {}
                    Err(e @ (ArborError::Integrity { .. } | ArborError::Timeout { .. })) => {
                        warn!("Skipping archived entry {} during search: {}", id, e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        found.sort_by(|a, b| {
            b.entry
                .created_at
                .cmp(&a.entry.created_at)
                .then(a.entry.id.cmp(&b.entry.id))
        });
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }

        self.record_accesses(&mut found).await?;
        Ok(found)
    }

    async fn record_accesses(&self, found: &mut [RetrievedEntry]) -> Result<()> {
        let store_ids: Vec<Uuid> = found
            .iter()
            .filter(|r| r.tier == Tier::Store)
            .map(|r| r.entry.id)
            .collect();
        let mut touched: HashMap<Uuid, Entry> = HashMap::new();
        if !store_ids.is_empty() {
            for entry in self.store.retrieve(&StoreQuery::all().with_ids(store_ids)).await? {
                touched.insert(entry.id, entry);
            }
        }

        for result in found.iter_mut() {
            match result.tier {
                Tier::Buffer => {
                    if let Some(entry) = self.buffer.get(result.entry.id) {
                        result.entry = entry;
                    }
                }
                Tier::Store => {
                    if let Some(entry) = touched.remove(&result.entry.id) {
                        result.entry = entry;
                    }
                }
                Tier::Archive => {}
            }
        }
        Ok(())
    }

    /// Remove an entry from the buffer and store. Archived copies are kept.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let from_buffer = self.buffer.remove(id).is_some();
        let from_store = self.store.delete(id).await?.is_some();
        Ok(from_buffer || from_store)
    }

    /// Move aged buffer entries into the store, then run a full consolidation pass
    pub async fn consolidate(&self) -> Result<ConsolidationReport> {
        self.consolidate_with(&CancelHandle::new()).await
    }

    pub async fn consolidate_with(&self, cancel: &CancelHandle) -> Result<ConsolidationReport> {
        timed("consolidate", async {
            self.flush_expired().await?;
            self.consolidator.run_with(cancel).await
        })
        .await
    }

    /// Occupancy of every tier
    pub async fn phi_status(&self) -> Result<PhiStatus> {
        let now = Utc::now();
        let scorer = self.store.scorer();

        let mut categories = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            let entries = self.store.entries_in(category).await;
            let average_score = (!entries.is_empty()).then(|| {
                entries.iter().map(|e| scorer.score(e, now)).sum::<f64>() / entries.len() as f64
            });
            categories.push(CategoryStatus {
                category,
                count: entries.len(),
                capacity: self.store.capacity(category),
                retention_days: self.store.retention(category).map(|r| r.num_days()),
                average_score,
            });
        }

        let last_consolidation = self
            .consolidator
            .last_report()
            .await
            .map(|report| report.finished_at);

        Ok(PhiStatus {
            generated_at: now,
            buffer_count: self.buffer.len(),
            buffer_capacity: self.buffer.capacity(),
            store_count: categories.iter().map(|c| c.count).sum(),
            categories,
            archive_count: self.archive.len(),
            archive_bytes: self.archive.size_bytes(),
            consolidation_state: self.consolidator.state(),
            last_consolidation,
        })
    }

    /// Drain the buffer into the store so nothing is lost on exit
    pub async fn shutdown(&self) -> Result<usize> {
        let drained = self.buffer.flush();
        let count = drained.len();
        self.place_in_store(drained).await?;
        info!("Shutdown flushed {} buffered entries", count);
        Ok(count)
    }
}
