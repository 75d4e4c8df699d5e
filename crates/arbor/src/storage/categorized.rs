//! The categorized mid-term store
//!
//! Entries live in exactly one of four categories. Each category has its own
//! lock, capacity and retention window, and is mirrored on disk as
//! `<data_dir>/store/<category>/<id>.json`.
//!
//! Operations that touch two categories take the locks in rank order, lowest
//! first. Moves write the destination record before removing the source.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as IndexSlot;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ArborError, Result};
use crate::memory::score::ScoreEngine;
use crate::memory::types::{Category, Entry, EntryPatch};
use crate::storage::archive::Archive;
use crate::storage::disk;

const RECORD_EXTENSION: &str = "json";

/// Caller-supplied filter over entries
pub type EntryPredicate = Arc<dyn Fn(&Entry) -> bool + Send + Sync>;

/// Capacity and retention for one category
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CategoryPolicy {
    pub capacity: usize,
    /// Window after which a never-accessed entry expires; `None` means never
    pub retention: Option<Duration>,
}

impl CategoryPolicy {
    pub fn defaults(category: Category) -> Self {
        Self {
            capacity: category.default_capacity(),
            retention: category.default_retention(),
        }
    }
}

/// Tunables for the store
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Indexed by [`Category::rank`]
    pub policies: [CategoryPolicy; 4],
    pub io_backoff: StdDuration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            policies: Category::ALL.map(CategoryPolicy::defaults),
            io_backoff: StdDuration::from_millis(50),
        }
    }
}

/// Selection over the store. Unset fields match everything.
#[derive(Clone, Default)]
pub struct StoreQuery {
    predicate: Option<EntryPredicate>,
    categories: Option<BTreeSet<Category>>,
    ids: Option<HashSet<Uuid>>,
    max_depth: Option<usize>,
    limit: Option<usize>,
}

impl StoreQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matching<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Entry) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_predicate(mut self, predicate: EntryPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn in_categories(mut self, categories: impl IntoIterator<Item = Category>) -> Self {
        self.categories = Some(categories.into_iter().collect());
        self
    }

    pub fn with_ids(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    /// Only match entries with at most `depth` ancestors in the store
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn includes(&self, category: Category) -> bool {
        self.categories
            .as_ref()
            .is_none_or(|categories| categories.contains(&category))
    }
}

impl fmt::Debug for StoreQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreQuery")
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .field("categories", &self.categories)
            .field("ids", &self.ids)
            .field("max_depth", &self.max_depth)
            .field("limit", &self.limit)
            .finish()
    }
}

/// Result of [`CategorizedStore::store`]
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOutcome {
    pub id: Uuid,
    /// An entry with this id already existed and was overwritten
    pub replaced: bool,
    /// Entries evicted to make room
    pub evicted: Vec<Uuid>,
}

/// Result of [`CategorizedStore::promote`]
#[derive(Debug, Clone, PartialEq)]
pub struct PromoteOutcome {
    pub id: Uuid,
    pub from: Category,
    pub to: Category,
    /// Entries evicted from the target category to make room
    pub evicted: Vec<Uuid>,
}

/// Where an id currently lives, plus its parent link for depth queries
#[derive(Debug, Clone, Copy)]
struct Location {
    category: Category,
    parent_id: Option<Uuid>,
}

impl Location {
    fn of(entry: &Entry) -> Self {
        Self {
            category: entry.category,
            parent_id: entry.parent_id,
        }
    }
}

struct Shard {
    category: Category,
    entries: HashMap<Uuid, Entry>,
}

/// Four-category persistent store
pub struct CategorizedStore {
    dir: PathBuf,
    shards: [RwLock<Shard>; 4],
    index: DashMap<Uuid, Location>,
    scorer: ScoreEngine,
    options: StoreOptions,
    archive: Option<Arc<Archive>>,
    /// Lower-category records left behind by promotions whose unlink failed
    stale_records: DashMap<Uuid, BTreeSet<Category>>,
}

impl CategorizedStore {
    /// Open the store under `data_dir`, loading every persisted entry.
    ///
    /// When the same id is found in two categories (an interrupted move), the
    /// higher-ranked copy wins and the other record is removed.
    pub async fn open(
        data_dir: &Path,
        scorer: ScoreEngine,
        options: StoreOptions,
        archive: Option<Arc<Archive>>,
    ) -> Result<Self> {
        let dir = data_dir.join("store");
        let index: DashMap<Uuid, Location> = DashMap::new();
        let mut loaded: [HashMap<Uuid, Entry>; 4] = Default::default();

        for category in Category::ALL {
            let category_dir = dir.join(category.as_str());
            tokio::fs::create_dir_all(&category_dir).await?;

            for path in disk::list_records(&category_dir, RECORD_EXTENSION).await? {
                let bytes = tokio::fs::read(&path).await?;
                let mut entry: Entry = match serde_json::from_slice(&bytes) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Skipping unreadable record {}: {}", path.display(), e);
                        continue;
                    }
                };
                entry.category = category;

                if let Some(previous) = index.get(&entry.id).map(|loc| loc.category) {
                    warn!(
                        "Entry {} found in both {} and {}, keeping {}",
                        entry.id, previous, category, category
                    );
                    loaded[previous.rank()].remove(&entry.id);
                    let stale = dir
                        .join(previous.as_str())
                        .join(format!("{}.{RECORD_EXTENSION}", entry.id));
                    disk::remove_if_exists(&stale).await?;
                }

                index.insert(entry.id, Location::of(&entry));
                loaded[category.rank()].insert(entry.id, entry);
            }
        }

        let shards = Category::ALL.map(|category| {
            RwLock::new(Shard {
                category,
                entries: std::mem::take(&mut loaded[category.rank()]),
            })
        });

        info!(
            "Opened categorized store at {} with {} entries",
            dir.display(),
            index.len()
        );

        Ok(Self {
            dir,
            shards,
            index,
            scorer,
            options,
            archive,
            stale_records: DashMap::new(),
        })
    }

    fn shard(&self, category: Category) -> &RwLock<Shard> {
        &self.shards[category.rank()]
    }

    fn record_path(&self, category: Category, id: Uuid) -> PathBuf {
        self.dir
            .join(category.as_str())
            .join(format!("{id}.{RECORD_EXTENSION}"))
    }

    pub fn policy(&self, category: Category) -> CategoryPolicy {
        self.options.policies[category.rank()]
    }

    pub fn capacity(&self, category: Category) -> usize {
        self.policy(category).capacity
    }

    pub fn retention(&self, category: Category) -> Option<Duration> {
        self.policy(category).retention
    }

    pub fn scorer(&self) -> &ScoreEngine {
        &self.scorer
    }

    async fn persist(&self, entry: &Entry) -> Result<()> {
        let path = self.record_path(entry.category, entry.id);
        let bytes = serde_json::to_vec_pretty(entry)?;
        disk::with_retry("store write", self.options.io_backoff, || {
            disk::write_atomic(&path, &bytes)
        })
        .await
    }

    async fn unlink(&self, category: Category, id: Uuid) -> Result<()> {
        let path = self.record_path(category, id);
        disk::with_retry("store delete", self.options.io_backoff, || {
            disk::remove_if_exists(&path)
        })
        .await?;
        Ok(())
    }

    /// Remove records of `id` that a promotion failed to unlink. Must run
    /// before the live record goes, or a reopen would resurrect the stale copy.
    async fn sweep_stale(&self, id: Uuid) -> Result<()> {
        let Some((_, categories)) = self.stale_records.remove(&id) else {
            return Ok(());
        };

        let mut remaining = categories.into_iter();
        while let Some(category) = remaining.next() {
            if let Err(e) = self.unlink(category, id).await {
                let mut left: BTreeSet<Category> = remaining.collect();
                left.insert(category);
                self.stale_records.insert(id, left);
                return Err(e);
            }
            debug!("Removed stale {} record of entry {}", category, id);
        }
        Ok(())
    }

    /// Number of ids with a stale lower-category record still on disk
    pub fn stale_record_count(&self) -> usize {
        self.stale_records.len()
    }

    /// Lowest-scoring entry, oldest first on ties
    fn choose_victim(&self, shard: &Shard, now: DateTime<Utc>) -> Option<Uuid> {
        shard
            .entries
            .values()
            .map(|e| (self.scorer.score(e, now), e.created_at, e.id))
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
            .map(|(_, _, id)| id)
    }

    /// Evict until the shard has a free slot
    async fn make_room(&self, shard: &mut Shard, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let capacity = self.policy(shard.category).capacity;
        let mut evicted = Vec::new();

        while shard.entries.len() >= capacity {
            let Some(victim) = self.choose_victim(shard, now) else {
                return Err(ArborError::CapacityExhausted {
                    tier: format!("{} category", shard.category),
                });
            };
            self.evict(shard, victim).await?;
            evicted.push(victim);
        }

        Ok(evicted)
    }

    async fn evict(&self, shard: &mut Shard, id: Uuid) -> Result<()> {
        let Some(victim) = shard.entries.get(&id) else {
            return Ok(());
        };

        if victim.needs_archiving() {
            match &self.archive {
                Some(archive) => {
                    archive.archive(victim).await?;
                }
                None => warn!(
                    "Evicting entry {} from {} with no archive attached",
                    id, shard.category
                ),
            }
        }

        self.sweep_stale(id).await?;
        self.unlink(shard.category, id).await?;
        shard.entries.remove(&id);
        let category = shard.category;
        self.index.remove_if(&id, |_, loc| loc.category == category);
        info!("Evicted entry {} from {} at capacity", id, category);
        Ok(())
    }

    /// Write lock on the shard currently holding `id`
    async fn locate_mut(&self, id: Uuid) -> Option<RwLockWriteGuard<'_, Shard>> {
        loop {
            let category = self.index.get(&id).map(|loc| loc.category)?;
            let shard = self.shard(category).write().await;
            if shard.entries.contains_key(&id) {
                return Some(shard);
            }
            drop(shard);
            // Moved while we waited for the lock: follow it
            if self.index.get(&id).map(|loc| loc.category) == Some(category) {
                return None;
            }
        }
    }

    /// Insert or overwrite `entry` in `entry.category`.
    ///
    /// Storing an id that lives in a different category is a
    /// [`ArborError::Conflict`]; use [`promote`](Self::promote) to move it.
    pub async fn store(&self, entry: Entry) -> Result<StoreOutcome> {
        let now = Utc::now();
        let id = entry.id;
        let mut shard = self.shard(entry.category).write().await;

        if let Some(existing) = shard.entries.get(&id) {
            let mut updated = existing.clone();
            updated.overwrite_from(entry, now);
            self.persist(&updated).await?;
            self.index.insert(id, Location::of(&updated));
            shard.entries.insert(id, updated);
            debug!("Overwrote entry {}", id);
            return Ok(StoreOutcome {
                id,
                replaced: true,
                evicted: Vec::new(),
            });
        }

        match self.index.entry(id) {
            IndexSlot::Occupied(slot) => {
                return Err(ArborError::Conflict(format!(
                    "entry {id} is already stored in the {} category",
                    slot.get().category
                )));
            }
            IndexSlot::Vacant(slot) => {
                slot.insert(Location::of(&entry));
            }
        }

        let evicted = match self.make_room(&mut shard, now).await {
            Ok(evicted) => evicted,
            Err(e) => {
                self.index.remove(&id);
                return Err(e);
            }
        };
        if let Err(e) = self.persist(&entry).await {
            self.index.remove(&id);
            return Err(e);
        }

        debug!("Stored entry {} in {}", id, entry.category);
        shard.entries.insert(id, entry);
        Ok(StoreOutcome {
            id,
            replaced: false,
            evicted,
        })
    }

    /// Look up an entry and count it as accessed
    pub async fn get(&self, id: Uuid) -> Result<Option<Entry>> {
        self.mutate(id, EntryPatch::record_access()).await
    }

    /// Look up an entry without touching its access statistics
    pub async fn peek(&self, id: Uuid) -> Option<Entry> {
        loop {
            let category = self.index.get(&id).map(|loc| loc.category)?;
            let shard = self.shard(category).read().await;
            if let Some(entry) = shard.entries.get(&id) {
                return Some(entry.clone());
            }
            drop(shard);
            if self.index.get(&id).map(|loc| loc.category) == Some(category) {
                return None;
            }
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.index.contains_key(&id)
    }

    pub fn category_of(&self, id: Uuid) -> Option<Category> {
        self.index.get(&id).map(|loc| loc.category)
    }

    /// Number of ancestors of `entry` present in the store, stopping early
    /// once `bound` is exceeded
    fn depth_of(&self, entry: &Entry, bound: usize) -> usize {
        let mut depth = 0;
        let mut seen = HashSet::from([entry.id]);
        let mut cursor = entry.parent_id;

        while let Some(parent) = cursor {
            if depth > bound || !seen.insert(parent) {
                break;
            }
            match self.index.get(&parent) {
                Some(loc) => {
                    depth += 1;
                    cursor = loc.parent_id;
                }
                None => break,
            }
        }
        depth
    }

    fn matches(&self, query: &StoreQuery, entry: &Entry) -> bool {
        if let Some(ids) = &query.ids {
            if !ids.contains(&entry.id) {
                return false;
            }
        }
        if let Some(max_depth) = query.max_depth {
            if self.depth_of(entry, max_depth) > max_depth {
                return false;
            }
        }
        query.predicate.as_ref().is_none_or(|predicate| predicate(entry))
    }

    /// Matching entries, newest first, without counting an access
    pub async fn scan(&self, query: &StoreQuery) -> Vec<Entry> {
        let mut found = Vec::new();
        for category in Category::ALL {
            if !query.includes(category) {
                continue;
            }
            let shard = self.shard(category).read().await;
            found.extend(
                shard
                    .entries
                    .values()
                    .filter(|entry| self.matches(query, entry))
                    .cloned(),
            );
        }

        sort_newest_first(&mut found);
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        found
    }

    /// Matching entries, newest first. Each returned entry has its access
    /// count incremented and persisted.
    pub async fn retrieve(&self, query: &StoreQuery) -> Result<Vec<Entry>> {
        let found = self.scan(query).await;
        let now = Utc::now();
        let mut results = Vec::with_capacity(found.len());
        let mut moved = Vec::new();

        for category in Category::ALL {
            let ids: Vec<Uuid> = found
                .iter()
                .filter(|e| e.category == category)
                .map(|e| e.id)
                .collect();
            if ids.is_empty() {
                continue;
            }

            let mut shard = self.shard(category).write().await;
            for id in ids {
                let Some(current) = shard.entries.get(&id) else {
                    moved.push(id);
                    continue;
                };
                let mut updated = current.clone();
                updated.mark_accessed(now);
                self.persist(&updated).await?;
                shard.entries.insert(id, updated.clone());
                results.push(updated);
            }
        }

        for id in moved {
            if let Some(entry) = self.get(id).await? {
                results.push(entry);
            }
        }

        sort_newest_first(&mut results);
        Ok(results)
    }

    /// Apply `patch` in place. `None` if the id is not stored.
    pub async fn mutate(&self, id: Uuid, patch: EntryPatch) -> Result<Option<Entry>> {
        let now = Utc::now();
        let Some(mut shard) = self.locate_mut(id).await else {
            return Ok(None);
        };
        let Some(current) = shard.entries.get(&id) else {
            return Ok(None);
        };

        let mut updated = current.clone();
        patch.apply(&mut updated, now);
        self.persist(&updated).await?;
        self.index.insert(id, Location::of(&updated));
        shard.entries.insert(id, updated.clone());
        Ok(Some(updated))
    }

    /// Remove an entry, returning it if it was stored
    pub async fn delete(&self, id: Uuid) -> Result<Option<Entry>> {
        let Some(mut shard) = self.locate_mut(id).await else {
            return Ok(None);
        };
        let category = shard.category;

        self.sweep_stale(id).await?;
        self.unlink(category, id).await?;
        let removed = shard.entries.remove(&id);
        self.index.remove_if(&id, |_, loc| loc.category == category);
        debug!("Deleted entry {} from {}", id, category);
        Ok(removed)
    }

    /// Move an entry to a strictly higher category.
    ///
    /// `target` need not be the next category up: consolidation passes the
    /// highest category the score qualifies for, so one call may move a seed
    /// straight to branch or root. The move is still a single step on disk.
    ///
    /// Returns `None` if the id is not stored. The target may evict its
    /// lowest-scoring entry to make room.
    pub async fn promote(&self, id: Uuid, target: Category) -> Result<Option<PromoteOutcome>> {
        let now = Utc::now();

        loop {
            let Some(source) = self.category_of(id) else {
                return Ok(None);
            };
            if target <= source {
                return Err(ArborError::InvalidPromotion(format!(
                    "cannot move entry {id} from {source} to {target}"
                )));
            }

            let mut lower = self.shard(source).write().await;
            let mut upper = self.shard(target).write().await;

            let Some(entry) = lower.entries.get(&id).cloned() else {
                drop(upper);
                drop(lower);
                if self.category_of(id) == Some(source) {
                    return Ok(None);
                }
                continue;
            };

            let evicted = self.make_room(&mut upper, now).await?;

            let mut moved = entry;
            moved.category = target;
            self.persist(&moved).await?;
            self.index.insert(id, Location::of(&moved));
            upper.entries.insert(id, moved);
            lower.entries.remove(&id);

            if let Err(e) = self.unlink(source, id).await {
                // Loses to the higher category on open; swept on delete or eviction
                warn!("Promoted entry {} but left its {} record behind: {}", id, source, e);
                self.stale_records.entry(id).or_default().insert(source);
            }

            debug!("Promoted entry {} from {} to {}", id, source, target);
            return Ok(Some(PromoteOutcome {
                id,
                from: source,
                to: target,
                evicted,
            }));
        }
    }

    /// Copy of every stored entry
    pub async fn snapshot(&self) -> Vec<Entry> {
        let mut entries = Vec::with_capacity(self.index.len());
        for category in Category::ALL {
            let shard = self.shard(category).read().await;
            entries.extend(shard.entries.values().cloned());
        }
        entries
    }

    /// Copy of the entries in one category
    pub async fn entries_in(&self, category: Category) -> Vec<Entry> {
        let shard = self.shard(category).read().await;
        shard.entries.values().cloned().collect()
    }

    pub async fn counts(&self) -> BTreeMap<Category, usize> {
        let mut counts = BTreeMap::new();
        for category in Category::ALL {
            let shard = self.shard(category).read().await;
            counts.insert(category, shard.entries.len());
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

fn sort_newest_first(entries: &mut [Entry]) {
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_options(capacity: usize) -> StoreOptions {
        StoreOptions {
            policies: Category::ALL.map(|category| CategoryPolicy {
                capacity,
                retention: category.default_retention(),
            }),
            ..Default::default()
        }
    }

    async fn open_store(dir: &Path, capacity: usize) -> CategorizedStore {
        CategorizedStore::open(dir, ScoreEngine::default(), small_options(capacity), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_and_peek() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 10).await;
        let entry = Entry::new(Category::Leaf, "hello");

        let outcome = store.store(entry.clone()).await.unwrap();
        assert!(!outcome.replaced);
        assert!(outcome.evicted.is_empty());

        assert_eq!(store.peek(entry.id).await.unwrap(), entry);
        assert_eq!(store.category_of(entry.id), Some(Category::Leaf));
        assert!(dir
            .path()
            .join("store/leaf")
            .join(format!("{}.json", entry.id))
            .exists());
    }

    #[tokio::test]
    async fn test_get_counts_access() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 10).await;
        let entry = Entry::new(Category::Seed, "counted");
        store.store(entry.clone()).await.unwrap();

        store.get(entry.id).await.unwrap();
        let fetched = store.get(entry.id).await.unwrap().unwrap();
        assert_eq!(fetched.access_count, 2);
        assert_eq!(store.peek(entry.id).await.unwrap().access_count, 2);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 0).await;
        let result = store.store(Entry::new(Category::Seed, "nowhere")).await;
        assert!(matches!(result, Err(ArborError::CapacityExhausted { .. })));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_depth_limit_follows_parent_chain() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 10).await;

        let root = Entry::new(Category::Root, "root");
        let child = Entry::new(Category::Branch, "child").with_parent(root.id);
        let grandchild = Entry::new(Category::Leaf, "grandchild").with_parent(child.id);
        for entry in [&root, &child, &grandchild] {
            store.store(entry.clone()).await.unwrap();
        }

        let shallow = store.scan(&StoreQuery::all().max_depth(1)).await;
        let ids: HashSet<Uuid> = shallow.iter().map(|e| e.id).collect();
        assert_eq!(ids, HashSet::from([root.id, child.id]));

        let deep = store.scan(&StoreQuery::all().max_depth(2)).await;
        assert_eq!(deep.len(), 3);
    }

    #[tokio::test]
    async fn test_parent_cycle_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), 10).await;

        let mut a = Entry::new(Category::Seed, "a");
        let b = Entry::new(Category::Seed, "b").with_parent(a.id);
        a.parent_id = Some(b.id);
        store.store(a).await.unwrap();
        store.store(b).await.unwrap();

        assert!(store.scan(&StoreQuery::all().max_depth(0)).await.is_empty());
        assert_eq!(store.scan(&StoreQuery::all().max_depth(5)).await.len(), 2);
    }
}
