//! Integration tests for the categorized store
//!
//! Exercises routing, capacity eviction, promotion and persistence against
//! a real data directory.

use std::path::Path;
use std::sync::Arc;

use arbor::crypto::{KdfParams, MasterSecret};
use arbor::memory::{Category, Entry, EntryPatch, ScoreConfig, ScoreEngine};
use arbor::storage::{Archive, ArchiveOptions, CategorizedStore, CategoryPolicy, StoreOptions, StoreQuery};
use arbor::ArborError;
use chrono::{Duration, Utc};
use tempfile::tempdir;
use uuid::Uuid;

/// Test fixture: store options with the same capacity in every category
fn options_with_capacity(capacity: usize) -> StoreOptions {
    StoreOptions {
        policies: Category::ALL.map(|category| CategoryPolicy {
            capacity,
            retention: category.default_retention(),
        }),
        ..Default::default()
    }
}

/// Test fixture: an archive with cheap key derivation
async fn create_test_archive(dir: &Path) -> Arc<Archive> {
    let options = ArchiveOptions {
        kdf: KdfParams::insecure_for_tests(1_000),
        ..Default::default()
    };
    Arc::new(
        Archive::open(dir, MasterSecret::new("store test secret").unwrap(), options)
            .await
            .unwrap(),
    )
}

/// Test fixture: a store with an attached archive
async fn create_test_store(dir: &Path, options: StoreOptions) -> (CategorizedStore, Arc<Archive>) {
    let archive = create_test_archive(dir).await;
    let store = CategorizedStore::open(dir, ScoreEngine::default(), options, Some(archive.clone()))
        .await
        .unwrap();
    (store, archive)
}

/// Test fixture: entry created `minutes` ago
fn entry_aged(category: Category, content: &str, minutes: i64) -> Entry {
    Entry::new_at(category, content, Utc::now() - Duration::minutes(minutes))
}

fn record_path(dir: &Path, category: Category, id: Uuid) -> std::path::PathBuf {
    dir.join("store").join(category.as_str()).join(format!("{id}.json"))
}

mod insertion_tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_retrieve_roundtrip() {
        let dir = tempdir().unwrap();
        let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;

        let entry = Entry::new(Category::Seed, "roundtrip")
            .with_resonance(0.4)
            .with_emotion(0.2, -0.5)
            .with_tags(["alpha"]);
        store.store(entry.clone()).await.unwrap();

        assert_eq!(store.peek(entry.id).await, Some(entry.clone()));
        assert!(record_path(dir.path(), Category::Seed, entry.id).exists());
    }

    #[tokio::test]
    async fn test_store_rejects_id_held_by_other_category() {
        let dir = tempdir().unwrap();
        let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;

        let entry = Entry::new(Category::Leaf, "first home");
        store.store(entry.clone()).await.unwrap();

        let mut moved = entry.clone();
        moved.category = Category::Branch;
        let result = store.store(moved).await;

        assert!(matches!(result, Err(ArborError::Conflict(_))));
        assert_eq!(store.category_of(entry.id), Some(Category::Leaf));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_store_overwrites_within_category() {
        let dir = tempdir().unwrap();
        let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;

        let mut entry = Entry::new(Category::Leaf, "v1");
        store.store(entry.clone()).await.unwrap();
        store.get(entry.id).await.unwrap();

        entry.content = "v2".to_string();
        let outcome = store.store(entry.clone()).await.unwrap();
        assert!(outcome.replaced);

        let stored = store.peek(entry.id).await.unwrap();
        assert_eq!(stored.content, "v2");
        assert_eq!(stored.access_count, 1);
        assert!(stored.updated_at >= entry.updated_at);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_errors() {
        let dir = tempdir().unwrap();
        let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;
        let id = Uuid::new_v4();

        assert!(store.peek(id).await.is_none());
        assert!(store.get(id).await.unwrap().is_none());
        assert!(store.delete(id).await.unwrap().is_none());
        assert!(store.mutate(id, EntryPatch::content("x")).await.unwrap().is_none());
        assert!(store.promote(id, Category::Root).await.unwrap().is_none());
    }
}

mod capacity_tests {
    use super::*;

    #[tokio::test]
    async fn test_capacity_invariant_holds_after_every_store() {
        let dir = tempdir().unwrap();
        let (store, _archive) = create_test_store(dir.path(), options_with_capacity(5)).await;

        for i in 0..20 {
            let category = Category::ALL[i % 4];
            store
                .store(entry_aged(category, &format!("entry {i}"), i as i64))
                .await
                .unwrap();
            for (category, count) in store.counts().await {
                assert!(count <= store.capacity(category), "{category} over capacity");
            }
        }
        assert_eq!(store.len(), 20);
    }

    #[tokio::test]
    async fn test_eviction_picks_lowest_score_and_archives_it() {
        let dir = tempdir().unwrap();
        let (store, archive) = create_test_store(dir.path(), options_with_capacity(3)).await;

        let weak = entry_aged(Category::Seed, "weak", 10).with_resonance(0.05);
        let strong = entry_aged(Category::Seed, "strong", 20).with_resonance(0.9);
        let middle = entry_aged(Category::Seed, "middle", 30).with_resonance(0.5);
        for entry in [&weak, &strong, &middle] {
            store.store(entry.clone()).await.unwrap();
        }

        let outcome = store
            .store(Entry::new(Category::Seed, "newcomer").with_resonance(0.7))
            .await
            .unwrap();

        assert_eq!(outcome.evicted, vec![weak.id]);
        assert!(store.peek(weak.id).await.is_none());
        assert!(!record_path(dir.path(), Category::Seed, weak.id).exists());
        assert_eq!(store.counts().await[&Category::Seed], 3);

        let archived = archive.retrieve(weak.id).await.unwrap().unwrap();
        assert_eq!(archived.content, "weak");
    }

    #[tokio::test]
    async fn test_eviction_ties_go_to_oldest() {
        let dir = tempdir().unwrap();
        let ageless = ScoreEngine::new(ScoreConfig {
            access_weight: 0.30,
            age_weight: 0.0,
            ..Default::default()
        });
        let store = CategorizedStore::open(dir.path(), ageless, options_with_capacity(2), None)
            .await
            .unwrap();

        let now = Utc::now();
        let older = Entry::new_at(Category::Root, "older", now - Duration::hours(2));
        let newer = Entry::new_at(Category::Root, "newer", now - Duration::hours(1));
        store.store(newer.clone()).await.unwrap();
        store.store(older.clone()).await.unwrap();

        let outcome = store.store(Entry::new(Category::Root, "third")).await.unwrap();
        assert_eq!(outcome.evicted, vec![older.id]);
        assert!(store.peek(newer.id).await.is_some());
    }

    #[tokio::test]
    async fn test_zero_capacity_category_is_exhausted() {
        let dir = tempdir().unwrap();
        let mut options = StoreOptions::default();
        options.policies[Category::Branch.rank()].capacity = 0;
        let (store, _archive) = create_test_store(dir.path(), options).await;

        let result = store.store(Entry::new(Category::Branch, "no room")).await;
        assert!(matches!(result, Err(ArborError::CapacityExhausted { .. })));

        let seed = Entry::new(Category::Seed, "climber");
        store.store(seed.clone()).await.unwrap();
        let result = store.promote(seed.id, Category::Branch).await;
        assert!(matches!(result, Err(ArborError::CapacityExhausted { .. })));
        assert_eq!(store.category_of(seed.id), Some(Category::Seed));
    }

    #[tokio::test]
    async fn test_full_root_evicts_lowest_into_archive_on_promotion() {
        let dir = tempdir().unwrap();
        let (store, archive) = create_test_store(dir.path(), StoreOptions::default()).await;
        let root_capacity = store.capacity(Category::Root);
        assert_eq!(root_capacity, 1000);

        let lowest = entry_aged(Category::Root, "lowest root", 1).with_resonance(0.0);
        store.store(lowest.clone()).await.unwrap();
        for i in 1..root_capacity {
            store
                .store(entry_aged(Category::Root, &format!("root {i}"), 1).with_resonance(0.5))
                .await
                .unwrap();
        }
        assert_eq!(store.counts().await[&Category::Root], root_capacity);

        let climber = Entry::new(Category::Branch, "the 1001st").foundational().with_resonance(1.0);
        store.store(climber.clone()).await.unwrap();

        let outcome = store.promote(climber.id, Category::Root).await.unwrap().unwrap();
        assert_eq!(outcome.evicted, vec![lowest.id]);
        assert_eq!(store.counts().await[&Category::Root], root_capacity);
        assert_eq!(store.category_of(climber.id), Some(Category::Root));
        assert!(store.peek(lowest.id).await.is_none());
        assert!(archive.contains(lowest.id));
    }
}

mod promotion_tests {
    use super::*;

    #[tokio::test]
    async fn test_leftover_source_record_is_swept_on_delete() {
        let dir = tempdir().unwrap();
        let entry = Entry::new(Category::Seed, "left behind");
        {
            let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;
            store.store(entry.clone()).await.unwrap();

            // A non-empty directory in place of the seed record cannot be unlinked
            let seed_path = record_path(dir.path(), Category::Seed, entry.id);
            std::fs::remove_file(&seed_path).unwrap();
            std::fs::create_dir(&seed_path).unwrap();
            std::fs::write(seed_path.join("pin"), b"x").unwrap();

            store.promote(entry.id, Category::Leaf).await.unwrap().unwrap();
            assert_eq!(store.category_of(entry.id), Some(Category::Leaf));
            assert_eq!(store.stale_record_count(), 1);

            // The path becomes removable again, still holding the old seed copy
            std::fs::remove_dir_all(&seed_path).unwrap();
            std::fs::write(&seed_path, serde_json::to_vec(&entry).unwrap()).unwrap();

            assert!(store.delete(entry.id).await.unwrap().is_some());
            assert_eq!(store.stale_record_count(), 0);
            assert!(!seed_path.exists());
        }

        let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;
        assert!(!store.contains(entry.id));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_promotion_moves_without_loss() {
        let dir = tempdir().unwrap();
        let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;

        let entry = Entry::new(Category::Seed, "rising").with_tags(["keep"]);
        store.store(entry.clone()).await.unwrap();

        let outcome = store.promote(entry.id, Category::Branch).await.unwrap().unwrap();
        assert_eq!(outcome.from, Category::Seed);
        assert_eq!(outcome.to, Category::Branch);
        assert!(outcome.evicted.is_empty());

        let promoted = store.peek(entry.id).await.unwrap();
        assert_eq!(promoted.category, Category::Branch);
        assert_eq!(promoted.content, entry.content);
        assert_eq!(promoted.tags, entry.tags);
        assert_eq!(promoted.created_at, entry.created_at);

        assert!(record_path(dir.path(), Category::Branch, entry.id).exists());
        assert!(!record_path(dir.path(), Category::Seed, entry.id).exists());
        assert_eq!(store.counts().await[&Category::Seed], 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_promotion_must_move_up() {
        let dir = tempdir().unwrap();
        let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;

        let entry = Entry::new(Category::Branch, "settled");
        store.store(entry.clone()).await.unwrap();

        for target in [Category::Seed, Category::Leaf, Category::Branch] {
            let result = store.promote(entry.id, target).await;
            assert!(matches!(result, Err(ArborError::InvalidPromotion(_))));
        }
        assert_eq!(store.category_of(entry.id), Some(Category::Branch));
    }

    #[tokio::test]
    async fn test_concurrent_promotions_keep_one_copy() {
        let dir = tempdir().unwrap();
        let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;
        let store = Arc::new(store);

        let mut ids = Vec::new();
        for i in 0..10 {
            let entry = Entry::new(Category::Seed, format!("parallel {i}"));
            ids.push(entry.id);
            store.store(entry).await.unwrap();
        }

        let mut handles = Vec::new();
        for (i, id) in ids.iter().copied().enumerate() {
            let store = store.clone();
            let target = if i % 2 == 0 { Category::Leaf } else { Category::Root };
            handles.push(tokio::spawn(async move { store.promote(id, target).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap().unwrap();
        }

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 10);
        let counts = store.counts().await;
        assert_eq!(counts[&Category::Seed], 0);
        assert_eq!(counts[&Category::Leaf], 5);
        assert_eq!(counts[&Category::Root], 5);
    }
}

mod retrieval_tests {
    use super::*;

    #[tokio::test]
    async fn test_retrieve_orders_newest_first_and_limits() {
        let dir = tempdir().unwrap();
        let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;

        let oldest = entry_aged(Category::Seed, "note 1", 30);
        let middle = entry_aged(Category::Leaf, "note 2", 20);
        let newest = entry_aged(Category::Root, "note 3", 10);
        let other = entry_aged(Category::Seed, "unrelated", 5);
        for entry in [&oldest, &middle, &newest, &other] {
            store.store(entry.clone()).await.unwrap();
        }

        let query = StoreQuery::all()
            .matching(|e| e.content.starts_with("note"))
            .limit(2);
        let results = store.retrieve(&query).await.unwrap();

        assert_eq!(
            results.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![newest.id, middle.id]
        );
        assert!(results.iter().all(|e| e.access_count == 1));
        assert_eq!(store.peek(oldest.id).await.unwrap().access_count, 0);
    }

    #[tokio::test]
    async fn test_retrieve_filters_by_category_and_id() {
        let dir = tempdir().unwrap();
        let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;

        let seed = Entry::new(Category::Seed, "seed");
        let leaf = Entry::new(Category::Leaf, "leaf");
        let root = Entry::new(Category::Root, "root");
        for entry in [&seed, &leaf, &root] {
            store.store(entry.clone()).await.unwrap();
        }

        let upper = store
            .retrieve(&StoreQuery::all().in_categories([Category::Leaf, Category::Root]))
            .await
            .unwrap();
        assert_eq!(upper.len(), 2);
        assert!(upper.iter().all(|e| e.category != Category::Seed));

        let by_id = store.retrieve(&StoreQuery::all().with_ids([seed.id])).await.unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].id, seed.id);
    }

    #[tokio::test]
    async fn test_scan_does_not_count_access() {
        let dir = tempdir().unwrap();
        let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;
        let entry = Entry::new(Category::Leaf, "quiet");
        store.store(entry.clone()).await.unwrap();

        store.scan(&StoreQuery::all()).await;
        assert_eq!(store.peek(entry.id).await.unwrap().access_count, 0);
    }

    #[tokio::test]
    async fn test_mutate_summary_is_not_a_content_change() {
        let dir = tempdir().unwrap();
        let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;
        let entry = Entry::new(Category::Leaf, "body");
        store.store(entry.clone()).await.unwrap();

        let updated = store
            .mutate(entry.id, EntryPatch::summary("short".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.summary.as_deref(), Some("short"));
        assert_eq!(updated.updated_at, entry.updated_at);

        let updated = store
            .mutate(entry.id, EntryPatch::content("new body"))
            .await
            .unwrap()
            .unwrap();
        assert!(updated.updated_at > entry.updated_at);
    }
}

mod persistence_tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let entry = Entry::new(Category::Leaf, "durable");
        {
            let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;
            store.store(entry.clone()).await.unwrap();
            store.get(entry.id).await.unwrap();
            store.promote(entry.id, Category::Branch).await.unwrap();
        }

        let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;
        let reloaded = store.peek(entry.id).await.unwrap();
        assert_eq!(reloaded.category, Category::Branch);
        assert_eq!(reloaded.access_count, 1);
        assert_eq!(reloaded.content, "durable");
    }

    #[tokio::test]
    async fn test_reopen_resolves_duplicate_to_higher_category() {
        let dir = tempdir().unwrap();
        let entry = Entry::new(Category::Seed, "half moved");
        {
            let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;
            store.store(entry.clone()).await.unwrap();
        }

        // Simulate a crash between writing the destination and removing the source
        let mut copy = entry.clone();
        copy.category = Category::Leaf;
        std::fs::write(
            record_path(dir.path(), Category::Leaf, entry.id),
            serde_json::to_vec(&copy).unwrap(),
        )
        .unwrap();

        let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.category_of(entry.id), Some(Category::Leaf));
        assert!(!record_path(dir.path(), Category::Seed, entry.id).exists());
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let dir = tempdir().unwrap();
        let (store, _archive) = create_test_store(dir.path(), StoreOptions::default()).await;
        let entry = Entry::new(Category::Root, "temporary");
        store.store(entry.clone()).await.unwrap();

        let removed = store.delete(entry.id).await.unwrap().unwrap();
        assert_eq!(removed.id, entry.id);
        assert!(!record_path(dir.path(), Category::Root, entry.id).exists());
        assert!(store.is_empty());
    }
}
