//! Bounded in-memory hot buffer
//!
//! Holds fresh entries until they are flushed into the categorized store.
//! Capacity is enforced with a compare-and-swap slot counter so concurrent
//! writers never push the buffer past its bound.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tracing::debug;
use uuid::Uuid;

use crate::memory::types::Entry;

/// Tunables for the buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferPolicy {
    pub capacity: usize,
    /// Entries older than this are due for flushing
    pub retention: Duration,
    /// Never-read entries younger than this are not evicted
    pub write_guard: Duration,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            capacity: 1000,
            retention: Duration::hours(24),
            write_guard: Duration::seconds(60),
        }
    }
}

/// Result of [`Buffer::put`]
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    /// Stored in a fresh slot; `evicted` made room for it
    Inserted { evicted: Vec<Entry> },
    /// An entry with the same id was overwritten in place
    Replaced,
    /// Every resident entry is protected by the write guard. The entry is
    /// handed back along with anything already evicted for it.
    Rejected { entry: Entry, evicted: Vec<Entry> },
}

impl PutOutcome {
    /// Entries that left the buffer and need a new home
    pub fn evicted(&self) -> &[Entry] {
        match self {
            PutOutcome::Inserted { evicted } | PutOutcome::Rejected { evicted, .. } => evicted,
            PutOutcome::Replaced => &[],
        }
    }
}

pub struct Buffer {
    entries: DashMap<Uuid, Entry>,
    /// Reserved slots, always >= entries.len()
    slots: AtomicUsize,
    policy: BufferPolicy,
}

impl Buffer {
    pub fn new(policy: BufferPolicy) -> Self {
        Self {
            entries: DashMap::with_capacity(policy.capacity),
            slots: AtomicUsize::new(0),
            policy,
        }
    }

    pub fn policy(&self) -> &BufferPolicy {
        &self.policy
    }

    pub fn capacity(&self) -> usize {
        self.policy.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_protected(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        entry.access_count == 0 && entry.age(now) < self.policy.write_guard
    }

    /// Claim a free slot, evicting least-recently-accessed entries as needed
    fn reserve_slot(&self, now: DateTime<Utc>, evicted: &mut Vec<Entry>) -> bool {
        loop {
            let current = self.slots.load(Ordering::Acquire);
            if current < self.policy.capacity {
                if self
                    .slots
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
                continue;
            }

            match self.evict_one(now) {
                Some(entry) => evicted.push(entry),
                // Slots reserved by writers that have not inserted yet
                None if self.entries.len() < current => std::hint::spin_loop(),
                None => return false,
            }
        }
    }

    /// Remove the least-recently-accessed unprotected entry
    fn evict_one(&self, now: DateTime<Utc>) -> Option<Entry> {
        loop {
            let victim = self
                .entries
                .iter()
                .filter(|e| !self.is_protected(e.value(), now))
                .min_by_key(|e| (e.last_accessed_at, e.created_at))
                .map(|e| *e.key())?;

            if let Some((_, entry)) = self.entries.remove(&victim) {
                self.slots.fetch_sub(1, Ordering::AcqRel);
                debug!("Evicted entry {} from buffer", victim);
                return Some(entry);
            }
        }
    }

    /// Insert or overwrite an entry
    pub fn put(&self, entry: Entry) -> PutOutcome {
        let now = Utc::now();

        if let Some(mut existing) = self.entries.get_mut(&entry.id) {
            existing.overwrite_from(entry, now);
            return PutOutcome::Replaced;
        }

        let mut evicted = Vec::new();
        if !self.reserve_slot(now, &mut evicted) {
            return PutOutcome::Rejected { entry, evicted };
        }

        match self.entries.entry(entry.id) {
            MapEntry::Occupied(mut slot) => {
                // Lost a race with a writer of the same id
                slot.get_mut().overwrite_from(entry, now);
                self.slots.fetch_sub(1, Ordering::AcqRel);
                PutOutcome::Replaced
            }
            MapEntry::Vacant(slot) => {
                slot.insert(entry);
                PutOutcome::Inserted { evicted }
            }
        }
    }

    /// Put an entry back without a capacity check.
    ///
    /// Used when an entry that just left the buffer could not be placed
    /// elsewhere. May briefly exceed capacity.
    pub fn restore(&self, entry: Entry) {
        if let MapEntry::Vacant(slot) = self.entries.entry(entry.id) {
            slot.insert(entry);
            self.slots.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Look up an entry and count it as accessed
    pub fn get(&self, id: Uuid) -> Option<Entry> {
        let mut entry = self.entries.get_mut(&id)?;
        entry.mark_accessed(Utc::now());
        Some(entry.clone())
    }

    /// Look up an entry without touching its access statistics
    pub fn peek(&self, id: Uuid) -> Option<Entry> {
        self.entries.get(&id).map(|e| e.clone())
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.contains_key(&id)
    }

    /// Record `child` under `parent` if the parent is buffered
    pub fn add_child(&self, parent: Uuid, child: Uuid) -> bool {
        match self.entries.get_mut(&parent) {
            Some(mut entry) => {
                entry.children_ids.insert(child);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: Uuid) -> Option<Entry> {
        let (_, entry) = self.entries.remove(&id)?;
        self.slots.fetch_sub(1, Ordering::AcqRel);
        Some(entry)
    }

    /// Remove `entry.id` only if it has not changed since `entry` was copied
    pub fn remove_if_unchanged(&self, entry: &Entry) -> bool {
        let removed = self
            .entries
            .remove_if(&entry.id, |_, current| current == entry)
            .is_some();
        if removed {
            self.slots.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Matching entries, newest first, without counting an access
    pub fn search<F>(&self, predicate: F) -> Vec<Entry>
    where
        F: Fn(&Entry) -> bool,
    {
        let mut found: Vec<Entry> = self
            .entries
            .iter()
            .filter(|e| predicate(e.value()))
            .map(|e| e.value().clone())
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        found
    }

    /// Copy of every buffered entry, oldest first
    pub fn snapshot(&self) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| (e.created_at, e.id));
        entries
    }

    /// Drain every entry, oldest first
    pub fn flush(&self) -> Vec<Entry> {
        let ids: Vec<Uuid> = self.entries.iter().map(|e| *e.key()).collect();
        let mut drained: Vec<Entry> = ids.into_iter().filter_map(|id| self.remove(id)).collect();
        drained.sort_by_key(|e| (e.created_at, e.id));
        drained
    }

    /// Copies of entries older than the retention window, oldest first.
    ///
    /// The entries stay buffered until the caller has placed them elsewhere
    /// and removed them with [`remove_if_unchanged`](Self::remove_if_unchanged).
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<Entry> {
        let mut expired: Vec<Entry> = self
            .entries
            .iter()
            .filter(|e| e.age(now) > self.policy.retention)
            .map(|e| e.value().clone())
            .collect();
        expired.sort_by_key(|e| (e.created_at, e.id));
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::Category;
    use std::sync::Arc;

    fn policy(capacity: usize) -> BufferPolicy {
        BufferPolicy {
            capacity,
            ..Default::default()
        }
    }

    fn aged(content: &str, minutes: i64) -> Entry {
        Entry::new_at(Category::Seed, content, Utc::now() - Duration::minutes(minutes))
    }

    #[test]
    fn test_put_and_get() {
        let buffer = Buffer::new(policy(4));
        let entry = Entry::new(Category::Seed, "fresh");

        assert_eq!(
            buffer.put(entry.clone()),
            PutOutcome::Inserted { evicted: vec![] }
        );
        assert_eq!(buffer.peek(entry.id).unwrap().access_count, 0);
        assert_eq!(buffer.get(entry.id).unwrap().access_count, 1);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_put_same_id_replaces() {
        let buffer = Buffer::new(policy(1));
        let mut entry = Entry::new(Category::Seed, "v1");
        buffer.put(entry.clone());

        entry.content = "v2".to_string();
        assert_eq!(buffer.put(entry.clone()), PutOutcome::Replaced);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.peek(entry.id).unwrap().content, "v2");
    }

    #[test]
    fn test_evicts_least_recently_accessed() {
        let buffer = Buffer::new(policy(2));
        let older = aged("older", 30);
        let newer = aged("newer", 20);
        buffer.put(older.clone());
        buffer.put(newer.clone());
        buffer.get(older.id);

        let outcome = buffer.put(Entry::new(Category::Seed, "incoming"));
        let evicted = outcome.evicted();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, newer.id);
        assert!(buffer.contains(older.id));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_write_guard_rejects_when_all_protected() {
        let buffer = Buffer::new(policy(2));
        buffer.put(Entry::new(Category::Seed, "a"));
        buffer.put(Entry::new(Category::Seed, "b"));

        let incoming = Entry::new(Category::Seed, "c");
        match buffer.put(incoming.clone()) {
            PutOutcome::Rejected { entry, evicted } => {
                assert_eq!(entry.id, incoming.id);
                assert!(evicted.is_empty());
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_zero_capacity_rejects() {
        let buffer = Buffer::new(policy(0));
        assert!(matches!(
            buffer.put(Entry::new(Category::Seed, "x")),
            PutOutcome::Rejected { .. }
        ));
    }

    #[test]
    fn test_flush_drains_oldest_first() {
        let buffer = Buffer::new(policy(8));
        let first = aged("first", 10);
        let second = aged("second", 5);
        buffer.put(second.clone());
        buffer.put(first.clone());

        let drained = buffer.flush();
        assert_eq!(
            drained.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![first.id, second.id]
        );
        assert!(buffer.is_empty());
        assert!(matches!(
            buffer.put(Entry::new(Category::Seed, "after")),
            PutOutcome::Inserted { .. }
        ));
    }

    #[test]
    fn test_expired_respects_retention() {
        let buffer = Buffer::new(BufferPolicy {
            capacity: 8,
            retention: Duration::hours(1),
            ..Default::default()
        });
        let stale = aged("stale", 120);
        let fresh = aged("fresh", 5);
        buffer.put(stale.clone());
        buffer.put(fresh.clone());

        let expired = buffer.expired(Utc::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale.id);
        assert!(buffer.contains(stale.id));
        assert!(buffer.contains(fresh.id));
    }

    #[test]
    fn test_remove_if_unchanged() {
        let buffer = Buffer::new(policy(4));
        let entry = aged("x", 5);
        buffer.put(entry.clone());
        let copy = buffer.peek(entry.id).unwrap();

        buffer.get(entry.id);
        assert!(!buffer.remove_if_unchanged(&copy));

        let copy = buffer.peek(entry.id).unwrap();
        assert!(buffer.remove_if_unchanged(&copy));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_search_is_newest_first() {
        let buffer = Buffer::new(policy(8));
        let old = aged("note old", 10);
        let new = aged("note new", 1);
        buffer.put(old.clone());
        buffer.put(new.clone());
        buffer.put(aged("other", 3));

        let found = buffer.search(|e| e.content.starts_with("note"));
        assert_eq!(
            found.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![new.id, old.id]
        );
        assert_eq!(buffer.peek(old.id).unwrap().access_count, 0);
    }

    #[test]
    fn test_concurrent_puts_never_exceed_capacity() {
        let buffer = Arc::new(Buffer::new(policy(16)));
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        buffer.put(aged(&format!("{t}-{i}"), 10));
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(buffer.len(), 16);
    }
}
