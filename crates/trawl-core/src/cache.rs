//! Persistent dedup cache.
//!
//! An in-memory index keyed by target, backed by a [`CacheStore`]. Lookups
//! never touch storage. Puts mark the key dirty; dirty entries are appended
//! to the store in batches and a full snapshot is written on [`DedupCache::flush`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::AppError;
use crate::models::{CacheEntry, CacheStatus};
use crate::traits::CacheStore;

/// Entry counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub success: usize,
    pub permanent_failure: usize,
    pub transient_failure: usize,
}

impl CacheStats {
    pub fn total(&self) -> usize {
        self.success + self.permanent_failure + self.transient_failure
    }
}

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    /// Keys written since the last successful append or snapshot.
    dirty: HashSet<String>,
    /// Anything changed since the last snapshot.
    needs_snapshot: bool,
}

/// Shared target → [`CacheEntry`] map with batched persistence.
///
/// All index mutations happen under one lock, so a lookup never sees a
/// half-applied put. Store writes are serialised by a second lock, taken
/// before the dirty set is drained, so batches reach the store in the
/// order they were drained.
pub struct DedupCache<S: CacheStore> {
    store: S,
    index: Mutex<CacheIndex>,
    write_lock: Mutex<()>,
    flush_every: usize,
}

impl<S: CacheStore> DedupCache<S> {
    /// Load the persisted cache.
    ///
    /// An unreadable or corrupt store is logged and treated as empty; prior
    /// work is redone but the run goes on.
    pub fn open(store: S, flush_every: usize) -> Self {
        let entries = match store.load() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Persisted cache unreadable, starting with an empty cache");
                Vec::new()
            }
        };

        let loaded = entries.len();
        let mut map = HashMap::with_capacity(loaded);
        for entry in entries {
            map.insert(entry.key.clone(), entry);
        }
        // Appended batches may have left several lines per key; rewrite once.
        let needs_snapshot = map.len() != loaded;
        tracing::info!(entries = map.len(), "Dedup cache loaded");

        Self {
            store,
            index: Mutex::new(CacheIndex {
                entries: map,
                dirty: HashSet::new(),
                needs_snapshot,
            }),
            write_lock: Mutex::new(()),
            flush_every: flush_every.max(1),
        }
    }

    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        self.lock_index().entries.get(key).cloned()
    }

    /// Whether `key` is already resolved (success or permanent failure).
    pub fn is_resolved(&self, key: &str) -> bool {
        self.lock_index()
            .entries
            .get(key)
            .is_some_and(|e| e.status.is_resolved())
    }

    /// Insert or overwrite the entry for `entry.key`.
    ///
    /// The index update is immediate. When enough keys are dirty they are
    /// appended to the store; a store failure there is returned but the
    /// entries stay dirty for the next flush.
    pub fn put(&self, entry: CacheEntry) -> Result<(), AppError> {
        if self.stage(entry) {
            self.persist_dirty()?;
        }
        Ok(())
    }

    /// [`put`](Self::put) for async callers. A full batch is written on the
    /// blocking pool so a slow disk does not stall the runtime threads.
    pub async fn put_async(self: &Arc<Self>, entry: CacheEntry) -> Result<(), AppError> {
        if !self.stage(entry) {
            return Ok(());
        }
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || cache.persist_dirty())
            .await
            .map_err(|e| AppError::CacheIo(format!("cache write task failed: {e}")))?
    }

    /// [`flush`](Self::flush) on the blocking pool.
    pub async fn flush_async(self: &Arc<Self>) -> Result<bool, AppError> {
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || cache.flush())
            .await
            .map_err(|e| AppError::CacheIo(format!("cache flush task failed: {e}")))?
    }

    /// Update the index and mark the key dirty. Returns whether a batch is
    /// due.
    fn stage(&self, entry: CacheEntry) -> bool {
        let mut index = self.lock_index();
        index.dirty.insert(entry.key.clone());
        index.needs_snapshot = true;
        index.entries.insert(entry.key.clone(), entry);
        index.dirty.len() >= self.flush_every
    }

    /// Write the full cache to the store if anything changed since the last
    /// snapshot. Returns whether a write happened.
    pub fn flush(&self) -> Result<bool, AppError> {
        let _write = self.lock_write();

        let (snapshot, dirty) = {
            let mut index = self.lock_index();
            if !index.needs_snapshot && index.dirty.is_empty() {
                return Ok(false);
            }
            index.needs_snapshot = false;
            let dirty: Vec<String> = index.dirty.drain().collect();
            (sorted_entries(&index.entries), dirty)
        };

        if let Err(e) = with_one_retry(|| self.store.snapshot(&snapshot)) {
            let mut index = self.lock_index();
            index.needs_snapshot = true;
            index.dirty.extend(dirty);
            return Err(e);
        }

        tracing::debug!(entries = snapshot.len(), "Dedup cache flushed");
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.lock_index().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.lock_index();
        let mut stats = CacheStats::default();
        for entry in index.entries.values() {
            match entry.status {
                CacheStatus::Success => stats.success += 1,
                CacheStatus::PermanentFailure => stats.permanent_failure += 1,
                CacheStatus::TransientFailure => stats.transient_failure += 1,
            }
        }
        stats
    }

    /// All entries, sorted by key.
    pub fn entries(&self) -> Vec<CacheEntry> {
        sorted_entries(&self.lock_index().entries)
    }

    /// Number of entries not yet appended or snapshotted.
    pub fn pending(&self) -> usize {
        self.lock_index().dirty.len()
    }

    fn persist_dirty(&self) -> Result<(), AppError> {
        let _write = self.lock_write();

        let (batch, keys) = {
            let mut index = self.lock_index();
            let keys: Vec<String> = index.dirty.drain().collect();
            let batch: Vec<CacheEntry> = keys
                .iter()
                .filter_map(|k| index.entries.get(k).cloned())
                .collect();
            (batch, keys)
        };

        if batch.is_empty() {
            return Ok(());
        }

        match with_one_retry(|| self.store.append(&batch)) {
            Ok(()) => {
                tracing::debug!(entries = batch.len(), "Dedup cache batch persisted");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    entries = batch.len(),
                    "Cache batch write failed twice, keeping entries for final flush"
                );
                self.lock_index().dirty.extend(keys);
                Err(e)
            }
        }
    }

    fn lock_index(&self) -> MutexGuard<'_, CacheIndex> {
        self.index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_write(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sorted_entries(entries: &HashMap<String, CacheEntry>) -> Vec<CacheEntry> {
    let mut all: Vec<CacheEntry> = entries.values().cloned().collect();
    all.sort_by(|a, b| a.key.cmp(&b.key));
    all
}

fn with_one_retry<F>(mut op: F) -> Result<(), AppError>
where
    F: FnMut() -> Result<(), AppError>,
{
    match op() {
        Ok(()) => Ok(()),
        Err(first) => {
            tracing::warn!(error = %first, "Cache write failed, retrying once");
            op()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread::ThreadId;

    use super::*;
    use crate::models::Record;
    use crate::testutil::{MemoryStore, make_test_record};

    /// Records which thread each store write ran on.
    #[derive(Clone, Default)]
    struct ThreadTrackingStore {
        writers: Arc<Mutex<Vec<ThreadId>>>,
    }

    impl ThreadTrackingStore {
        fn writers(&self) -> Vec<ThreadId> {
            self.writers.lock().unwrap().clone()
        }
    }

    impl CacheStore for ThreadTrackingStore {
        fn load(&self) -> Result<Vec<CacheEntry>, AppError> {
            Ok(Vec::new())
        }

        fn append(&self, _entries: &[CacheEntry]) -> Result<(), AppError> {
            self.writers.lock().unwrap().push(std::thread::current().id());
            Ok(())
        }

        fn snapshot(&self, _entries: &[CacheEntry]) -> Result<(), AppError> {
            self.writers.lock().unwrap().push(std::thread::current().id());
            Ok(())
        }
    }

    fn success(key: &str) -> CacheEntry {
        CacheEntry::success(make_test_record(key), 1)
    }

    #[test]
    fn lookup_sees_loaded_entries() {
        let store = MemoryStore::with_entries(vec![success("a/one")]);
        let cache = DedupCache::open(store, 10);

        let entry = cache.lookup("a/one").unwrap();
        assert_eq!(entry.status, CacheStatus::Success);
        assert!(cache.lookup("a/two").is_none());
        assert!(cache.is_resolved("a/one"));
    }

    #[test]
    fn later_loaded_entries_win() {
        let store = MemoryStore::with_entries(vec![
            CacheEntry::failure("a/one", CacheStatus::TransientFailure, "timeout", 3),
            success("a/one"),
        ]);
        let cache = DedupCache::open(store.clone(), 10);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup("a/one").unwrap().status, CacheStatus::Success);
        // Duplicate lines get compacted by the first flush.
        assert!(cache.flush().unwrap());
        assert_eq!(store.persisted().len(), 1);
    }

    #[test]
    fn unreadable_store_degrades_to_empty() {
        let store = MemoryStore::with_load_error(AppError::CacheIo("corrupt line 3".into()));
        let cache = DedupCache::open(store, 10);
        assert!(cache.is_empty());

        cache.put(success("a/one")).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn put_overwrites_existing_entry() {
        let cache = DedupCache::open(MemoryStore::default(), 10);
        cache
            .put(CacheEntry::failure("a/one", CacheStatus::TransientFailure, "timeout", 3))
            .unwrap();
        cache.put(success("a/one")).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup("a/one").unwrap().status, CacheStatus::Success);
    }

    #[test]
    fn batches_are_appended_when_full() {
        let store = MemoryStore::default();
        let cache = DedupCache::open(store.clone(), 2);

        cache.put(success("a/one")).unwrap();
        assert_eq!(store.append_calls(), 0);
        cache.put(success("a/two")).unwrap();
        assert_eq!(store.append_calls(), 1);
        assert_eq!(store.persisted().len(), 2);
        assert_eq!(cache.pending(), 0);
    }

    #[test]
    fn flush_is_idempotent() {
        let store = MemoryStore::default();
        let cache = DedupCache::open(store.clone(), 100);
        cache.put(success("a/one")).unwrap();
        cache
            .put(CacheEntry::failure("a/two", CacheStatus::PermanentFailure, "404", 1))
            .unwrap();

        assert!(cache.flush().unwrap());
        let first = store.persisted();
        assert_eq!(store.snapshot_calls(), 1);

        assert!(!cache.flush().unwrap());
        assert_eq!(store.snapshot_calls(), 1);
        assert_eq!(store.persisted(), first);
    }

    #[test]
    fn append_failure_is_retried_once() {
        let store = MemoryStore::default();
        store.fail_next_writes(1);
        let cache = DedupCache::open(store.clone(), 1);

        cache.put(success("a/one")).unwrap();
        assert_eq!(store.append_calls(), 2);
        assert_eq!(store.persisted().len(), 1);
    }

    #[test]
    fn persistent_write_failure_keeps_entries_for_flush() {
        let store = MemoryStore::default();
        store.fail_next_writes(2);
        let cache = DedupCache::open(store.clone(), 1);

        let err = cache.put(success("a/one")).unwrap_err();
        assert!(matches!(err, AppError::CacheIo(_)));
        // Entry stays in memory and dirty.
        assert!(cache.lookup("a/one").is_some());
        assert_eq!(cache.pending(), 1);

        assert!(cache.flush().unwrap());
        assert_eq!(store.persisted().len(), 1);
        assert_eq!(cache.pending(), 0);
    }

    #[test]
    fn failed_flush_can_be_retried() {
        let store = MemoryStore::default();
        let cache = DedupCache::open(store.clone(), 100);
        cache.put(success("a/one")).unwrap();

        store.fail_next_writes(2);
        assert!(cache.flush().is_err());
        assert!(cache.flush().unwrap());
        assert_eq!(store.persisted().len(), 1);
    }

    #[test]
    fn concurrent_puts_keep_one_entry_per_key() {
        let store = MemoryStore::default();
        let cache = Arc::new(DedupCache::open(store.clone(), 3));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let key = format!("owner/repo-{}", i % 20);
                        let record: Record = make_test_record(&key).with_field("writer", t.to_string());
                        cache.put(CacheEntry::success(record, 1)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 20);
        cache.flush().unwrap();
        let persisted = store.persisted();
        assert_eq!(persisted.len(), 20);
        for entry in persisted {
            assert_eq!(cache.lookup(&entry.key).unwrap(), entry);
        }
    }

    #[test]
    fn stats_count_by_status() {
        let cache = DedupCache::open(MemoryStore::default(), 100);
        cache.put(success("a/one")).unwrap();
        cache.put(success("a/two")).unwrap();
        cache
            .put(CacheEntry::failure("a/three", CacheStatus::PermanentFailure, "404", 1))
            .unwrap();
        cache
            .put(CacheEntry::failure("a/four", CacheStatus::TransientFailure, "timeout", 3))
            .unwrap();

        let stats = cache.stats();
        assert_eq!(stats.success, 2);
        assert_eq!(stats.permanent_failure, 1);
        assert_eq!(stats.transient_failure, 1);
        assert_eq!(stats.total(), 4);
        assert!(!cache.is_resolved("a/four"));

        let keys: Vec<_> = cache.entries().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, ["a/four", "a/one", "a/three", "a/two"]);
    }

    #[tokio::test]
    async fn async_writes_run_off_the_runtime_thread() {
        let store = ThreadTrackingStore::default();
        let cache = Arc::new(DedupCache::open(store.clone(), 2));
        let runtime_thread = std::thread::current().id();

        cache.put_async(success("a/one")).await.unwrap();
        assert!(store.writers().is_empty());
        cache.put_async(success("a/two")).await.unwrap();
        assert_eq!(cache.pending(), 0);
        assert!(cache.flush_async().await.unwrap());

        let writers = store.writers();
        assert_eq!(writers.len(), 2);
        assert!(writers.iter().all(|id| *id != runtime_thread));
    }

    #[tokio::test]
    async fn async_put_failure_keeps_entries_dirty() {
        let store = MemoryStore::default();
        store.fail_next_writes(2);
        let cache = Arc::new(DedupCache::open(store.clone(), 1));

        let err = cache.put_async(success("a/one")).await.unwrap_err();
        assert!(matches!(err, AppError::CacheIo(_)));
        assert_eq!(cache.pending(), 1);

        assert!(cache.flush_async().await.unwrap());
        assert_eq!(store.persisted().len(), 1);
    }
}
