use std::fs;

use trawl_core::cache::DedupCache;
use trawl_core::models::{CacheEntry, CacheStatus};
use trawl_core::testutil::make_test_record;
use trawl_store::JsonlCacheStore;

use crate::integration::common::workspace;

#[test]
fn corrupt_cache_file_degrades_to_empty() {
    let ws = workspace();
    fs::write(&ws.cache_path, "this is not json\n").unwrap();

    let cache = DedupCache::open(JsonlCacheStore::new(&ws.cache_path), 10);
    assert!(cache.is_empty());

    cache
        .put(CacheEntry::success(make_test_record("a/one"), 1))
        .unwrap();
    assert!(cache.flush().unwrap());

    let reopened = DedupCache::open(JsonlCacheStore::new(&ws.cache_path), 10);
    assert_eq!(reopened.len(), 1);
    assert!(reopened.is_resolved("a/one"));
}

#[test]
fn batches_append_and_flush_collapses_to_one_line_per_key() {
    let ws = workspace();
    let cache = DedupCache::open(JsonlCacheStore::new(&ws.cache_path), 1);

    cache
        .put(CacheEntry::failure("a/one", CacheStatus::TransientFailure, "timeout", 1))
        .unwrap();
    cache
        .put(CacheEntry::success(make_test_record("a/one"), 2))
        .unwrap();
    cache
        .put(CacheEntry::failure("a/two", CacheStatus::PermanentFailure, "404", 1))
        .unwrap();

    // Every put crossed the batch size, so each was appended.
    let raw = fs::read_to_string(&ws.cache_path).unwrap();
    assert_eq!(raw.lines().count(), 3);

    cache.flush().unwrap();
    let raw = fs::read_to_string(&ws.cache_path).unwrap();
    assert_eq!(raw.lines().count(), 2);

    let reopened = DedupCache::open(JsonlCacheStore::new(&ws.cache_path), 1);
    let entry = reopened.lookup("a/one").unwrap();
    assert_eq!(entry.status, CacheStatus::Success);
    assert_eq!(entry.attempts, 2);
}

#[test]
fn reload_keeps_last_entry_per_key_from_appended_file() {
    let ws = workspace();
    {
        let cache = DedupCache::open(JsonlCacheStore::new(&ws.cache_path), 1);
        cache
            .put(CacheEntry::failure("a/one", CacheStatus::TransientFailure, "reset", 1))
            .unwrap();
        cache
            .put(CacheEntry::failure("a/one", CacheStatus::PermanentFailure, "404", 2))
            .unwrap();
        // Dropped without a flush: the file still holds both lines.
    }

    let reopened = DedupCache::open(JsonlCacheStore::new(&ws.cache_path), 1);
    assert_eq!(reopened.len(), 1);
    assert_eq!(
        reopened.lookup("a/one").unwrap().status,
        CacheStatus::PermanentFailure
    );
    assert_eq!(reopened.stats().permanent_failure, 1);
}

#[test]
fn flush_without_changes_writes_nothing() {
    let ws = workspace();
    let cache = DedupCache::open(JsonlCacheStore::new(&ws.cache_path), 10);
    assert!(!cache.flush().unwrap());
    assert!(!ws.cache_path.exists());
}
