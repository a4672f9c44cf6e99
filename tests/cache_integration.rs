//! Integration tests for the disk cache.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use gallery_core::cache::{CacheKey, CacheOptions, DiskCache, INDEX_FILE, TransformProfile};
use tempfile::TempDir;

fn options(max_bytes: u64) -> CacheOptions {
    CacheOptions {
        max_bytes,
        ttl: None,
        persist_debounce: Duration::from_millis(20),
    }
}

fn page(index: usize) -> CacheKey {
    CacheKey::original("42", "100", index)
}

/// Bytes of finished artifact files under the shard directories.
fn artifact_bytes_on_disk(dir: &Path) -> u64 {
    let Ok(shards) = std::fs::read_dir(dir) else {
        return 0;
    };
    shards
        .flatten()
        .filter(|shard| shard.path().is_dir())
        .filter_map(|shard| std::fs::read_dir(shard.path()).ok())
        .flat_map(|files| files.flatten())
        .filter(|file| !file.file_name().to_string_lossy().contains(".tmp."))
        .filter_map(|file| file.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

fn indexed_entries(dir: &Path) -> usize {
    let raw = std::fs::read(dir.join(INDEX_FILE)).expect("index should exist");
    let json: serde_json::Value = serde_json::from_slice(&raw).expect("index should be JSON");
    json["entries"].as_array().map_or(0, Vec::len)
}

// ==================== Read/Write Tests ====================

#[tokio::test]
async fn test_set_then_get_round_trips_bytes_and_extension() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open("raw", dir.path(), options(1024)).await.unwrap();

    assert!(cache.get(&page(0)).await.is_none());
    assert!(cache.set(&page(0), b"jpeg-bytes", "JPG").await);

    let hit = cache.get(&page(0)).await.expect("entry should be cached");
    assert_eq!(hit.bytes.as_ref(), b"jpeg-bytes");
    assert_eq!(hit.extension, "jpg");

    let stats = cache.stats().await;
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.total_bytes, 10);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    cache.dispose().await;
}

#[tokio::test]
async fn test_variants_do_not_collide() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open("mixed", dir.path(), options(1024)).await.unwrap();

    let processed_key = CacheKey::processed("42", "100", 3, TransformProfile::default());
    cache.set(&CacheKey::original("42", "100", 3), b"raw", "png").await;
    cache.set(&processed_key, b"processed", "jpg").await;

    let raw = cache.get(&CacheKey::original("42", "100", 3)).await.unwrap();
    let processed = cache.get(&processed_key).await.unwrap();
    assert_eq!(raw.bytes.as_ref(), b"raw");
    assert_eq!(processed.bytes.as_ref(), b"processed");
    cache.dispose().await;
}

#[tokio::test]
async fn test_overwrite_replaces_entry() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open("raw", dir.path(), options(1024)).await.unwrap();

    cache.set(&page(0), b"first", "png").await;
    cache.set(&page(0), b"second!", "jpg").await;

    let hit = cache.get(&page(0)).await.unwrap();
    assert_eq!(hit.bytes.as_ref(), b"second!");
    assert_eq!(hit.extension, "jpg");
    let stats = cache.stats().await;
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.total_bytes, 7);
    cache.dispose().await;
}

#[tokio::test]
async fn test_oversized_artifact_is_not_stored() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open("raw", dir.path(), options(8)).await.unwrap();

    assert!(!cache.set(&page(0), b"way too large", "jpg").await);
    assert_eq!(cache.stats().await.entries, 0);
    cache.dispose().await;
}

#[tokio::test]
async fn test_document_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open("documents", dir.path().join("docs"), options(4096))
        .await
        .unwrap();
    let source = dir.path().join("temp_42.pdf");
    std::fs::write(&source, b"%PDF-1.4 test").unwrap();

    let key = CacheKey::document("42", "100", Some("secret"), TransformProfile::default());
    assert!(cache.set_file(&key, &source, "pdf").await);
    assert!(source.exists(), "source file stays in place");

    let cached = cache.get_path(&key).await.expect("document should be cached");
    assert_ne!(cached, source);
    assert_eq!(std::fs::read(&cached).unwrap(), b"%PDF-1.4 test");

    // A different password is a different document
    assert!(cache
            .get_path(&CacheKey::document("42", "100", None, TransformProfile::default()))
            .await
            .is_none());
    cache.dispose().await;
}

// ==================== Eviction Tests ====================

#[tokio::test]
async fn test_eviction_shrinks_to_seventy_percent_and_keeps_hot_entries() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open("raw", dir.path(), options(1000)).await.unwrap();
    let blob = vec![7u8; 100];

    for index in 0..10 {
        assert!(cache.set(&page(index), &blob, "jpg").await);
    }
    assert_eq!(cache.stats().await.total_bytes, 1000);

    // Page 0 is read repeatedly, which outweighs its age
    for _ in 0..3 {
        assert!(cache.get(&page(0)).await.is_some());
    }

    assert!(cache.set(&page(10), &blob, "jpg").await);

    let stats = cache.stats().await;
    assert!(stats.total_bytes <= 700, "total after eviction: {}", stats.total_bytes);
    assert!(cache.get(&page(0)).await.is_some(), "hot entry should survive");
    assert!(cache.get(&page(10)).await.is_some(), "new entry should be stored");
    cache.dispose().await;
}

#[tokio::test]
async fn test_eviction_keeps_exactly_the_most_used_entries() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open("raw", dir.path(), options(1000)).await.unwrap();
    let blob = vec![3u8; 100];

    for index in 0..10 {
        assert!(cache.set(&page(index), &blob, "jpg").await);
    }
    // Page i is read i times; one hit outweighs any age gap in this test
    for index in 0..10 {
        for _ in 0..index {
            assert!(cache.get(&page(index)).await.is_some());
        }
    }

    assert!(cache.set(&page(10), &blob, "jpg").await);

    let stats = cache.stats().await;
    assert_eq!(stats.entries, 7);
    assert_eq!(stats.total_bytes, 700);
    for index in 0..4 {
        assert!(cache.get(&page(index)).await.is_none(), "page {index} should be evicted");
    }
    for index in 4..=10 {
        assert!(cache.get(&page(index)).await.is_some(), "page {index} should survive");
    }
    cache.dispose().await;
}

#[tokio::test]
async fn test_concurrent_writes_never_exceed_budget() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open("raw", dir.path(), options(2000)).await.unwrap();

    let mut handles = Vec::new();
    for index in 0..40 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            cache.set(&page(index), &[1u8; 150], "jpg").await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    let stats = cache.stats().await;
    assert!(stats.total_bytes <= 2000, "total: {}", stats.total_bytes);
    assert!(stats.entries > 0);
    cache.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_files_on_disk_stay_within_budget_during_concurrent_writes() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open("raw", dir.path(), options(1000)).await.unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let peak = Arc::new(AtomicU64::new(0));
    let sampler = {
        let stop = Arc::clone(&stop);
        let peak = Arc::clone(&peak);
        let root = dir.path().to_path_buf();
        std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                peak.fetch_max(artifact_bytes_on_disk(&root), Ordering::SeqCst);
            }
        })
    };

    let mut handles = Vec::new();
    for index in 0..60 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            cache.set(&page(index), &[9u8; 100], "jpg").await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }
    stop.store(true, Ordering::SeqCst);
    sampler.join().unwrap();

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 1000, "peak bytes on disk: {peak}");
    assert!(artifact_bytes_on_disk(dir.path()) <= 1000);
    cache.dispose().await;
}

// ==================== Expiry Tests ====================

#[tokio::test]
async fn test_expired_entries_are_misses() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(
        "raw",
        dir.path(),
        CacheOptions {
            ttl: Some(Duration::from_millis(50)),
            ..options(1024)
        },
    )
    .await
    .unwrap();

    cache.set(&page(0), b"short-lived", "jpg").await;
    assert!(cache.get(&page(0)).await.is_some());

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(cache.get(&page(0)).await.is_none());
    assert_eq!(cache.stats().await.entries, 0);
    cache.dispose().await;
}

#[tokio::test]
async fn test_reopen_drops_expired_entries() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open("raw", dir.path(), options(1024)).await.unwrap();
    cache.set(&page(0), b"old", "jpg").await;
    cache.dispose().await;
    drop(cache);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let reopened = DiskCache::open(
        "raw",
        dir.path(),
        CacheOptions {
            ttl: Some(Duration::from_millis(30)),
            ..options(1024)
        },
    )
    .await
    .unwrap();

    assert_eq!(reopened.stats().await.entries, 0);
    assert_eq!(indexed_entries(dir.path()), 0);
    reopened.dispose().await;
}

// ==================== Persistence Tests ====================

#[tokio::test]
async fn test_index_written_after_debounce() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open("raw", dir.path(), options(1024)).await.unwrap();
    assert_eq!(indexed_entries(dir.path()), 0);

    cache.set(&page(0), b"a", "jpg").await;
    cache.set(&page(1), b"b", "jpg").await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(indexed_entries(dir.path()), 2);
    cache.dispose().await;
}

#[tokio::test]
async fn test_dispose_flushes_pending_index() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(
        "raw",
        dir.path(),
        CacheOptions {
            persist_debounce: Duration::from_secs(60),
            ..options(1024)
        },
    )
    .await
    .unwrap();

    cache.set(&page(0), b"a", "jpg").await;
    assert_eq!(indexed_entries(dir.path()), 0, "write is still debounced");

    cache.dispose().await;
    assert_eq!(indexed_entries(dir.path()), 1);
}

#[tokio::test]
async fn test_reopen_restores_entries_and_skips_missing_files() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open("raw", dir.path(), options(1024)).await.unwrap();
    cache.set(&page(0), b"kept", "jpg").await;
    cache.set(&page(1), b"lost", "png").await;
    cache.dispose().await;
    drop(cache);

    let digest = page(1).digest();
    std::fs::remove_file(dir.path().join(&digest[..2]).join(format!("{digest}.png"))).unwrap();

    let reopened = DiskCache::open("raw", dir.path(), options(1024)).await.unwrap();
    assert_eq!(reopened.stats().await.entries, 1);
    assert_eq!(reopened.get(&page(0)).await.unwrap().bytes.as_ref(), b"kept");
    assert!(reopened.get(&page(1)).await.is_none());
    reopened.dispose().await;
}

#[tokio::test]
async fn test_corrupt_index_starts_empty() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(INDEX_FILE), b"{ not json").unwrap();

    let cache = DiskCache::open("raw", dir.path(), options(1024)).await.unwrap();
    assert_eq!(cache.stats().await.entries, 0);
    assert_eq!(indexed_entries(dir.path()), 0);
    cache.dispose().await;
}

// ==================== Maintenance Tests ====================

#[tokio::test]
async fn test_clear_gallery_only_touches_that_gallery() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open("raw", dir.path(), options(4096)).await.unwrap();
    for index in 0..3 {
        cache.set(&CacheKey::original("42", "100", index), b"x", "jpg").await;
    }
    cache.set(&CacheKey::original("7", "200", 0), b"y", "jpg").await;

    assert_eq!(cache.clear_gallery("42").await, 3);
    assert_eq!(cache.stats().await.entries, 1);
    assert!(cache.get(&CacheKey::original("7", "200", 0)).await.is_some());
    cache.dispose().await;
}

#[tokio::test]
async fn test_clear_and_reset() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open("raw", dir.path(), options(4096)).await.unwrap();
    cache.set(&page(0), b"x", "jpg").await;
    cache.set(&page(1), b"y", "jpg").await;

    assert_eq!(cache.clear().await.unwrap(), 2);
    assert_eq!(indexed_entries(dir.path()), 0);

    cache.set(&page(2), b"z", "jpg").await;
    cache.reset().await.unwrap();
    assert_eq!(cache.stats().await.entries, 0);
    assert!(cache.get(&page(2)).await.is_none());
}
