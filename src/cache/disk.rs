//! Disk-backed artifact cache.
//!
//! Artifacts live in `{dir}/{digest[..2]}/{digest}.{ext}` where `digest` is
//! the SHA-256 of the rendered [`CacheKey`]. An in-memory index mirrors
//! `{dir}/index.json`, which is rewritten on a debounced schedule.
//!
//! Eviction and index persistence are each single-flight per instance: a
//! caller arriving while one is running waits for it and then finds nothing
//! left to do. A write holds the eviction lock from eviction until its entry
//! is indexed, so the artifact files on disk stay within the budget.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::error::CacheError;
use super::eviction::select_victims;
use super::index::{self, CacheEntry, INDEX_FILE};
use super::key::CacheKey;

/// Default size budget (1 GiB).
pub const DEFAULT_MAX_BYTES: u64 = 1024 * 1024 * 1024;

/// Default time-to-live (24 hours).
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default idle window before the index is written (5 seconds).
pub const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_secs(5);

/// Tunables for one cache instance.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Size budget in bytes.
    pub max_bytes: u64,
    /// Entries older than this are misses; `None` never expires.
    pub ttl: Option<Duration>,
    /// Idle window collapsing index writes.
    pub persist_debounce: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            ttl: Some(DEFAULT_TTL),
            persist_debounce: DEFAULT_PERSIST_DEBOUNCE,
        }
    }
}

/// Counters reported by [`DiskCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Indexed entries.
    pub entries: usize,
    /// Sum of entry sizes.
    pub total_bytes: u64,
    /// Lookups served from disk.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
}

/// A cache hit.
#[derive(Debug, Clone)]
pub struct CachedBlob {
    /// Stored bytes.
    pub bytes: Bytes,
    /// Extension recorded at write time.
    pub extension: String,
}

enum Source<'a> {
    Bytes(&'a [u8]),
    File(&'a Path),
}

#[derive(Debug)]
struct Inner {
    label: String,
    dir: PathBuf,
    index_path: PathBuf,
    options: CacheOptions,
    entries: Mutex<HashMap<String, CacheEntry>>,
    eviction: Mutex<()>,
    persist: Mutex<()>,
    generation: AtomicU64,
    persisted_generation: AtomicU64,
    persist_scheduled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Content-addressed disk cache with scored eviction.
///
/// Cheap to clone; clones share one index.
#[derive(Debug, Clone)]
pub struct DiskCache {
    inner: Arc<Inner>,
}

impl DiskCache {
    /// Opens (or creates) a cache in `dir`.
    ///
    /// Loads the persisted index, drops entries whose file is missing or whose
    /// TTL has passed, and rewrites the compacted index. A corrupt index is
    /// logged and replaced by an empty one.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the directory cannot be created or the
    /// compacted index cannot be written.
    #[instrument(skip(dir, options), fields(dir = %dir.as_ref().display()))]
    pub async fn open(
        label: &str,
        dir: impl AsRef<Path>,
        options: CacheOptions,
    ) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::io(&dir, e))?;
        let index_path = dir.join(INDEX_FILE);

        let loaded = index::load(&index_path).await.unwrap_or_else(|e| {
            warn!(cache = label, error = %e, "cache index unreadable, starting empty");
            Vec::new()
        });

        let now = Utc::now();
        let mut entries = HashMap::with_capacity(loaded.len());
        let mut dropped = 0usize;
        for entry in loaded {
            let path = dir.join(&entry.file);
            if is_expired(&entry, options.ttl, now) {
                index::remove_best_effort(&path).await;
                dropped += 1;
            } else if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                entries.insert(entry.key.clone(), entry);
            } else {
                dropped += 1;
            }
        }

        let cache = Self {
            inner: Arc::new(Inner {
                label: label.to_string(),
                dir,
                index_path,
                options,
                entries: Mutex::new(entries),
                eviction: Mutex::new(()),
                persist: Mutex::new(()),
                generation: AtomicU64::new(1),
                persisted_generation: AtomicU64::new(0),
                persist_scheduled: AtomicBool::new(false),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        };
        cache.persist_now().await?;

        let kept = cache.inner.entries.lock().await.len();
        info!(cache = label, entries = kept, dropped, "cache opened");
        Ok(cache)
    }

    /// Directory this cache lives in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Looks up `key`, returning the stored bytes on a hit.
    ///
    /// Expired entries and entries whose file vanished are removed and
    /// reported as misses.
    #[instrument(level = "debug", skip(self), fields(cache = %self.inner.label, key = %key))]
    pub async fn get(&self, key: &CacheKey) -> Option<CachedBlob> {
        let (rendered, entry) = self.lookup(key).await?;
        let path = self.inner.dir.join(&entry.file);

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                self.record_hit(&rendered).await;
                Some(CachedBlob {
                    bytes: Bytes::from(bytes),
                    extension: entry.extension,
                })
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(cache = %self.inner.label, path = %path.display(), error = %e, "cache read failed");
                }
                self.forget(&rendered, &entry).await;
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Returns the backing file of `key` without reading it.
    ///
    /// Counts as an access. The file stays owned by the cache; callers must not
    /// delete it.
    #[instrument(level = "debug", skip(self), fields(cache = %self.inner.label, key = %key))]
    pub async fn get_path(&self, key: &CacheKey) -> Option<PathBuf> {
        let (rendered, entry) = self.lookup(key).await?;
        let path = self.inner.dir.join(&entry.file);

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            self.record_hit(&rendered).await;
            Some(path)
        } else {
            self.forget(&rendered, &entry).await;
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Stores `bytes` under `key`.
    ///
    /// Evicts first if the new entry would exceed the budget. Failures are
    /// logged and reported as `false`; they never propagate.
    #[instrument(level = "debug", skip(self, bytes), fields(cache = %self.inner.label, key = %key, size = bytes.len()))]
    pub async fn set(&self, key: &CacheKey, bytes: &[u8], extension: &str) -> bool {
        self.store(key, Source::Bytes(bytes), extension).await
    }

    /// Copies the file at `src` into the cache under `key`.
    ///
    /// The source file is left in place.
    #[instrument(level = "debug", skip(self), fields(cache = %self.inner.label, key = %key))]
    pub async fn set_file(&self, key: &CacheKey, src: &Path, extension: &str) -> bool {
        self.store(key, Source::File(src), extension).await
    }

    /// Removes `key`. Returns whether an entry existed.
    pub async fn delete(&self, key: &CacheKey) -> bool {
        let removed = self.inner.entries.lock().await.remove(&key.to_string());
        match removed {
            Some(entry) => {
                index::remove_best_effort(&self.inner.dir.join(&entry.file)).await;
                self.schedule_persist();
                true
            }
            None => false,
        }
    }

    /// Removes every entry of one gallery. Returns how many were removed.
    #[instrument(skip(self), fields(cache = %self.inner.label))]
    pub async fn clear_gallery(&self, gallery_id: &str) -> usize {
        let removed: Vec<CacheEntry> = {
            let mut entries = self.inner.entries.lock().await;
            let keys: Vec<String> = entries
                .values()
                .filter(|e| e.gallery_id == gallery_id)
                .map(|e| e.key.clone())
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };

        for entry in &removed {
            index::remove_best_effort(&self.inner.dir.join(&entry.file)).await;
        }
        if !removed.is_empty() {
            info!(gallery_id, removed = removed.len(), "cleared gallery from cache");
            self.schedule_persist();
        }
        removed.len()
    }

    /// Removes every entry and writes an empty index immediately.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the empty index cannot be written.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let removed: Vec<CacheEntry> = {
            let mut entries = self.inner.entries.lock().await;
            entries.drain().map(|(_, e)| e).collect()
        };
        for entry in &removed {
            index::remove_best_effort(&self.inner.dir.join(&entry.file)).await;
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.persist_now().await?;
        info!(cache = %self.inner.label, removed = removed.len(), "cache cleared");
        Ok(removed.len())
    }

    /// Deletes the whole cache directory and starts over empty.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the directory cannot be removed or recreated.
    pub async fn reset(&self) -> Result<(), CacheError> {
        let dir = &self.inner.dir;
        self.inner.entries.lock().await.clear();
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io(dir, e)),
        }
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CacheError::io(dir, e))?;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.persist_now().await?;
        info!(cache = %self.inner.label, "cache reset");
        Ok(())
    }

    /// Current counters.
    pub async fn stats(&self) -> CacheStats {
        let entries = self.inner.entries.lock().await;
        CacheStats {
            entries: entries.len(),
            total_bytes: entries.values().map(|e| e.size_bytes).sum(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
        }
    }

    /// Writes any pending index changes now.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the index cannot be written.
    pub async fn flush(&self) -> Result<(), CacheError> {
        self.persist_now().await
    }

    /// Flushes pending index changes before shutdown.
    pub async fn dispose(&self) {
        if let Err(e) = self.flush().await {
            warn!(cache = %self.inner.label, error = %e, "failed to flush cache index on shutdown");
        }
    }

    async fn lookup(&self, key: &CacheKey) -> Option<(String, CacheEntry)> {
        let rendered = key.to_string();
        let found = self.inner.entries.lock().await.get(&rendered).cloned();

        let Some(entry) = found else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if is_expired(&entry, self.inner.options.ttl, Utc::now()) {
            debug!(key = %rendered, "cache entry expired");
            self.forget(&rendered, &entry).await;
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        Some((rendered, entry))
    }

    async fn record_hit(&self, rendered: &str) {
        if let Some(entry) = self.inner.entries.lock().await.get_mut(rendered) {
            entry.last_accessed_at = Utc::now();
            entry.access_count += 1;
        }
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
        self.schedule_persist();
    }

    /// Drops `entry` from the index unless it was replaced meanwhile.
    async fn forget(&self, rendered: &str, entry: &CacheEntry) {
        {
            let mut entries = self.inner.entries.lock().await;
            if entries
                .get(rendered)
                .is_some_and(|current| current.created_at == entry.created_at)
            {
                entries.remove(rendered);
            }
        }
        index::remove_best_effort(&self.inner.dir.join(&entry.file)).await;
        self.schedule_persist();
    }

    async fn store(&self, key: &CacheKey, source: Source<'_>, extension: &str) -> bool {
        match self.try_store(key, source, extension).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(cache = %self.inner.label, key = %key, error = %e, "cache write failed");
                false
            }
        }
    }

    async fn try_store(
        &self,
        key: &CacheKey,
        source: Source<'_>,
        extension: &str,
    ) -> Result<bool, CacheError> {
        let size = match &source {
            Source::Bytes(bytes) => bytes.len() as u64,
            Source::File(path) => tokio::fs::metadata(path)
                .await
                .map_err(|e| CacheError::io(path, e))?
                .len(),
        };
        if size > self.inner.options.max_bytes {
            debug!(size, max = self.inner.options.max_bytes, "artifact larger than cache budget");
            return Ok(false);
        }

        let rendered = key.to_string();
        let extension = sanitize_extension(extension);
        let digest = key.digest();
        let file = format!("{}/{digest}.{extension}", &digest[..2]);
        let path = self.inner.dir.join(&file);

        let _in_flight = self.inner.eviction.lock().await;
        self.evict_for(&rendered, size).await;

        let size = match source {
            Source::Bytes(bytes) => {
                index::write_atomic(&path, bytes).await?;
                size
            }
            Source::File(src) => index::copy_atomic(src, &path).await?,
        };

        let now = Utc::now();
        let entry = CacheEntry {
            key: rendered.clone(),
            gallery_id: key.gallery_id.clone(),
            file,
            extension,
            size_bytes: size,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
        };

        let replaced = self.inner.entries.lock().await.insert(rendered, entry);
        if let Some(old) = replaced.filter(|old| self.inner.dir.join(&old.file) != path) {
            index::remove_best_effort(&self.inner.dir.join(&old.file)).await;
        }
        self.schedule_persist();
        Ok(true)
    }

    /// Evicts until `incoming` bytes fit. Caller holds the eviction lock.
    async fn evict_for(&self, rendered: &str, incoming: u64) {
        let max = self.inner.options.max_bytes;
        if self.projected_bytes(rendered, incoming).await <= max {
            return;
        }

        let victims: Vec<CacheEntry> = {
            let mut entries = self.inner.entries.lock().await;
            let keys = select_victims(
                entries.values().filter(|e| e.key != rendered),
                incoming,
                max,
                Utc::now(),
            );
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        if victims.is_empty() {
            return;
        }

        let mut freed = 0u64;
        for victim in &victims {
            index::remove_best_effort(&self.inner.dir.join(&victim.file)).await;
            freed += victim.size_bytes;
        }
        info!(
            cache = %self.inner.label,
            evicted = victims.len(),
            freed_bytes = freed,
            "cache eviction"
        );
        self.schedule_persist();
    }

    async fn projected_bytes(&self, rendered: &str, incoming: u64) -> u64 {
        let entries = self.inner.entries.lock().await;
        entries
            .values()
            .filter(|e| e.key != rendered)
            .map(|e| e.size_bytes)
            .sum::<u64>()
            .saturating_add(incoming)
    }

    /// Marks the index dirty and arms the debounced writer if idle.
    fn schedule_persist(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if self.inner.persist_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let debounce = self.inner.options.persist_debounce;
        tokio::spawn(async move {
            let mut seen = match weak.upgrade() {
                Some(inner) => inner.generation.load(Ordering::SeqCst),
                None => return,
            };
            loop {
                tokio::time::sleep(debounce).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let current = inner.generation.load(Ordering::SeqCst);
                if current == seen {
                    inner.persist_scheduled.store(false, Ordering::SeqCst);
                    let cache = DiskCache { inner };
                    if let Err(e) = cache.persist_now().await {
                        warn!(cache = %cache.inner.label, error = %e, "failed to persist cache index");
                    }
                    return;
                }
                seen = current;
            }
        });
    }

    /// Writes the index unless an earlier write already covered every change.
    async fn persist_now(&self) -> Result<(), CacheError> {
        let requested = self.inner.generation.load(Ordering::SeqCst);
        let _in_flight = self.inner.persist.lock().await;
        if self.inner.persisted_generation.load(Ordering::SeqCst) >= requested {
            return Ok(());
        }

        let (generation, mut snapshot) = {
            let entries = self.inner.entries.lock().await;
            (
                self.inner.generation.load(Ordering::SeqCst),
                entries.values().cloned().collect::<Vec<_>>(),
            )
        };
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        let count = snapshot.len();

        index::store(&self.inner.index_path, snapshot).await?;
        self.inner
            .persisted_generation
            .fetch_max(generation, Ordering::SeqCst);
        debug!(cache = %self.inner.label, entries = count, "cache index persisted");
        Ok(())
    }
}

fn is_expired(entry: &CacheEntry, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
    ttl.is_some_and(|ttl| {
        (now - entry.created_at)
            .to_std()
            .is_ok_and(|age| age >= ttl)
    })
}

fn sanitize_extension(extension: &str) -> String {
    let ext = extension.trim_start_matches('.').to_ascii_lowercase();
    if !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        ext
    } else {
        "bin".to_string()
    }
}
