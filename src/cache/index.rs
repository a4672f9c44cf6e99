//! Persisted cache index (`index.json`).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::CacheError;

/// Name of the index file inside a cache directory.
pub const INDEX_FILE: &str = "index.json";

/// On-disk schema version. Indexes with another version are discarded.
pub const INDEX_VERSION: u32 = 1;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One cached artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Rendered composite key.
    pub key: String,
    /// Gallery the artifact belongs to (for per-gallery clearing).
    pub gallery_id: String,
    /// Path of the backing file, relative to the cache directory.
    pub file: String,
    /// Extension of the stored artifact.
    pub extension: String,
    /// Size of the backing file.
    pub size_bytes: u64,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
    /// When the entry was last read.
    pub last_accessed_at: DateTime<Utc>,
    /// Number of hits served.
    pub access_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// Loads the index at `path`.
///
/// A missing file or a file written with a different schema version yields an
/// empty index.
pub(crate) async fn load(path: &Path) -> Result<Vec<CacheEntry>, CacheError> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CacheError::io(path, e)),
    };

    let index: IndexFile =
        serde_json::from_slice(&data).map_err(|e| CacheError::index(path, e))?;
    if index.version != INDEX_VERSION {
        warn!(
            path = %path.display(),
            found = index.version,
            expected = INDEX_VERSION,
            "discarding cache index with incompatible schema"
        );
        return Ok(Vec::new());
    }

    Ok(index.entries)
}

/// Writes the index atomically: temp file in the same directory, then rename.
pub(crate) async fn store(path: &Path, entries: Vec<CacheEntry>) -> Result<(), CacheError> {
    let index = IndexFile {
        version: INDEX_VERSION,
        entries,
    };
    let data = serde_json::to_vec_pretty(&index).map_err(|e| CacheError::index(path, e))?;
    write_atomic(path, &data).await
}

/// Writes `bytes` to `path` through a uniquely named sibling temp file.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let tmp = tmp_path(path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CacheError::io(parent, e))?;
    }

    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        remove_best_effort(&tmp).await;
        return Err(CacheError::io(&tmp, e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        remove_best_effort(&tmp).await;
        return Err(CacheError::io(path, e));
    }
    Ok(())
}

/// Copies `src` to `path` through a uniquely named sibling temp file.
pub(crate) async fn copy_atomic(src: &Path, path: &Path) -> Result<u64, CacheError> {
    let tmp = tmp_path(path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CacheError::io(parent, e))?;
    }

    let copied = match tokio::fs::copy(src, &tmp).await {
        Ok(copied) => copied,
        Err(e) => {
            remove_best_effort(&tmp).await;
            return Err(CacheError::io(src, e));
        }
    };
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        remove_best_effort(&tmp).await;
        return Err(CacheError::io(path, e));
    }
    Ok(copied)
}

/// Removes a file, treating "already gone" as success.
pub(crate) async fn remove_best_effort(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "failed to remove cache file");
            false
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = path.file_name().map(ToOwned::to_owned).unwrap_or_default();
    name.push(format!(".tmp.{}.{counter}", std::process::id()));
    path.with_file_name(name)
}
