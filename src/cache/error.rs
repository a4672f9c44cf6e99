//! Error type for cache operations.
//!
//! These errors stay inside the cache layer: public read/write operations log
//! them at `warn` and degrade to a miss. Only [`DiskCache::open`](super::DiskCache::open),
//! `flush` and `reset` hand them to the caller.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised by the disk cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// File system operation failed.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Index file could not be encoded or decoded.
    #[error("cache index {path} is unreadable: {source}")]
    Index {
        /// Index file path.
        path: PathBuf,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    /// Creates an I/O error for `path`.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Creates an index (de)serialization error for `path`.
    pub fn index(path: impl AsRef<Path>, source: serde_json::Error) -> Self {
        Self::Index {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}
