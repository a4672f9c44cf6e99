//! Packagers: turn the ordered page stream into a deliverable artifact.
//!
//! - [`ArchivePackager`]: in-memory zip, AES-256 entries when a password is set
//! - [`DocumentPackager`]: PDF streamed to a temp file, optional password
//!
//! Both consume pages through [`PageSource`] and never reorder them.

mod archive;
mod document;
pub mod pdf;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::{PageImage, PageStream};

pub use archive::{ArchiveArtifact, ArchiveOptions, ArchivePackager, DEFAULT_COMPRESSION_LEVEL};
pub use document::{
    DEFAULT_PROGRESS_EVERY, DEFAULT_RECOMPRESSION_THRESHOLD_KB, DocumentArtifact, DocumentOptions,
    DocumentPackager, DocumentProgressFn,
};

/// Ordered supply of pages for a packager.
#[async_trait]
pub trait PageSource: Send {
    /// Next page, or `None` when the source is exhausted.
    async fn next_page(&mut self) -> Option<PageImage>;
}

#[async_trait]
impl PageSource for PageStream {
    async fn next_page(&mut self) -> Option<PageImage> {
        self.next().await
    }
}

#[async_trait]
impl PageSource for std::vec::IntoIter<PageImage> {
    async fn next_page(&mut self) -> Option<PageImage> {
        self.next()
    }
}

/// Errors raised while packaging.
#[derive(Debug, Error)]
pub enum PackageError {
    /// Writing the output failed.
    #[error("failed to write {path}: {source}")]
    Io {
        /// File being written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The zip writer failed.
    #[error("archive error: {source}")]
    Archive {
        /// Underlying error.
        #[source]
        source: zip::result::ZipError,
    },

    /// A blocking packaging task panicked or was cancelled.
    #[error("packaging worker failed: {reason}")]
    Worker {
        /// Join error message.
        reason: String,
    },

    /// Not a single page could be packaged.
    #[error("no pages to package")]
    NoPages,

    /// The job was cancelled while packaging.
    #[error("packaging aborted")]
    Aborted,
}

impl PackageError {
    /// Creates an I/O error for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an archive error.
    #[must_use]
    pub fn archive(source: zip::result::ZipError) -> Self {
        Self::Archive { source }
    }

    /// Creates an error for a blocking task that did not complete.
    #[must_use]
    pub fn worker(source: tokio::task::JoinError) -> Self {
        Self::Worker {
            reason: source.to_string(),
        }
    }
}

// Note: we do NOT define module-local Result aliases.
