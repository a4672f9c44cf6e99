//! Units of work flowing through the acquisition pipeline.

use bytes::Bytes;

use crate::cache::CachedBlob;

/// One page to acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTask {
    /// Zero-based, dense, unique within the job.
    pub index: usize,
    /// Image URL.
    pub url: String,
    /// Gallery identifier.
    pub gallery_id: String,
    /// Media identifier the images live under.
    pub media_id: String,
}

impl PageTask {
    /// Creates a task.
    pub fn new(
        index: usize,
        url: impl Into<String>,
        gallery_id: impl Into<String>,
        media_id: impl Into<String>,
    ) -> Self {
        Self {
            index,
            url: url.into(),
            gallery_id: gallery_id.into(),
            media_id: media_id.into(),
        }
    }
}

/// A successfully acquired page.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// Page index.
    pub index: usize,
    /// Page bytes (after the protective pass, if enabled).
    pub bytes: Bytes,
    /// Extension matching `bytes`.
    pub extension: String,
    /// Gallery identifier.
    pub gallery_id: String,
    /// Media identifier.
    pub media_id: String,
    /// Previously transformed bytes found in the processed cache.
    pub processed: Option<CachedBlob>,
}

/// Outcome of one page task.
#[derive(Debug, Clone)]
pub enum FetchResult {
    /// The page was acquired.
    Success(PageImage),
    /// The page is permanently missing from this job.
    Failure {
        /// Page index.
        index: usize,
        /// Rendered cause.
        error: String,
    },
}

impl FetchResult {
    /// Page index of this result.
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::Success(page) => page.index,
            Self::Failure { index, .. } => *index,
        }
    }
}

/// End-of-job accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Number of tasks in the job.
    pub total: usize,
    /// Pages delivered downstream.
    pub success_count: usize,
    /// Missing pages, ascending.
    pub failed_indexes: Vec<usize>,
}

impl PipelineReport {
    /// True when no page could be acquired.
    #[must_use]
    pub fn is_total_failure(&self) -> bool {
        self.success_count == 0
    }
}
