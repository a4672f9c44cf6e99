//! Error types for the download module.
//!
//! [`DownloadError`] describes one failed HTTP attempt against one candidate
//! URL. [`FetchError`] is the terminal, page-level failure returned once every
//! host and extension candidate has been exhausted.

use thiserror::Error;

/// Errors that can occur during a single download attempt.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection reset, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The server answered 2xx but the body is not an image.
    #[error("response from {url} is not an image (Content-Type: {content_type})")]
    NotAnImage {
        /// The URL that returned a non-image body.
        url: String,
        /// The content type the server reported, or `N/A`.
        content_type: String,
    },

    /// The body exceeded the configured size cap.
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge {
        /// The URL whose body was too large.
        url: String,
        /// The configured byte limit.
        limit: u64,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a non-image response error.
    pub fn not_an_image(url: impl Into<String>, content_type: Option<&str>) -> Self {
        Self::NotAnImage {
            url: url.into(),
            content_type: content_type.unwrap_or("N/A").to_string(),
        }
    }

    /// Creates a body-too-large error.
    pub fn too_large(url: impl Into<String>, limit: u64) -> Self {
        Self::TooLarge {
            url: url.into(),
            limit,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Returns true for timeout-class failures, which back off more steeply.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
            || matches!(self, Self::HttpStatus { status: 408, .. })
    }
}

/// Terminal failure for one page after every candidate URL was tried.
#[derive(Debug, Error)]
pub enum FetchError {
    /// All hosts and extensions failed.
    #[error("page {index}: all {candidates} host/format candidates failed (last error: {last_error})")]
    Exhausted {
        /// Zero-based page index.
        index: usize,
        /// How many candidate URLs were tried.
        candidates: usize,
        /// Rendered message of the final attempt's error.
        last_error: String,
    },

    /// The task URL could not be parsed, so no candidates could be built.
    #[error("page {index}: invalid URL {url}")]
    InvalidUrl {
        /// Zero-based page index.
        index: usize,
        /// The malformed URL.
        url: String,
    },
}

impl FetchError {
    /// Returns the page index this failure belongs to.
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::Exhausted { index, .. } | Self::InvalidUrl { index, .. } => *index,
        }
    }
}
