//! Gallery metadata resolution.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Default metadata API base URL.
pub const DEFAULT_API_BASE: &str = "https://nhentai.net/api";

/// Titles of a gallery; any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GalleryTitle {
    /// English title.
    #[serde(default)]
    pub english: Option<String>,
    /// Japanese title.
    #[serde(default)]
    pub japanese: Option<String>,
    /// Display title without bracketed tags.
    #[serde(default)]
    pub pretty: Option<String>,
}

/// What the orchestrator needs to know about a gallery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryMetadata {
    /// Gallery identifier.
    pub id: String,
    /// Media identifier the images live under.
    pub media_id: String,
    /// Titles.
    pub title: GalleryTitle,
    /// Extension hint of every page, in page order.
    pub page_extensions: Vec<String>,
}

/// Errors raised while resolving metadata.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The API could not be reached.
    #[error("metadata request for gallery {gallery_id} failed: {source}")]
    Network {
        /// Requested gallery.
        gallery_id: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The gallery does not exist.
    #[error("gallery {gallery_id} not found")]
    NotFound {
        /// Requested gallery.
        gallery_id: String,
    },

    /// The API answered with an unexpected status.
    #[error("metadata API returned HTTP {status} for gallery {gallery_id}")]
    HttpStatus {
        /// Requested gallery.
        gallery_id: String,
        /// Response status.
        status: u16,
    },

    /// The API answered with something that is not a gallery record.
    #[error("invalid metadata for gallery {gallery_id}: {reason}")]
    InvalidResponse {
        /// Requested gallery.
        gallery_id: String,
        /// What was wrong.
        reason: String,
    },
}

impl ResolveError {
    /// Creates an invalid-response error.
    pub fn invalid_response(gallery_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            gallery_id: gallery_id.into(),
            reason: reason.into(),
        }
    }
}

/// Source of gallery metadata.
#[async_trait]
pub trait GalleryResolver: Send + Sync {
    /// Looks up one gallery.
    async fn resolve(&self, gallery_id: &str) -> Result<GalleryMetadata, ResolveError>;
}

// ==================== API Response Types ====================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiId {
    Number(u64),
    Text(String),
}

impl ApiId {
    fn into_string(self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiGallery {
    id: ApiId,
    media_id: ApiId,
    #[serde(default)]
    title: GalleryTitle,
    images: ApiImages,
}

#[derive(Debug, Deserialize)]
struct ApiImages {
    pages: Vec<ApiImage>,
}

#[derive(Debug, Deserialize)]
struct ApiImage {
    t: String,
}

/// Maps the API's one-letter image type to an extension.
#[must_use]
pub fn extension_for_type(t: &str) -> &'static str {
    match t {
        "p" => "png",
        "g" => "gif",
        "w" => "webp",
        _ => "jpg",
    }
}

// ==================== ApiGalleryResolver ====================

/// Resolves galleries through the JSON API (`{base}/gallery/{id}`).
#[derive(Debug, Clone)]
pub struct ApiGalleryResolver {
    client: Client,
    base_url: String,
}

impl ApiGalleryResolver {
    /// Creates a resolver for the public API.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self::with_base_url(client, DEFAULT_API_BASE)
    }

    /// Creates a resolver against a custom base URL (for testing with wiremock).
    #[must_use]
    pub fn with_base_url(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl GalleryResolver for ApiGalleryResolver {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn resolve(&self, gallery_id: &str) -> Result<GalleryMetadata, ResolveError> {
        if gallery_id.is_empty() || !gallery_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(ResolveError::invalid_response(
                gallery_id,
                "gallery id must be numeric",
            ));
        }

        let url = format!("{}/gallery/{gallery_id}", self.base_url);
        debug!(api_url = %url, "requesting gallery metadata");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| ResolveError::Network {
                gallery_id: gallery_id.to_string(),
                source,
            })?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(ResolveError::NotFound {
                gallery_id: gallery_id.to_string(),
            });
        }
        if !status.is_success() {
            warn!(status = status.as_u16(), "metadata API error");
            return Err(ResolveError::HttpStatus {
                gallery_id: gallery_id.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| ResolveError::Network {
                gallery_id: gallery_id.to_string(),
                source,
            })?;
        let gallery: ApiGallery = serde_json::from_slice(&body)
            .map_err(|e| ResolveError::invalid_response(gallery_id, e.to_string()))?;

        let metadata = GalleryMetadata {
            id: gallery.id.into_string(),
            media_id: gallery.media_id.into_string(),
            title: gallery.title,
            page_extensions: gallery
                .images
                .pages
                .iter()
                .map(|p| extension_for_type(&p.t).to_string())
                .collect(),
        };
        debug!(
            media_id = %metadata.media_id,
            pages = metadata.page_extensions.len(),
            "gallery metadata resolved"
        );
        Ok(metadata)
    }
}
