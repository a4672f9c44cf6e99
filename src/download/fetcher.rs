//! Resource fetcher with host/extension fallback and per-gallery host affinity.
//!
//! A [`ResourceFetcher`] turns one page URL into an ordered list of candidate
//! URLs and walks it until one yields an image:
//!
//! 1. The URL's own authority, or the authority that last succeeded for the
//!    same gallery when affinity is enabled.
//! 2. The fallback authorities for the host family (`i2/i3/i4` for image
//!    hosts, `t2/t3/t4` for thumbnail hosts).
//!
//! For each authority the original extension is tried first, then the
//! alternate extensions. Each candidate gets its own retry budget.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::client::HttpClient;
use super::constants::{FALLBACK_EXTENSIONS, IMAGE_HOST_FALLBACK, THUMB_HOST_FALLBACK};
use super::error::{DownloadError, FetchError};
use super::retry::{RetryDecision, RetryPolicy, classify_error};

/// Site whose gallery pages are sent as the `Referer`.
pub const DEFAULT_REFERER_BASE: &str = "https://nhentai.net";

/// One page download request.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    /// Zero-based page index, carried into errors.
    pub index: usize,
    /// URL as produced by the metadata resolver.
    pub url: &'a str,
    /// Gallery the page belongs to (affinity and referer key).
    pub gallery_id: &'a str,
}

/// Bytes of a page together with where they actually came from.
#[derive(Debug, Clone)]
pub struct FetchedResource {
    /// Image body.
    pub bytes: Bytes,
    /// Extension of the candidate that succeeded (may differ from the request).
    pub extension: String,
    /// Authority (`host` or `host:port`) that served the bytes.
    pub authority: String,
    /// Full candidate URL that succeeded.
    pub url: String,
}

/// Anything that can fetch one page.
///
/// The acquisition pipeline depends on this trait rather than on
/// [`ResourceFetcher`] directly so tests can script failures and delays.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetches one page, exhausting every fallback before failing.
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<FetchedResource, FetchError>;

    /// Drops per-gallery state once a job for `gallery_id` is over.
    fn release_gallery(&self, _gallery_id: &str) {}
}

/// Tunables for [`ResourceFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherOptions {
    /// Retry budget applied to each candidate URL.
    pub retry: RetryPolicy,
    /// Prefer the authority that last succeeded for the same gallery.
    pub host_affinity: bool,
    /// Fallback authorities for full-size image hosts.
    pub image_fallback: Vec<String>,
    /// Fallback authorities for thumbnail hosts.
    pub thumb_fallback: Vec<String>,
    /// Extensions tried after the original one.
    pub fallback_extensions: Vec<String>,
    /// Base of the `Referer` header (`{base}/g/{gallery_id}/`), or none.
    pub referer_base: Option<String>,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            host_affinity: true,
            image_fallback: IMAGE_HOST_FALLBACK.iter().map(ToString::to_string).collect(),
            thumb_fallback: THUMB_HOST_FALLBACK.iter().map(ToString::to_string).collect(),
            fallback_extensions: FALLBACK_EXTENSIONS.iter().map(ToString::to_string).collect(),
            referer_base: Some(DEFAULT_REFERER_BASE.to_string()),
        }
    }
}

/// Fetches page images with fallback and affinity.
///
/// Cheap to clone; clones share the HTTP connection pool and affinity map.
#[derive(Debug, Clone)]
pub struct ResourceFetcher {
    client: HttpClient,
    options: Arc<FetcherOptions>,
    affinity: Arc<DashMap<String, String>>,
}

impl ResourceFetcher {
    /// Creates a fetcher over a shared HTTP client.
    #[must_use]
    pub fn new(client: HttpClient, options: FetcherOptions) -> Self {
        Self {
            client,
            options: Arc::new(options),
            affinity: Arc::new(DashMap::new()),
        }
    }

    /// Returns the authority that last succeeded for `gallery_id`, if any.
    #[must_use]
    pub fn preferred_authority(&self, gallery_id: &str) -> Option<String> {
        self.affinity.get(gallery_id).map(|entry| entry.value().clone())
    }

    /// Forgets the affinity record of one gallery.
    pub fn forget_gallery(&self, gallery_id: &str) {
        self.affinity.remove(gallery_id);
    }

    /// Builds the ordered candidate list for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidUrl`] if `url` has no host.
    pub fn candidates(&self, url: &str, gallery_id: &str) -> Result<Vec<Candidate>, DownloadError> {
        let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| DownloadError::invalid_url(url))?;
        let own_authority = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let fallback = if host.starts_with('t') {
            &self.options.thumb_fallback
        } else {
            &self.options.image_fallback
        };

        let mut authorities: Vec<String> = Vec::with_capacity(fallback.len() + 1);
        authorities.push(own_authority);
        for authority in fallback {
            if !authorities.contains(authority) {
                authorities.push(authority.clone());
            }
        }

        if self.options.host_affinity {
            if let Some(preferred) = self.preferred_authority(gallery_id) {
                if let Some(position) = authorities.iter().position(|a| *a == preferred) {
                    let preferred = authorities.remove(position);
                    authorities.insert(0, preferred);
                }
            }
        }

        let original_ext = path_extension(&parsed);
        let mut extensions: Vec<Option<String>> = vec![original_ext.clone()];
        if original_ext.is_some() {
            extensions.extend(
                self.options
                    .fallback_extensions
                    .iter()
                    .filter(|ext| Some(*ext) != original_ext.as_ref())
                    .map(|ext| Some(ext.clone())),
            );
        }

        let mut candidates = Vec::with_capacity(authorities.len() * extensions.len());
        for authority in &authorities {
            let Some(with_host) = with_authority(&parsed, authority) else {
                warn!(%authority, "skipping malformed fallback authority");
                continue;
            };
            for ext in &extensions {
                let url = match (ext, &original_ext) {
                    (Some(ext), Some(original)) if ext != original => {
                        with_extension(&with_host, original, ext)
                    }
                    _ => with_host.clone(),
                };
                candidates.push(Candidate {
                    url: url.to_string(),
                    authority: authority.clone(),
                    extension: ext.clone().unwrap_or_else(|| "jpg".to_string()),
                });
            }
        }

        Ok(candidates)
    }

    fn referer(&self, gallery_id: &str) -> Option<String> {
        self.options
            .referer_base
            .as_ref()
            .map(|base| format!("{}/g/{gallery_id}/", base.trim_end_matches('/')))
    }

    /// Attempts one candidate URL within the retry budget.
    async fn attempt_candidate(
        &self,
        candidate: &Candidate,
        referer: Option<&str>,
    ) -> Result<Bytes, DownloadError> {
        let policy = &self.options.retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(url = %candidate.url, attempt, "attempting page download");

            match self.client.fetch_image(&candidate.url, referer).await {
                Ok(response) => return Ok(response.bytes),
                Err(e) => match policy.should_retry(classify_error(&e), attempt) {
                    RetryDecision::Retry {
                        delay,
                        attempt: next_attempt,
                    } => {
                        debug!(
                            url = %candidate.url,
                            attempt = next_attempt,
                            max_attempts = policy.max_attempts(),
                            delay_ms = delay.as_millis(),
                            error = %e,
                            "retrying candidate"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        debug!(url = %candidate.url, %reason, error = %e, "candidate failed");
                        return Err(e);
                    }
                },
            }
        }
    }
}

#[async_trait]
impl PageFetcher for ResourceFetcher {
    #[instrument(skip(self, request), fields(index = request.index, gallery_id = %request.gallery_id))]
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<FetchedResource, FetchError> {
        let candidates = self
            .candidates(request.url, request.gallery_id)
            .map_err(|_| FetchError::InvalidUrl {
                index: request.index,
                url: request.url.to_string(),
            })?;
        let referer = self.referer(request.gallery_id);

        let mut last_error: Option<DownloadError> = None;
        let mut last_authority: Option<&str> = None;

        for candidate in &candidates {
            if last_authority.is_some_and(|a| a != candidate.authority) {
                debug!(host = %last_authority.unwrap_or_default(), "host failed, switching");
            }
            last_authority = Some(&candidate.authority);

            match self.attempt_candidate(candidate, referer.as_deref()).await {
                Ok(bytes) => {
                    if self.options.host_affinity {
                        self.affinity
                            .insert(request.gallery_id.to_string(), candidate.authority.clone());
                    }
                    return Ok(FetchedResource {
                        bytes,
                        extension: candidate.extension.clone(),
                        authority: candidate.authority.clone(),
                        url: candidate.url.clone(),
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        let last_error = last_error.map_or_else(|| "no candidates".to_string(), |e| e.to_string());
        info!(
            index = request.index,
            candidates = candidates.len(),
            %last_error,
            "page failed on every host and format"
        );
        Err(FetchError::Exhausted {
            index: request.index,
            candidates: candidates.len(),
            last_error,
        })
    }

    fn release_gallery(&self, gallery_id: &str) {
        self.forget_gallery(gallery_id);
    }
}

/// One URL the fetcher will try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Full URL.
    pub url: String,
    /// Authority substituted into the URL.
    pub authority: String,
    /// Extension the URL ends with.
    pub extension: String,
}

fn path_extension(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

fn with_authority(url: &Url, authority: &str) -> Option<Url> {
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, Some(port.parse::<u16>().ok()?)),
        None => (authority, None),
    };
    let mut out = url.clone();
    out.set_host(Some(host)).ok()?;
    out.set_port(port).ok()?;
    Some(out)
}

fn with_extension(url: &Url, original: &str, ext: &str) -> Url {
    let mut out = url.clone();
    let path = url.path();
    if let Some(stem) = path.strip_suffix(&format!(".{original}")) {
        out.set_path(&format!("{stem}.{ext}"));
    } else if let Some(dot) = path.rfind('.') {
        out.set_path(&format!("{}.{ext}", &path[..dot]));
    }
    out
}
