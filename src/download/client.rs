//! HTTP client wrapper for downloading page images.
//!
//! This module provides the `HttpClient` struct which performs one GET
//! attempt, validates that the response is an image and buffers the body
//! with a size cap.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, REFERER};
use tracing::{debug, instrument};

use super::constants::{CONNECT_TIMEOUT_SECS, MAX_BODY_BYTES, REQUEST_TIMEOUT_SECS};
use super::error::DownloadError;

/// User-Agent sent with every request.
pub const DEFAULT_USER_AGENT: &str = concat!("gallery-fetch/", env!("CARGO_PKG_VERSION"));

/// HTTP client for fetching images into memory.
///
/// This client is designed to be created once and reused for every page of
/// every job, taking advantage of connection pooling.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    max_body_bytes: u64,
}

/// A successfully fetched image body.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    /// Raw response body.
    pub bytes: Bytes,
    /// Reported `Content-Type` (always `image/*`).
    pub content_type: String,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a new HTTP client with default timeouts.
    ///
    /// Default configuration:
    /// - Connect timeout: 10 seconds
    /// - Request timeout: 15 seconds
    /// - Gzip decompression: enabled
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    pub fn new() -> Self {
        Self::new_with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        )
    }

    /// Creates a new HTTP client with explicit timeout values.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the supplied
    /// timeout configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new_with_timeouts(connect_timeout: Duration, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .gzip(true)
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self {
            client,
            max_body_bytes: MAX_BODY_BYTES,
        }
    }

    /// Overrides the maximum accepted body size.
    #[must_use]
    pub fn with_max_body_bytes(mut self, max_body_bytes: u64) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Performs one GET attempt and returns the body if it is an image.
    ///
    /// # Errors
    ///
    /// Returns `DownloadError` if:
    /// - The request fails (network error, timeout)
    /// - The server returns a non-2xx status
    /// - The `Content-Type` is missing or not `image/*`
    /// - The body exceeds the size cap
    #[instrument(level = "debug", skip(self, referer), fields(url = %url))]
    pub async fn fetch_image(
        &self,
        url: &str,
        referer: Option<&str>,
    ) -> Result<ImageResponse, DownloadError> {
        let mut request = self.client.get(url);
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }

        let response = request.send().await.map_err(|e| map_reqwest_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(url, status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let Some(content_type) = content_type.filter(|ct| is_image_content_type(ct)) else {
            let reported = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok());
            return Err(DownloadError::not_an_image(url, reported));
        };

        if response
            .content_length()
            .is_some_and(|len| len > self.max_body_bytes)
        {
            return Err(DownloadError::too_large(url, self.max_body_bytes));
        }

        let bytes = read_body(response, url, self.max_body_bytes).await?;
        debug!(bytes = bytes.len(), %content_type, "image fetched");

        Ok(ImageResponse {
            bytes,
            content_type,
        })
    }

    /// Returns a reference to the underlying reqwest client.
    ///
    /// The metadata resolver shares this client so all traffic uses one pool.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

/// Buffers the response body, enforcing the size cap while streaming.
async fn read_body(
    response: reqwest::Response,
    url: &str,
    max_body_bytes: u64,
) -> Result<Bytes, DownloadError> {
    let mut buffer = BytesMut::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| map_reqwest_error(url, e))?;
        if (buffer.len() + chunk.len()) as u64 > max_body_bytes {
            return Err(DownloadError::too_large(url, max_body_bytes));
        }
        buffer.extend_from_slice(&chunk);
    }

    Ok(buffer.freeze())
}

fn map_reqwest_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}

fn is_image_content_type(content_type: &str) -> bool {
    content_type
        .trim_start()
        .get(..6)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("image/"))
}
