//! Page download layer: HTTP client, retry policy and fallback fetcher.
//!
//! # Features
//!
//! - One shared HTTP connection pool for every job
//! - Non-image responses are failures even with status 200
//! - Smart backoff (steep after timeouts, flat otherwise) or fixed delays
//! - Host and extension fallback with per-gallery host affinity
//!
//! # Example
//!
//! ```no_run
//! use gallery_core::download::{FetchRequest, FetcherOptions, HttpClient, PageFetcher, ResourceFetcher};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = ResourceFetcher::new(HttpClient::new(), FetcherOptions::default());
//! let page = fetcher
//!     .fetch(FetchRequest {
//!         index: 0,
//!         url: "https://i.nhentai.net/galleries/123/1.jpg",
//!         gallery_id: "42",
//!     })
//!     .await?;
//! println!("{} bytes from {}", page.bytes.len(), page.authority);
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod error;
mod fetcher;
mod retry;

pub use client::{DEFAULT_USER_AGENT, HttpClient, ImageResponse};
pub use error::{DownloadError, FetchError};
pub use fetcher::{
    Candidate, DEFAULT_REFERER_BASE, FetchRequest, FetchedResource, FetcherOptions, PageFetcher,
    ResourceFetcher,
};
pub use retry::{
    BackoffMode, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, FailureType, RetryDecision,
    RetryPolicy, classify_error,
};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
