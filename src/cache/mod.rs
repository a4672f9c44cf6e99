//! Two-tier disk cache for page artifacts.
//!
//! The same [`DiskCache`] type backs every tier; instances are independent
//! and never block each other:
//!
//! - **Raw cache**: bytes exactly as downloaded ([`Variant::Original`])
//! - **Processed cache**: bytes after a transform ([`Variant::Processed`])
//! - **Document cache**: finished documents ([`Variant::Document`])
//!
//! Cache failures are never fatal. Reads degrade to a miss and writes are
//! skipped, both with a `warn` log.
//!
//! # Example
//!
//! ```no_run
//! use gallery_core::cache::{CacheKey, CacheOptions, DiskCache};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = DiskCache::open("raw", "/tmp/gallery-cache/raw", CacheOptions::default()).await?;
//! let key = CacheKey::original("177013", "987654", 0);
//! cache.set(&key, b"...", "jpg").await;
//! if let Some(hit) = cache.get(&key).await {
//!     println!("{} bytes ({})", hit.bytes.len(), hit.extension);
//! }
//! cache.dispose().await;
//! # Ok(())
//! # }
//! ```

mod disk;
mod error;
pub mod eviction;
mod index;
mod key;

pub use disk::{
    CacheOptions, CacheStats, CachedBlob, DEFAULT_MAX_BYTES, DEFAULT_PERSIST_DEBOUNCE,
    DEFAULT_TTL, DiskCache,
};
pub use error::CacheError;
pub use index::{CacheEntry, INDEX_FILE, INDEX_VERSION};
pub use key::{CacheKey, TransformProfile, Variant, password_fingerprint};
pub(crate) use key::hex;
