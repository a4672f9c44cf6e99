//! Paginated-document packager.
//!
//! Writes a PDF to a temp file page by page. Every page becomes a JPEG:
//! previously processed bytes are reused from the processed cache, anything
//! else goes through the transform and is recorded there for next time.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::pdf::{self, PdfWriter};
use super::{PackageError, PageSource};
use crate::cache::{CacheKey, DiskCache, TransformProfile};
use crate::pipeline::PageImage;
use crate::transform::{
    DEFAULT_JPEG_QUALITY, ImageTransformer, PageFormat, PassthroughTransformer,
    transform_or_original,
};

/// JPEG pages at or below this size are embedded without recompression.
pub const DEFAULT_RECOMPRESSION_THRESHOLD_KB: u64 = 500;

/// Pages between progress callbacks.
pub const DEFAULT_PROGRESS_EVERY: usize = 10;

/// Callback invoked with `(pages_written, total)`.
pub type DocumentProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Document packaging options.
#[derive(Debug, Clone)]
pub struct DocumentOptions {
    /// Directory for the temp file.
    pub temp_dir: PathBuf,
    /// Password required to open the document.
    pub password: Option<String>,
    /// JPEG quality for converted and recompressed pages (1-100).
    pub quality: u8,
    /// Recompress large JPEG pages.
    pub enable_compression: bool,
    /// Size above which JPEG pages are recompressed.
    pub recompression_threshold_kb: u64,
    /// Pages arrive with the protective pass already applied.
    pub pages_protected: bool,
    /// Pages between progress callbacks.
    pub progress_every: usize,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            password: None,
            quality: DEFAULT_JPEG_QUALITY,
            enable_compression: false,
            recompression_threshold_kb: DEFAULT_RECOMPRESSION_THRESHOLD_KB,
            pages_protected: false,
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }
}

/// A finished document on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentArtifact {
    /// Finished PDF.
    pub path: PathBuf,
    /// Pages written.
    pub pages: usize,
    /// Indexes that arrived but could not be placed.
    pub skipped: Vec<usize>,
    /// The caller must delete `path` when done; false for cache-owned files.
    pub caller_owns_file: bool,
}

/// Streams pages into a PDF temp file.
#[derive(Clone)]
pub struct DocumentPackager {
    transformer: Arc<dyn ImageTransformer>,
    processed_cache: Option<DiskCache>,
    options: DocumentOptions,
}

impl fmt::Debug for DocumentPackager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentPackager")
            .field("processed_cache", &self.processed_cache.as_ref().map(DiskCache::dir))
            .field("temp_dir", &self.options.temp_dir)
            .field("encrypted", &self.options.password.is_some())
            .finish_non_exhaustive()
    }
}

impl DocumentPackager {
    /// Creates a packager that embeds pages with the passthrough transform.
    #[must_use]
    pub fn new(options: DocumentOptions) -> Self {
        Self {
            transformer: Arc::new(PassthroughTransformer),
            processed_cache: None,
            options,
        }
    }

    /// Converts and recompresses pages with `transformer`.
    #[must_use]
    pub fn with_transformer(mut self, transformer: Arc<dyn ImageTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Reuses and records processed pages in `cache`.
    #[must_use]
    pub fn with_processed_cache(mut self, cache: DiskCache) -> Self {
        self.processed_cache = Some(cache);
        self
    }

    /// Settings processed pages are recorded under.
    #[must_use]
    pub fn profile(&self) -> TransformProfile {
        TransformProfile {
            protected: self.options.pages_protected,
            quality: self.options.quality.clamp(1, 100),
            recompress_above_kb: self
                .options
                .enable_compression
                .then_some(self.options.recompression_threshold_kb),
        }
    }

    /// Consumes `source` into a PDF and returns the finished temp file.
    ///
    /// Pages that cannot be converted to JPEG are skipped with a warning. On
    /// a write failure `cancel` is fired so upstream workers stop, and the
    /// temp file is removed before the error is returned.
    ///
    /// # Errors
    ///
    /// - [`PackageError::Io`] if the temp file cannot be written
    /// - [`PackageError::NoPages`] if no page could be placed
    /// - [`PackageError::Aborted`] if `cancel` fires
    #[instrument(skip_all, fields(gallery_id = %gallery_id, total = total))]
    pub async fn package(
        &self,
        gallery_id: &str,
        source: &mut dyn PageSource,
        total: usize,
        progress: Option<DocumentProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<DocumentArtifact, PackageError> {
        let path = temp_path(&self.options.temp_dir, gallery_id);
        let mut writer = match PdfWriter::create(&path, gallery_id, self.options.password.as_deref()).await {
            Ok(writer) => writer,
            Err(e) => {
                remove_quietly(&path).await;
                return Err(PackageError::io(path, e));
            }
        };

        let mut skipped = Vec::new();
        loop {
            let page = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    remove_quietly(&path).await;
                    return Err(PackageError::Aborted);
                }
                page = source.next_page() => page,
            };
            let Some(page) = page else { break };
            let index = page.index;

            let jpeg = self.page_jpeg(page).await;
            let Some(info) = pdf::read_info(&jpeg) else {
                warn!(index, "page is not a usable JPEG, skipping");
                skipped.push(index);
                continue;
            };

            if let Err(e) = writer.add_jpeg_page(&jpeg, info).await {
                cancel.cancel();
                remove_quietly(&path).await;
                return Err(PackageError::io(path, e));
            }

            let written = writer.page_count();
            debug!(index, written, "page placed");
            if let Some(progress) = &progress {
                if written % self.options.progress_every.max(1) == 0 {
                    progress(written, total);
                }
            }
        }

        let pages = writer.page_count();
        if pages == 0 {
            drop(writer);
            remove_quietly(&path).await;
            return Err(PackageError::NoPages);
        }

        if let Err(e) = writer.finish().await {
            remove_quietly(&path).await;
            return Err(PackageError::io(path, e));
        }
        if let Some(progress) = &progress {
            if pages % self.options.progress_every.max(1) != 0 {
                progress(pages, total);
            }
        }

        info!(pages, skipped = skipped.len(), path = %path.display(), "document finished");
        Ok(DocumentArtifact {
            path,
            pages,
            skipped,
            caller_owns_file: true,
        })
    }

    /// JPEG bytes for `page`, from the processed cache when possible.
    async fn page_jpeg(&self, page: PageImage) -> Bytes {
        if let Some(blob) = page.processed {
            if PageFormat::sniff(&blob.bytes) == PageFormat::Jpeg {
                debug!(index = page.index, "using prefetched processed page");
                return blob.bytes;
            }
        }

        let key = CacheKey::processed(&page.gallery_id, &page.media_id, page.index, self.profile());
        if let Some(cache) = &self.processed_cache {
            if let Some(hit) = cache.get(&key).await {
                if PageFormat::sniff(&hit.bytes) == PageFormat::Jpeg {
                    debug!(index = page.index, "processed cache hit");
                    return hit.bytes;
                }
            }
        }

        let format = match PageFormat::sniff(&page.bytes) {
            PageFormat::Unknown => PageFormat::from_extension(&page.extension),
            sniffed => sniffed,
        };
        let quality = self.options.quality.clamp(1, 100);

        if format == PageFormat::Jpeg && !self.should_recompress(page.bytes.len()) {
            return page.bytes;
        }
        let out = transform_or_original(
            Arc::clone(&self.transformer),
            page.bytes,
            format,
            PageFormat::Jpeg,
            quality,
        )
        .await;

        if out.format == PageFormat::Jpeg {
            if let Some(cache) = &self.processed_cache {
                cache.set(&key, &out.bytes, PageFormat::Jpeg.extension()).await;
            }
        }
        out.bytes
    }

    fn should_recompress(&self, size: usize) -> bool {
        self.options.enable_compression
            && size as u64 > self.options.recompression_threshold_kb.saturating_mul(1024)
    }
}

fn temp_path(dir: &Path, gallery_id: &str) -> PathBuf {
    let safe: String = gallery_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.join(format!("temp_{safe}_{millis}_{seq}.pdf"))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove partial document");
        }
    }
}
