//! Per-request job orchestration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::naming::base_filename;
use super::progress::{DEFAULT_PROGRESS_INTERVAL, ProgressSink, ThrottledProgress};
use super::resolver::{GalleryMetadata, GalleryResolver, ResolveError};
use crate::cache::{CacheKey, DiskCache, TransformProfile};
use crate::download::PageFetcher;
use crate::package::{
    ArchiveOptions, ArchivePackager, DocumentOptions, DocumentPackager, DocumentProgressFn,
    PackageError,
};
use crate::pipeline::{
    AcquisitionPipeline, PageImage, PageStream, PageTask, PipelineError, PipelineOptions,
    PipelineReport, ProgressFn,
};
use crate::transform::{ImageTransformer, PassthroughTransformer};

/// Default base of page image URLs.
pub const DEFAULT_IMAGE_BASE: &str = "https://i.nhentai.net";

/// Requested artifact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    /// Paginated PDF on disk.
    Document,
    /// Zip archive in memory.
    Archive,
    /// Ordered pages, unpackaged.
    ImageSet,
}

/// A finished PDF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentOutcome {
    /// File holding the document.
    pub path: PathBuf,
    /// Suggested filename, with extension.
    pub filename: String,
    /// The caller must delete `path`; false when the document cache owns it.
    pub caller_owns_file: bool,
    /// Pages missing from the document.
    pub failed_indexes: Vec<usize>,
}

/// A finished zip archive.
#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    /// Complete archive.
    pub bytes: Bytes,
    /// Suggested filename, with extension.
    pub filename: String,
    /// Pages missing from the archive.
    pub failed_indexes: Vec<usize>,
}

/// Ordered pages without packaging.
#[derive(Debug, Clone)]
pub struct ImageSetOutcome {
    /// Pages in index order.
    pub images: Vec<PageImage>,
    /// Suggested base filename.
    pub filename: String,
    /// Pages that could not be acquired.
    pub failed_indexes: Vec<usize>,
}

/// Result of a successful job.
#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    /// See [`DocumentOutcome`].
    Document(DocumentOutcome),
    /// See [`ArchiveOutcome`].
    Archive(ArchiveOutcome),
    /// See [`ImageSetOutcome`].
    Images(ImageSetOutcome),
}

impl DownloadOutcome {
    /// Pages missing from the artifact.
    #[must_use]
    pub fn failed_indexes(&self) -> &[usize] {
        match self {
            Self::Document(d) => &d.failed_indexes,
            Self::Archive(a) => &a.failed_indexes,
            Self::Images(i) => &i.failed_indexes,
        }
    }

    /// Suggested filename.
    #[must_use]
    pub fn filename(&self) -> &str {
        match self {
            Self::Document(d) => &d.filename,
            Self::Archive(a) => &a.filename,
            Self::Images(i) => &i.filename,
        }
    }
}

/// Job-level failures.
#[derive(Debug, Error)]
pub enum JobError {
    /// Metadata could not be resolved.
    #[error("failed to resolve gallery {gallery_id}: {source}")]
    Metadata {
        /// Requested gallery.
        gallery_id: String,
        /// Underlying error.
        #[source]
        source: ResolveError,
    },

    /// The gallery has no pages.
    #[error("gallery {gallery_id} has no pages")]
    EmptyGallery {
        /// Requested gallery.
        gallery_id: String,
    },

    /// Every page failed.
    #[error("all {total} pages of gallery {gallery_id} failed to download")]
    AllPagesFailed {
        /// Requested gallery.
        gallery_id: String,
        /// Number of pages attempted.
        total: usize,
    },

    /// Building the artifact failed.
    #[error("packaging gallery {gallery_id} failed: {source}")]
    Packaging {
        /// Requested gallery.
        gallery_id: String,
        /// Underlying error.
        #[source]
        source: PackageError,
    },

    /// The acquisition pipeline failed.
    #[error("acquisition of gallery {gallery_id} failed: {source}")]
    Pipeline {
        /// Requested gallery.
        gallery_id: String,
        /// Underlying error.
        #[source]
        source: PipelineError,
    },
}

impl JobError {
    /// Message fit for end users: no paths, URLs or credentials.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Metadata { gallery_id, source } => match source {
                ResolveError::NotFound { .. } => format!("Gallery {gallery_id} does not exist."),
                _ => format!(
                    "Could not fetch information for gallery {gallery_id}. Check the id or link and try again."
                ),
            },
            Self::EmptyGallery { gallery_id } => format!("Gallery {gallery_id} has no pages."),
            Self::AllPagesFailed { total, .. } => {
                format!("All {total} pages failed to download. The image servers may be unreachable.")
            }
            Self::Packaging { .. } => "Failed to build the output file.".to_string(),
            Self::Pipeline { .. } => "The download was interrupted.".to_string(),
        }
    }
}

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Base of page image URLs (`{base}/galleries/{media_id}/{n}.{ext}`).
    pub image_base: String,
    /// Prefix filenames with `[id] `.
    pub prepend_id: bool,
    /// Acquisition pipeline options.
    pub pipeline: PipelineOptions,
    /// Zip deflate level.
    pub archive_compression_level: u32,
    /// Document packaging options; `password` is set per job.
    pub document: DocumentOptions,
    /// Password used when a job does not supply one.
    pub default_password: Option<String>,
    /// Minimum spacing between progress messages.
    pub progress_interval: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            image_base: DEFAULT_IMAGE_BASE.to_string(),
            prepend_id: false,
            pipeline: PipelineOptions::default(),
            archive_compression_level: crate::package::DEFAULT_COMPRESSION_LEVEL,
            document: DocumentOptions::default(),
            default_password: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// Ties resolver, pipeline, caches and packagers together per request.
#[derive(Clone)]
pub struct Orchestrator {
    resolver: Arc<dyn GalleryResolver>,
    fetcher: Arc<dyn PageFetcher>,
    transformer: Arc<dyn ImageTransformer>,
    raw_cache: Option<DiskCache>,
    processed_cache: Option<DiskCache>,
    document_cache: Option<DiskCache>,
    options: OrchestratorOptions,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("raw_cache", &self.raw_cache.as_ref().map(DiskCache::dir))
            .field("processed_cache", &self.processed_cache.as_ref().map(DiskCache::dir))
            .field("document_cache", &self.document_cache.as_ref().map(DiskCache::dir))
            .field("image_base", &self.options.image_base)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator without caches.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConcurrency`] if the pipeline
    /// concurrency is out of range.
    pub fn new(
        resolver: Arc<dyn GalleryResolver>,
        fetcher: Arc<dyn PageFetcher>,
        options: OrchestratorOptions,
    ) -> Result<Self, PipelineError> {
        AcquisitionPipeline::new(Arc::clone(&fetcher), options.pipeline.clone())?;
        Ok(Self {
            resolver,
            fetcher,
            transformer: Arc::new(PassthroughTransformer),
            raw_cache: None,
            processed_cache: None,
            document_cache: None,
            options,
        })
    }

    /// Uses `transformer` for the protective pass and page conversion.
    #[must_use]
    pub fn with_transformer(mut self, transformer: Arc<dyn ImageTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Caches downloaded bytes in `cache`.
    #[must_use]
    pub fn with_raw_cache(mut self, cache: DiskCache) -> Self {
        self.raw_cache = Some(cache);
        self
    }

    /// Caches transformed pages in `cache`.
    #[must_use]
    pub fn with_processed_cache(mut self, cache: DiskCache) -> Self {
        self.processed_cache = Some(cache);
        self
    }

    /// Caches finished documents in `cache`.
    #[must_use]
    pub fn with_document_cache(mut self, cache: DiskCache) -> Self {
        self.document_cache = Some(cache);
        self
    }

    /// Downloads one gallery and packages it as `kind`.
    ///
    /// Partial page failures still produce an artifact; the missing indexes
    /// are reported on the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`JobError`] when metadata cannot be resolved, the gallery is
    /// empty, every page fails, or packaging fails. No partial artifact is
    /// returned and partial files are removed.
    #[instrument(skip(self, password, on_progress), fields(encrypted = password.is_some()))]
    pub async fn download_gallery(
        &self,
        gallery_id: &str,
        kind: OutputKind,
        password: Option<&str>,
        on_progress: Option<ProgressSink>,
    ) -> Result<DownloadOutcome, JobError> {
        let meta = self
            .resolver
            .resolve(gallery_id)
            .await
            .map_err(|source| JobError::Metadata {
                gallery_id: gallery_id.to_string(),
                source,
            })?;

        let tasks = build_tasks(&meta, &self.options.image_base);
        if tasks.is_empty() {
            return Err(JobError::EmptyGallery {
                gallery_id: meta.id,
            });
        }

        let progress = Arc::new(ThrottledProgress::new(on_progress, self.options.progress_interval));
        progress.force(&format!("Gallery resolved: {} pages.", tasks.len()));

        let base = base_filename(&meta, self.options.prepend_id);
        let password = password
            .or(self.options.default_password.as_deref())
            .filter(|p| !p.is_empty());

        let outcome = match kind {
            OutputKind::ImageSet => self.run_images(&meta, tasks, base, &progress).await,
            OutputKind::Archive => self.run_archive(&meta, tasks, base, password, &progress).await,
            OutputKind::Document => {
                self.run_document(&meta, tasks, base, password, &progress)
                    .await
            }
        };
        self.fetcher.release_gallery(&meta.id);
        outcome
    }

    fn pipeline(
        &self,
        prefetch_processed: Option<TransformProfile>,
    ) -> Result<AcquisitionPipeline, PipelineError> {
        let options = PipelineOptions {
            prefetch_processed,
            ..self.options.pipeline.clone()
        };
        let mut pipeline = AcquisitionPipeline::new(Arc::clone(&self.fetcher), options)?
            .with_transformer(Arc::clone(&self.transformer));
        if let Some(cache) = &self.raw_cache {
            pipeline = pipeline.with_raw_cache(cache.clone());
        }
        if let Some(cache) = &self.processed_cache {
            pipeline = pipeline.with_processed_cache(cache.clone());
        }
        Ok(pipeline)
    }

    fn start(
        &self,
        meta: &GalleryMetadata,
        tasks: Vec<PageTask>,
        prefetch_processed: Option<TransformProfile>,
        progress: &Arc<ThrottledProgress>,
        cancel: CancellationToken,
    ) -> Result<PageStream, JobError> {
        let pipeline = self
            .pipeline(prefetch_processed)
            .map_err(|source| pipeline_error(meta, source))?;
        let sink = Arc::clone(progress);
        let on_page: ProgressFn = Arc::new(move |done, total| {
            sink.update(&format!("Downloading: {done} / {total}"));
        });
        Ok(pipeline.run(tasks, cancel, Some(on_page)))
    }

    async fn run_images(
        &self,
        meta: &GalleryMetadata,
        tasks: Vec<PageTask>,
        filename: String,
        progress: &Arc<ThrottledProgress>,
    ) -> Result<DownloadOutcome, JobError> {
        let total = tasks.len();
        let stream = self.start(meta, tasks, None, progress, CancellationToken::new())?;
        let (images, report) = stream
            .collect()
            .await
            .map_err(|source| pipeline_error(meta, source))?;
        ensure_some_success(meta, &report)?;
        progress.force(&format!("Downloaded {} / {total} pages.", report.success_count));

        Ok(DownloadOutcome::Images(ImageSetOutcome {
            images,
            filename,
            failed_indexes: report.failed_indexes,
        }))
    }

    async fn run_archive(
        &self,
        meta: &GalleryMetadata,
        tasks: Vec<PageTask>,
        base: String,
        password: Option<&str>,
        progress: &Arc<ThrottledProgress>,
    ) -> Result<DownloadOutcome, JobError> {
        let total = tasks.len();
        let cancel = CancellationToken::new();
        let mut stream = self.start(meta, tasks, None, progress, cancel.clone())?;

        let packager = ArchivePackager::new(ArchiveOptions {
            compression_level: self.options.archive_compression_level,
            password: password.map(ToString::to_string),
            folder: base.clone(),
            pages_transformed: self.options.pipeline.protective_pass,
        });
        let packaged = packager.package(&mut stream, total, &cancel).await;
        if packaged.is_err() {
            stream.abort();
        }
        let report = stream.finish().await;

        let artifact = match packaged {
            Ok(artifact) => artifact,
            Err(PackageError::NoPages) => {
                return Err(JobError::AllPagesFailed {
                    gallery_id: meta.id.clone(),
                    total,
                });
            }
            Err(source) => return Err(packaging_error(meta, source)),
        };
        let report = report.map_err(|source| pipeline_error(meta, source))?;
        progress.force(&format!("Archive ready: {} / {total} pages.", artifact.entries));

        Ok(DownloadOutcome::Archive(ArchiveOutcome {
            bytes: artifact.bytes,
            filename: format!("{base}.zip"),
            failed_indexes: report.failed_indexes,
        }))
    }

    async fn run_document(
        &self,
        meta: &GalleryMetadata,
        tasks: Vec<PageTask>,
        base: String,
        password: Option<&str>,
        progress: &Arc<ThrottledProgress>,
    ) -> Result<DownloadOutcome, JobError> {
        let filename = format!("{base}.pdf");
        let mut packager = DocumentPackager::new(DocumentOptions {
            password: password.map(ToString::to_string),
            pages_protected: self.options.pipeline.protective_pass,
            ..self.options.document.clone()
        })
        .with_transformer(Arc::clone(&self.transformer));
        if let Some(cache) = &self.processed_cache {
            packager = packager.with_processed_cache(cache.clone());
        }
        let profile = packager.profile();
        let cache_key = CacheKey::document(&meta.id, &meta.media_id, password, profile);

        if let Some(cache) = &self.document_cache {
            if let Some(path) = cache.get_path(&cache_key).await {
                info!(gallery_id = %meta.id, "document cache hit");
                progress.force("Using cached document.");
                return Ok(DownloadOutcome::Document(DocumentOutcome {
                    path,
                    filename,
                    caller_owns_file: false,
                    failed_indexes: Vec::new(),
                }));
            }
        }

        let total = tasks.len();
        let cancel = CancellationToken::new();
        let prefetch = self.processed_cache.is_some().then_some(profile);
        let mut stream = self.start(meta, tasks, prefetch, progress, cancel.clone())?;

        let sink = Arc::clone(progress);
        let on_page: DocumentProgressFn = Arc::new(move |done, total| {
            sink.update(&format!("Packaging: {done} / {total}"));
        });
        let packaged = packager
            .package(&meta.id, &mut stream, total, Some(on_page), &cancel)
            .await;
        if packaged.is_err() {
            stream.abort();
        }
        let report = stream.finish().await;

        let artifact = match packaged {
            Ok(artifact) => artifact,
            Err(PackageError::NoPages) => {
                return Err(JobError::AllPagesFailed {
                    gallery_id: meta.id.clone(),
                    total,
                });
            }
            Err(source) => return Err(packaging_error(meta, source)),
        };
        let report = match report {
            Ok(report) => report,
            Err(source) => {
                remove_quietly(&artifact.path).await;
                return Err(pipeline_error(meta, source));
            }
        };

        let mut failed_indexes = report.failed_indexes;
        failed_indexes.extend(artifact.skipped.iter().copied());
        failed_indexes.sort_unstable();
        progress.force(&format!("Document ready: {} / {total} pages.", artifact.pages));

        // Only complete documents are worth serving again.
        if failed_indexes.is_empty() {
            if let Some(cache) = &self.document_cache {
                if cache.set_file(&cache_key, &artifact.path, "pdf").await {
                    if let Some(cached) = cache.get_path(&cache_key).await {
                        remove_quietly(&artifact.path).await;
                        return Ok(DownloadOutcome::Document(DocumentOutcome {
                            path: cached,
                            filename,
                            caller_owns_file: false,
                            failed_indexes,
                        }));
                    }
                }
            }
        }

        Ok(DownloadOutcome::Document(DocumentOutcome {
            path: artifact.path,
            filename,
            caller_owns_file: artifact.caller_owns_file,
            failed_indexes,
        }))
    }
}

/// Builds one task per page: `{image_base}/galleries/{media_id}/{n}.{ext}`.
#[must_use]
pub fn build_tasks(meta: &GalleryMetadata, image_base: &str) -> Vec<PageTask> {
    let base = image_base.trim_end_matches('/');
    meta.page_extensions
        .iter()
        .enumerate()
        .map(|(index, ext)| {
            PageTask::new(
                index,
                format!("{base}/galleries/{}/{}.{ext}", meta.media_id, index + 1),
                meta.id.clone(),
                meta.media_id.clone(),
            )
        })
        .collect()
}

fn ensure_some_success(meta: &GalleryMetadata, report: &PipelineReport) -> Result<(), JobError> {
    if report.is_total_failure() {
        return Err(JobError::AllPagesFailed {
            gallery_id: meta.id.clone(),
            total: report.total,
        });
    }
    Ok(())
}

fn pipeline_error(meta: &GalleryMetadata, source: PipelineError) -> JobError {
    JobError::Pipeline {
        gallery_id: meta.id.clone(),
        source,
    }
}

fn packaging_error(meta: &GalleryMetadata, source: PackageError) -> JobError {
    JobError::Packaging {
        gallery_id: meta.id.clone(),
        source,
    }
}

async fn remove_quietly(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove temp document");
        }
    }
}
