//! Job orchestration: one download request from gallery id to artifact.
//!
//! # Architecture
//!
//! - [`GalleryResolver`] - Async trait supplying gallery metadata
//! - [`ApiGalleryResolver`] - JSON API implementation
//! - [`Orchestrator`] - Builds the task list, runs the acquisition pipeline
//!   and hands the ordered pages to the selected packager
//! - [`ThrottledProgress`] - Rate-limited progress text for the caller
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gallery_core::download::{FetcherOptions, HttpClient, ResourceFetcher};
//! use gallery_core::job::{ApiGalleryResolver, Orchestrator, OrchestratorOptions, OutputKind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let http = HttpClient::new();
//! let resolver = Arc::new(ApiGalleryResolver::new(http.inner().clone()));
//! let fetcher = Arc::new(ResourceFetcher::new(http, FetcherOptions::default()));
//! let orchestrator = Orchestrator::new(resolver, fetcher, OrchestratorOptions::default())?;
//!
//! let outcome = orchestrator
//!     .download_gallery("177013", OutputKind::Archive, None, None)
//!     .await?;
//! println!("{} (missing pages: {:?})", outcome.filename(), outcome.failed_indexes());
//! # Ok(())
//! # }
//! ```

mod naming;
mod orchestrator;
mod progress;
mod resolver;

pub use naming::{base_filename, sanitize_filename};
pub use orchestrator::{
    ArchiveOutcome, DEFAULT_IMAGE_BASE, DocumentOutcome, DownloadOutcome, ImageSetOutcome,
    JobError, Orchestrator, OrchestratorOptions, OutputKind, build_tasks,
};
pub use progress::{DEFAULT_PROGRESS_INTERVAL, ProgressSink, ThrottledProgress};
pub use resolver::{
    ApiGalleryResolver, DEFAULT_API_BASE, GalleryMetadata, GalleryResolver, GalleryTitle,
    ResolveError, extension_for_type,
};
