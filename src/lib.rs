//! Gallery Fetch Core Library
//!
//! This library fetches the pages of an image gallery concurrently and
//! packages them as a PDF, a zip archive or an ordered image set.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`download`] - HTTP client, retry policy, host/extension fallback fetcher
//! - [`cache`] - Disk cache with scored eviction and debounced index persistence
//! - [`pipeline`] - Bounded worker pool with strictly ordered output
//! - [`transform`] - Image transform interface and implementations
//! - [`package`] - Zip and PDF packagers fed by the ordered page stream
//! - [`job`] - Per-request orchestration from gallery id to artifact
//! - [`config`] - TOML configuration file

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod download;
pub mod job;
pub mod package;
pub mod pipeline;
pub mod transform;

// Re-export commonly used types
pub use cache::{CacheKey, CacheOptions, DiskCache, TransformProfile, Variant};
pub use config::{AppConfig, ConfigError};
pub use download::{
    DownloadError, FetchError, FetcherOptions, HttpClient, PageFetcher, ResourceFetcher,
    RetryPolicy,
};
pub use job::{DownloadOutcome, JobError, Orchestrator, OrchestratorOptions, OutputKind};
pub use pipeline::{
    AcquisitionPipeline, DEFAULT_CONCURRENCY, PageImage, PageTask, PipelineError,
    PipelineOptions, PipelineReport,
};
pub use transform::{ImageTransformer, PageFormat, PassthroughTransformer, RasterTransformer};
