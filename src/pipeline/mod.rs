//! Acquisition pipeline: concurrent page download with ordered delivery.
//!
//! Given the page tasks of one job, the pipeline downloads them with a fixed
//! pool of workers (raw cache first, then the fetcher) and hands them to the
//! consumer strictly by index. A failing page is recorded and skipped; it
//! never stalls the pages after it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gallery_core::download::{FetcherOptions, HttpClient, ResourceFetcher};
//! use gallery_core::pipeline::{AcquisitionPipeline, PageTask, PipelineOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = Arc::new(ResourceFetcher::new(HttpClient::new(), FetcherOptions::default()));
//! let pipeline = AcquisitionPipeline::new(fetcher, PipelineOptions::default())?;
//! let tasks = vec![PageTask::new(0, "https://i.nhentai.net/galleries/1/1.jpg", "42", "1")];
//!
//! let mut stream = pipeline.run(tasks, CancellationToken::new(), None);
//! while let Some(page) = stream.next().await {
//!     println!("page {} ({} bytes)", page.index, page.bytes.len());
//! }
//! let report = stream.finish().await?;
//! println!("failed pages: {:?}", report.failed_indexes);
//! # Ok(())
//! # }
//! ```

mod pool;
mod task;

pub use pool::{
    AcquisitionPipeline, DEFAULT_CHANNEL_CAPACITY, DEFAULT_CONCURRENCY, MAX_CONCURRENCY,
    MIN_CONCURRENCY, PageStream, PipelineError, PipelineOptions, ProgressFn,
};
pub use task::{FetchResult, PageImage, PageTask, PipelineReport};
