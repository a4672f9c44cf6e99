//! Worker pool and ordered reassembly.
//!
//! # Architecture
//!
//! - A supervisor task owns the job state: the reassembly cursor, the
//!   out-of-order completion map and the failure list
//! - `concurrency` workers claim tasks from a shared FIFO queue; the pop
//!   happens under a mutex, so every task is claimed exactly once
//! - Workers push results into a channel; the supervisor wakes on each one
//!   instead of polling, releases the longest contiguous run starting at the
//!   cursor, and blocks on the bounded output channel when the consumer is
//!   slow
//! - When every worker has exited, any index still missing is recorded as
//!   failed and skipped
//! - Cancelling the job token stops claiming, interrupts in-flight fetches and
//!   closes the output stream

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::task::{FetchResult, PageImage, PageTask, PipelineReport};
use crate::cache::{CacheKey, DiskCache, TransformProfile};
use crate::download::{FetchRequest, PageFetcher};
use crate::transform::{ImageTransformer, PageFormat, PassthroughTransformer, protect_or_original};

/// Minimum allowed concurrency value.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
pub const MAX_CONCURRENCY: usize = 25;

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default capacity of the ordered output channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Callback invoked with `(completed, total)` after each finished page.
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Error type for pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// The job token was cancelled before every page was released.
    #[error("acquisition aborted")]
    Aborted,

    /// The supervisor task died.
    #[error("pipeline supervisor failed: {reason}")]
    Supervisor {
        /// Join error message.
        reason: String,
    },
}

/// Pipeline tunables.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Run the transform's protective pass on every page before reassembly.
    pub protective_pass: bool,
    /// Attach processed-cache hits recorded under this profile so packagers
    /// skip re-transforming. The profile's `protected` flag is always taken
    /// from `protective_pass`.
    pub prefetch_processed: Option<TransformProfile>,
    /// Capacity of the ordered output channel.
    pub channel_capacity: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            protective_pass: false,
            prefetch_processed: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Concurrent, ordered page acquisition for one job at a time.
///
/// The pipeline itself is stateless between runs; every [`run`](Self::run)
/// owns its own queue, workers and reassembly state.
#[derive(Clone)]
pub struct AcquisitionPipeline {
    fetcher: Arc<dyn PageFetcher>,
    raw_cache: Option<DiskCache>,
    processed_cache: Option<DiskCache>,
    transformer: Arc<dyn ImageTransformer>,
    options: PipelineOptions,
}

impl fmt::Debug for AcquisitionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionPipeline")
            .field("raw_cache", &self.raw_cache.as_ref().map(DiskCache::dir))
            .field("processed_cache", &self.processed_cache.as_ref().map(DiskCache::dir))
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl AcquisitionPipeline {
    /// Creates a pipeline over `fetcher`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConcurrency`] if `options.concurrency`
    /// is outside `1..=25`.
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&options.concurrency) {
            return Err(PipelineError::InvalidConcurrency {
                value: options.concurrency,
            });
        }
        Ok(Self {
            fetcher,
            raw_cache: None,
            processed_cache: None,
            transformer: Arc::new(PassthroughTransformer),
            options,
        })
    }

    /// Consults and populates `cache` for downloaded bytes.
    #[must_use]
    pub fn with_raw_cache(mut self, cache: DiskCache) -> Self {
        self.raw_cache = Some(cache);
        self
    }

    /// Uses `cache` for processed-page prefetch.
    #[must_use]
    pub fn with_processed_cache(mut self, cache: DiskCache) -> Self {
        self.processed_cache = Some(cache);
        self
    }

    /// Uses `transformer` for the protective pass.
    #[must_use]
    pub fn with_transformer(mut self, transformer: Arc<dyn ImageTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Returns the configured options.
    #[must_use]
    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Starts acquiring `tasks` and returns the ordered output stream.
    ///
    /// `tasks` must carry dense indexes `0..tasks.len()`. Cancelling `cancel`
    /// tears the job down.
    #[instrument(skip_all, fields(total = tasks.len(), concurrency = self.options.concurrency))]
    pub fn run(
        &self,
        tasks: Vec<PageTask>,
        cancel: CancellationToken,
        progress: Option<ProgressFn>,
    ) -> PageStream {
        let total = tasks.len();
        let (out_tx, out_rx) = mpsc::channel(self.options.channel_capacity.max(1));
        let workers = self.options.concurrency.min(total).max(1);

        let ctx = Arc::new(WorkerContext {
            fetcher: Arc::clone(&self.fetcher),
            raw_cache: self.raw_cache.clone(),
            processed_cache: self.processed_cache.clone(),
            transformer: Arc::clone(&self.transformer),
            protective_pass: self.options.protective_pass,
            prefetch_processed: self.options.prefetch_processed.map(|profile| TransformProfile {
                protected: self.options.protective_pass,
                ..profile
            }),
            progress,
            completed: AtomicUsize::new(0),
            total,
        });
        let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));

        let supervisor = tokio::spawn(supervise(ctx, queue, workers, out_tx, cancel.clone()));
        PageStream {
            rx: out_rx,
            supervisor,
            cancel,
        }
    }
}

/// Ordered stream of acquired pages for one job.
///
/// Pages arrive strictly by ascending index; failed indexes are skipped.
#[derive(Debug)]
pub struct PageStream {
    rx: mpsc::Receiver<PageImage>,
    supervisor: JoinHandle<Result<PipelineReport, PipelineError>>,
    cancel: CancellationToken,
}

impl PageStream {
    /// Next page in index order, or `None` once the job is done.
    pub async fn next(&mut self) -> Option<PageImage> {
        self.rx.recv().await
    }

    /// Aborts the job: workers stop and the stream closes.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Drains any remaining pages and returns the final report.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Aborted`] if the job was cancelled, or
    /// [`PipelineError::Supervisor`] if the supervisor task died.
    pub async fn finish(mut self) -> Result<PipelineReport, PipelineError> {
        while self.rx.recv().await.is_some() {}
        self.supervisor.await.map_err(|e| PipelineError::Supervisor {
            reason: e.to_string(),
        })?
    }

    /// Collects every page and the final report.
    ///
    /// # Errors
    ///
    /// See [`finish`](Self::finish).
    pub async fn collect(mut self) -> Result<(Vec<PageImage>, PipelineReport), PipelineError> {
        let mut pages = Vec::new();
        while let Some(page) = self.rx.recv().await {
            pages.push(page);
        }
        let report = self.finish().await?;
        Ok((pages, report))
    }
}

struct WorkerContext {
    fetcher: Arc<dyn PageFetcher>,
    raw_cache: Option<DiskCache>,
    processed_cache: Option<DiskCache>,
    transformer: Arc<dyn ImageTransformer>,
    protective_pass: bool,
    prefetch_processed: Option<TransformProfile>,
    progress: Option<ProgressFn>,
    completed: AtomicUsize,
    total: usize,
}

impl WorkerContext {
    /// Cache lookup, then fetch, then cache fill, then optional protective pass.
    async fn process(&self, task: &PageTask) -> FetchResult {
        let raw_key = CacheKey::original(&task.gallery_id, &task.media_id, task.index);

        let cached = match &self.raw_cache {
            Some(cache) => cache.get(&raw_key).await,
            None => None,
        };

        let (bytes, extension) = if let Some(hit) = cached {
            debug!(index = task.index, "raw cache hit");
            (hit.bytes, hit.extension)
        } else {
            let request = FetchRequest {
                index: task.index,
                url: &task.url,
                gallery_id: &task.gallery_id,
            };
            match self.fetcher.fetch(request).await {
                Ok(fetched) => {
                    if let Some(cache) = &self.raw_cache {
                        cache.set(&raw_key, &fetched.bytes, &fetched.extension).await;
                    }
                    (fetched.bytes, fetched.extension)
                }
                Err(e) => {
                    return FetchResult::Failure {
                        index: task.index,
                        error: e.to_string(),
                    };
                }
            }
        };

        let (bytes, extension) = if self.protective_pass {
            let out = protect_or_original(
                Arc::clone(&self.transformer),
                bytes,
                PageFormat::from_extension(&extension),
            )
            .await;
            let extension = match out.format {
                PageFormat::Unknown => extension,
                format => format.extension().to_string(),
            };
            (out.bytes, extension)
        } else {
            (bytes, extension)
        };

        let processed = match (&self.processed_cache, self.prefetch_processed) {
            (Some(cache), Some(profile)) => {
                cache
                    .get(&CacheKey::processed(
                        &task.gallery_id,
                        &task.media_id,
                        task.index,
                        profile,
                    ))
                    .await
            }
            _ => None,
        };

        FetchResult::Success(PageImage {
            index: task.index,
            bytes,
            extension,
            gallery_id: task.gallery_id.clone(),
            media_id: task.media_id.clone(),
            processed,
        })
    }

    fn report_progress(&self) {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(progress) = &self.progress {
            progress(done, self.total);
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<WorkerContext>,
    queue: Arc<Mutex<VecDeque<PageTask>>>,
    results: mpsc::Sender<FetchResult>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(task) = queue.lock().await.pop_front() else {
            break;
        };
        debug!(worker_id, index = task.index, "claimed page");

        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = ctx.process(&task) => result,
        };
        ctx.report_progress();

        if results.send(result).await.is_err() {
            break;
        }
    }
    debug!(worker_id, "worker exiting");
}

async fn supervise(
    ctx: Arc<WorkerContext>,
    queue: Arc<Mutex<VecDeque<PageTask>>>,
    workers: usize,
    out: mpsc::Sender<PageImage>,
    cancel: CancellationToken,
) -> Result<PipelineReport, PipelineError> {
    let total = ctx.total;
    let (result_tx, mut result_rx) = mpsc::channel::<FetchResult>(workers * 2);

    let mut pool = JoinSet::new();
    for worker_id in 0..workers {
        pool.spawn(worker_loop(
            worker_id,
            Arc::clone(&ctx),
            Arc::clone(&queue),
            result_tx.clone(),
            cancel.clone(),
        ));
    }
    drop(result_tx);

    let mut completed: BTreeMap<usize, FetchResult> = BTreeMap::new();
    let mut report = PipelineReport {
        total,
        ..PipelineReport::default()
    };
    let mut next = 0usize;

    'reassembly: while next < total {
        if let Some(result) = completed.remove(&next) {
            match result {
                FetchResult::Success(page) => {
                    tokio::select! {
                        sent = out.send(page) => {
                            if sent.is_err() {
                                debug!("page consumer went away, aborting job");
                                cancel.cancel();
                                break 'reassembly;
                            }
                        }
                        () = cancel.cancelled() => break 'reassembly,
                    }
                    report.success_count += 1;
                }
                FetchResult::Failure { index, error } => {
                    warn!(index, %error, "page failed, skipping");
                    report.failed_indexes.push(index);
                }
            }
            next += 1;
            continue;
        }

        tokio::select! {
            () = cancel.cancelled() => break 'reassembly,
            received = result_rx.recv() => match received {
                Some(result) if result.index() >= next => {
                    completed.insert(result.index(), result);
                }
                Some(result) => {
                    warn!(index = result.index(), "ignoring result for an already released index");
                }
                None => {
                    warn!(index = next, "no result after all workers finished, marking failed");
                    report.failed_indexes.push(next);
                    next += 1;
                }
            },
        }
    }

    drop(result_rx);
    while let Some(joined) = pool.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(error = %e, "pipeline worker panicked");
            }
        }
    }

    if next < total {
        info!(released = next, total, "acquisition aborted");
        return Err(PipelineError::Aborted);
    }

    info!(
        total,
        success = report.success_count,
        failed = report.failed_indexes.len(),
        "acquisition finished"
    );
    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::{FetchError, FetchedResource};
    use async_trait::async_trait;
    use bytes::Bytes;

    struct EchoFetcher;

    #[async_trait]
    impl PageFetcher for EchoFetcher {
        async fn fetch(&self, request: FetchRequest<'_>) -> Result<FetchedResource, FetchError> {
            Ok(FetchedResource {
                bytes: Bytes::from(request.index.to_string()),
                extension: "jpg".to_string(),
                authority: "test".to_string(),
                url: request.url.to_string(),
            })
        }
    }

    fn tasks(n: usize) -> Vec<PageTask> {
        (0..n)
            .map(|i| PageTask::new(i, format!("https://i.example.com/g/{}.jpg", i + 1), "1", "100"))
            .collect()
    }

    #[test]
    fn test_pipeline_rejects_zero_concurrency() {
        let options = PipelineOptions {
            concurrency: 0,
            ..PipelineOptions::default()
        };
        let result = AcquisitionPipeline::new(Arc::new(EchoFetcher), options);
        assert!(matches!(
            result,
            Err(PipelineError::InvalidConcurrency { value: 0 })
        ));
    }

    #[test]
    fn test_pipeline_rejects_excessive_concurrency() {
        let options = PipelineOptions {
            concurrency: 26,
            ..PipelineOptions::default()
        };
        assert!(AcquisitionPipeline::new(Arc::new(EchoFetcher), options).is_err());
    }

    #[tokio::test]
    async fn test_empty_job_finishes_immediately() {
        let pipeline =
            AcquisitionPipeline::new(Arc::new(EchoFetcher), PipelineOptions::default()).unwrap();
        let stream = pipeline.run(Vec::new(), CancellationToken::new(), None);
        let (pages, report) = stream.collect().await.unwrap();
        assert!(pages.is_empty());
        assert_eq!(report.total, 0);
        assert!(report.is_total_failure());
    }

    #[tokio::test]
    async fn test_progress_reports_every_page() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |done, total| {
            assert!(done <= total);
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        let pipeline =
            AcquisitionPipeline::new(Arc::new(EchoFetcher), PipelineOptions::default()).unwrap();
        let report = pipeline
            .run(tasks(7), CancellationToken::new(), Some(progress))
            .finish()
            .await
            .unwrap();

        assert_eq!(report.success_count, 7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }
}
