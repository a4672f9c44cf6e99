//! CLI entry point for gallery-fetch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use gallery_core::cache::{CacheOptions, DiskCache};
use gallery_core::download::constants::CONNECT_TIMEOUT_SECS;
use gallery_core::download::{HttpClient, ResourceFetcher};
use gallery_core::job::{ApiGalleryResolver, DownloadOutcome, Orchestrator, ProgressSink};
use gallery_core::{AppConfig, OutputKind, RasterTransformer};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, parse_gallery_id};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let Some(gallery_id) = parse_gallery_id(&args.gallery) else {
        bail!("'{}' is not a gallery id or gallery link", args.gallery);
    };

    let config = load_config(&args)?;
    let out_dir = args
        .out_dir
        .clone()
        .or_else(|| config.output.download_path.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("Failed to create output directory '{}'", out_dir.display()))?;

    let http = HttpClient::new_with_timeouts(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        config.request_timeout(),
    );
    let resolver = Arc::new(ApiGalleryResolver::with_base_url(
        http.inner().clone(),
        config.api.base_url.clone(),
    ));
    let fetcher = Arc::new(ResourceFetcher::new(http, config.fetcher_options()));

    let mut orchestrator = Orchestrator::new(resolver, fetcher, config.orchestrator_options())?
        .with_transformer(Arc::new(RasterTransformer));

    let mut caches = Vec::new();
    if !args.no_cache {
        let base = config.cache_dir();
        if config.cache.image_cache_enabled {
            if let Some(raw) = open_cache("raw", &base, config.image_cache_options()).await {
                orchestrator = orchestrator.with_raw_cache(raw.clone());
                caches.push(raw);
            }
            if let Some(processed) =
                open_cache("processed", &base, config.image_cache_options()).await
            {
                orchestrator = orchestrator.with_processed_cache(processed.clone());
                caches.push(processed);
            }
        }
        if config.cache.document_cache_enabled {
            if let Some(documents) =
                open_cache("documents", &base, config.document_cache_options()).await
            {
                orchestrator = orchestrator.with_document_cache(documents.clone());
                caches.push(documents);
            }
        }
    }

    let spinner = (!args.quiet).then(|| {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner
    });
    let sink: Option<ProgressSink> = spinner.clone().map(|spinner| {
        let sink: ProgressSink =
            Arc::new(move |message: &str| spinner.set_message(message.to_string()));
        sink
    });

    info!(gallery_id = %gallery_id, output = ?args.output, "Starting download");
    let result = orchestrator
        .download_gallery(
            &gallery_id,
            OutputKind::from(args.output),
            args.password.as_deref(),
            sink,
        )
        .await;

    if let Some(spinner) = &spinner {
        spinner.finish_and_clear();
    }

    let written = match result {
        Ok(outcome) => write_outcome(outcome, &out_dir).await,
        Err(err) => {
            debug!(error = %err, "job failed");
            Err(anyhow::anyhow!(err.user_message()))
        }
    };

    for cache in &caches {
        cache.dispose().await;
    }

    let (path, failed) = written?;
    println!("{}", path.display());
    if !failed.is_empty() {
        let pages: Vec<String> = failed.iter().map(|i| (i + 1).to_string()).collect();
        warn!(count = failed.len(), "Some pages could not be downloaded");
        eprintln!("Missing pages: {}", pages.join(", "));
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_default()?,
    };
    if let Some(concurrency) = args.concurrency {
        config.network.concurrency = usize::from(concurrency);
    }
    if let Some(retries) = args.retries {
        config.network.retries = u32::from(retries);
    }
    config.validate()?;
    Ok(config)
}

async fn open_cache(label: &str, base: &Path, options: CacheOptions) -> Option<DiskCache> {
    match DiskCache::open(label, base.join(label), options).await {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!(cache = label, error = %e, "Cache unavailable, continuing without it");
            None
        }
    }
}

/// Writes the artifact into `out_dir`; returns its path and the missing pages.
async fn write_outcome(outcome: DownloadOutcome, out_dir: &Path) -> Result<(PathBuf, Vec<usize>)> {
    match outcome {
        DownloadOutcome::Document(doc) => {
            let target = out_dir.join(&doc.filename);
            tokio::fs::copy(&doc.path, &target)
                .await
                .with_context(|| format!("Failed to write '{}'", target.display()))?;
            if doc.caller_owns_file {
                if let Err(e) = tokio::fs::remove_file(&doc.path).await {
                    warn!(error = %e, "Failed to remove temp document");
                }
            }
            Ok((target, doc.failed_indexes))
        }
        DownloadOutcome::Archive(archive) => {
            let target = out_dir.join(&archive.filename);
            tokio::fs::write(&target, &archive.bytes)
                .await
                .with_context(|| format!("Failed to write '{}'", target.display()))?;
            Ok((target, archive.failed_indexes))
        }
        DownloadOutcome::Images(set) => {
            let dir = out_dir.join(&set.filename);
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create '{}'", dir.display()))?;
            for image in &set.images {
                let file = dir.join(format!("{:03}.{}", image.index + 1, image.extension));
                tokio::fs::write(&file, &image.bytes)
                    .await
                    .with_context(|| format!("Failed to write '{}'", file.display()))?;
            }
            Ok((dir, set.failed_indexes))
        }
    }
}
