//! End-to-end job tests: metadata API and image host are one mock server.

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gallery_core::cache::{CacheOptions, DiskCache};
use gallery_core::download::{FetcherOptions, HttpClient, ResourceFetcher, RetryPolicy};
use gallery_core::job::{
    ApiGalleryResolver, DownloadOutcome, JobError, Orchestrator, OrchestratorOptions, OutputKind,
    ProgressSink, ResolveError,
};
use gallery_core::package::DocumentOptions;
use gallery_core::pipeline::PipelineOptions;
use gallery_core::RasterTransformer;
use image::{ImageFormat, Rgb, RgbImage};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn encoded(format: ImageFormat) -> Vec<u8> {
    let image = RgbImage::from_pixel(30, 40, Rgb([120, 60, 200]));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, format).unwrap();
    out.into_inner()
}

fn gallery_json(types: &[&str]) -> serde_json::Value {
    let pages: Vec<serde_json::Value> = types
        .iter()
        .map(|t| serde_json::json!({ "t": t, "w": 30, "h": 40 }))
        .collect();
    serde_json::json!({
        "id": 42,
        "media_id": "100",
        "title": {
            "english": "Test: Gallery",
            "japanese": null,
            "pretty": "Test Gallery"
        },
        "images": { "pages": pages }
    })
}

async fn mount_gallery(server: &MockServer, types: &[&str]) {
    Mock::given(method("GET"))
        .and(path("/api/gallery/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gallery_json(types)))
        .mount(server)
        .await;
}

async fn mount_page(server: &MockServer, page: &str, content_type: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(format!("/galleries/100/{page}")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", content_type)
                .set_body_bytes(body),
        )
        .mount(server)
        .await;
}

fn fetcher() -> Arc<ResourceFetcher> {
    Arc::new(ResourceFetcher::new(
        HttpClient::new(),
        FetcherOptions {
            retry: RetryPolicy::with_max_attempts(1),
            image_fallback: Vec::new(),
            referer_base: None,
            ..FetcherOptions::default()
        },
    ))
}

fn orchestrator(server: &MockServer, temp: &TempDir) -> Orchestrator {
    orchestrator_with(server, temp, fetcher(), false)
}

fn orchestrator_with(
    server: &MockServer,
    temp: &TempDir,
    fetcher: Arc<ResourceFetcher>,
    protective_pass: bool,
) -> Orchestrator {
    let http = HttpClient::new();
    let resolver = Arc::new(ApiGalleryResolver::with_base_url(
        http.inner().clone(),
        format!("{}/api", server.uri()),
    ));
    let options = OrchestratorOptions {
        image_base: server.uri(),
        pipeline: PipelineOptions {
            concurrency: 2,
            protective_pass,
            ..PipelineOptions::default()
        },
        document: DocumentOptions {
            temp_dir: temp.path().to_path_buf(),
            ..DocumentOptions::default()
        },
        progress_interval: Duration::ZERO,
        ..OrchestratorOptions::default()
    };
    Orchestrator::new(resolver, fetcher, options)
        .unwrap()
        .with_transformer(Arc::new(RasterTransformer))
}

/// Three pages: jpg and png are served, the third is missing everywhere.
async fn partial_gallery() -> MockServer {
    let server = MockServer::start().await;
    mount_gallery(&server, &["j", "p", "j"]).await;
    mount_page(&server, "1.jpg", "image/jpeg", encoded(ImageFormat::Jpeg)).await;
    mount_page(&server, "2.png", "image/png", encoded(ImageFormat::Png)).await;
    server
}

async fn image_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path().starts_with("/galleries/"))
        .count()
}

// ==================== Partial Success Tests ====================

#[tokio::test]
async fn test_archive_job_reports_missing_page() {
    let server = partial_gallery().await;
    let temp = TempDir::new().unwrap();

    let outcome = orchestrator(&server, &temp)
        .download_gallery("42", OutputKind::Archive, None, None)
        .await
        .unwrap();

    assert_eq!(outcome.filename(), "Test Gallery.zip");
    assert_eq!(outcome.failed_indexes(), &[2]);
    let DownloadOutcome::Archive(archive) = outcome else {
        panic!("expected an archive");
    };
    let zip = zip::ZipArchive::new(Cursor::new(archive.bytes.to_vec())).unwrap();
    let mut names: Vec<&str> = zip.file_names().collect();
    names.sort_unstable();
    assert_eq!(names, vec!["Test Gallery/001.jpg", "Test Gallery/002.png"]);
}

#[tokio::test]
async fn test_image_set_job_keeps_order() {
    let server = partial_gallery().await;
    let temp = TempDir::new().unwrap();

    let outcome = orchestrator(&server, &temp)
        .download_gallery("42", OutputKind::ImageSet, None, None)
        .await
        .unwrap();

    let DownloadOutcome::Images(set) = outcome else {
        panic!("expected images");
    };
    let indexes: Vec<usize> = set.images.iter().map(|i| i.index).collect();
    assert_eq!(indexes, vec![0, 1]);
    assert_eq!(set.images[1].extension, "png");
    assert_eq!(set.failed_indexes, vec![2]);
    assert_eq!(set.filename, "Test Gallery");
}

#[tokio::test]
async fn test_document_job_converts_pages_and_hands_over_temp_file() {
    let server = partial_gallery().await;
    let temp = TempDir::new().unwrap();

    let outcome = orchestrator(&server, &temp)
        .download_gallery("42", OutputKind::Document, Some("pw"), None)
        .await
        .unwrap();

    let DownloadOutcome::Document(document) = outcome else {
        panic!("expected a document");
    };
    assert_eq!(document.filename, "Test Gallery.pdf");
    assert_eq!(document.failed_indexes, vec![2]);
    assert!(document.caller_owns_file);
    assert!(document.path.starts_with(temp.path()));

    let pdf = std::fs::read(&document.path).unwrap();
    assert!(pdf.starts_with(b"%PDF-1.4"));
    let text = String::from_utf8_lossy(&pdf);
    assert!(text.contains("/Count 2"));
    assert!(text.contains("/Encrypt"));
}

#[tokio::test]
async fn test_progress_messages_are_forwarded() {
    let server = partial_gallery().await;
    let temp = TempDir::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);
    let sink: ProgressSink = Arc::new(move |message: &str| {
        sink_seen.lock().unwrap().push(message.to_string());
    });

    orchestrator(&server, &temp)
        .download_gallery("42", OutputKind::ImageSet, None, Some(sink))
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.first().map(String::as_str), Some("Gallery resolved: 3 pages."));
    assert!(seen.iter().any(|m| m == "Downloading: 3 / 3"));
}

#[tokio::test]
async fn test_host_affinity_is_released_when_job_ends() {
    let server = partial_gallery().await;
    let temp = TempDir::new().unwrap();
    let fetcher = fetcher();
    let during = Arc::new(Mutex::new(Vec::new()));
    let sink_fetcher = Arc::clone(&fetcher);
    let sink_during = Arc::clone(&during);
    let sink: ProgressSink = Arc::new(move |message: &str| {
        if message.starts_with("Downloading") {
            sink_during
                .lock()
                .unwrap()
                .push(sink_fetcher.preferred_authority("42"));
        }
    });

    orchestrator_with(&server, &temp, Arc::clone(&fetcher), false)
        .download_gallery("42", OutputKind::ImageSet, None, Some(sink))
        .await
        .unwrap();

    let authority = server.address().to_string();
    assert!(
        during.lock().unwrap().iter().any(|a| a.as_deref() == Some(authority.as_str())),
        "affinity should be recorded while the job runs"
    );
    assert_eq!(fetcher.preferred_authority("42"), None);
}

// ==================== Failure Tests ====================

#[tokio::test]
async fn test_every_page_failing_is_a_job_error() {
    let server = MockServer::start().await;
    mount_gallery(&server, &["j", "j"]).await;
    let temp = TempDir::new().unwrap();

    for kind in [OutputKind::Document, OutputKind::Archive, OutputKind::ImageSet] {
        let result = orchestrator(&server, &temp)
            .download_gallery("42", kind, None, None)
            .await;
        match result {
            Err(err @ JobError::AllPagesFailed { total: 2, .. }) => {
                assert!(err.user_message().contains("All 2 pages"));
            }
            other => panic!("expected AllPagesFailed for {kind:?}, got {other:?}"),
        }
    }
    // No partial document left behind
    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_unknown_gallery_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/gallery/42"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let temp = TempDir::new().unwrap();

    let result = orchestrator(&server, &temp)
        .download_gallery("42", OutputKind::Archive, None, None)
        .await;

    match result {
        Err(err @ JobError::Metadata {
            source: ResolveError::NotFound { .. },
            ..
        }) => assert_eq!(err.user_message(), "Gallery 42 does not exist."),
        other => panic!("expected NotFound, got {other:?}"),
    }
    assert_eq!(image_requests(&server).await, 0);
}

#[tokio::test]
async fn test_gallery_without_pages_is_rejected() {
    let server = MockServer::start().await;
    mount_gallery(&server, &[]).await;
    let temp = TempDir::new().unwrap();

    let result = orchestrator(&server, &temp)
        .download_gallery("42", OutputKind::ImageSet, None, None)
        .await;

    assert!(matches!(result, Err(JobError::EmptyGallery { .. })));
}

// ==================== Cache Tests ====================

#[tokio::test]
async fn test_complete_document_is_served_from_cache_next_time() {
    let server = MockServer::start().await;
    mount_gallery(&server, &["j", "p"]).await;
    mount_page(&server, "1.jpg", "image/jpeg", encoded(ImageFormat::Jpeg)).await;
    mount_page(&server, "2.png", "image/png", encoded(ImageFormat::Png)).await;
    let temp = TempDir::new().unwrap();
    let documents = DiskCache::open("documents", temp.path().join("documents"), CacheOptions::default())
        .await
        .unwrap();
    let orchestrator = orchestrator(&server, &temp).with_document_cache(documents.clone());

    let first = orchestrator
        .download_gallery("42", OutputKind::Document, None, None)
        .await
        .unwrap();
    let DownloadOutcome::Document(first) = first else {
        panic!("expected a document");
    };
    assert!(!first.caller_owns_file);
    assert!(first.path.starts_with(documents.dir()));
    let fetched = image_requests(&server).await;
    assert_eq!(fetched, 2);

    let second = orchestrator
        .download_gallery("42", OutputKind::Document, None, None)
        .await
        .unwrap();
    let DownloadOutcome::Document(second) = second else {
        panic!("expected a document");
    };
    assert_eq!(second.path, first.path);
    assert_eq!(image_requests(&server).await, fetched, "no page downloaded again");

    // Another password is another document
    let third = orchestrator
        .download_gallery("42", OutputKind::Document, Some("pw"), None)
        .await
        .unwrap();
    assert_ne!(
        match third {
            DownloadOutcome::Document(d) => d.path,
            _ => panic!("expected a document"),
        },
        first.path
    );
    documents.dispose().await;
}

#[tokio::test]
async fn test_document_cache_keeps_protected_documents_apart() {
    let server = MockServer::start().await;
    mount_gallery(&server, &["j", "j"]).await;
    mount_page(&server, "1.jpg", "image/jpeg", encoded(ImageFormat::Jpeg)).await;
    mount_page(&server, "2.jpg", "image/jpeg", encoded(ImageFormat::Jpeg)).await;
    let temp = TempDir::new().unwrap();
    let documents = DiskCache::open("documents", temp.path().join("documents"), CacheOptions::default())
        .await
        .unwrap();

    let plain = orchestrator(&server, &temp)
        .with_document_cache(documents.clone())
        .download_gallery("42", OutputKind::Document, None, None)
        .await
        .unwrap();
    let fetched = image_requests(&server).await;

    let protected = orchestrator_with(&server, &temp, fetcher(), true)
        .with_document_cache(documents.clone())
        .download_gallery("42", OutputKind::Document, None, None)
        .await
        .unwrap();

    let (DownloadOutcome::Document(plain), DownloadOutcome::Document(protected)) = (plain, protected)
    else {
        panic!("expected documents");
    };
    assert_ne!(protected.path, plain.path);
    assert!(
        image_requests(&server).await > fetched,
        "protected document must be built from fresh pages"
    );
    documents.dispose().await;
}
