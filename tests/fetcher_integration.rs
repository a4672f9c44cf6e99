//! Integration tests for the page fetcher.
//!
//! Two mock servers stand in for the primary image host and one fallback
//! host; the fetcher must walk extensions, then hosts, and remember which
//! host served a gallery.

use gallery_core::download::{
    FetchError, FetchRequest, FetcherOptions, HttpClient, PageFetcher, ResourceFetcher,
    RetryPolicy,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const JPEG_BODY: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

fn image_response(content_type: &str, body: &[u8]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", content_type)
        .set_body_bytes(body.to_vec())
}

fn authority(server: &MockServer) -> String {
    server.address().to_string()
}

fn fetcher_with_fallback(fallback: &MockServer) -> ResourceFetcher {
    let options = FetcherOptions {
        retry: RetryPolicy::with_max_attempts(1),
        image_fallback: vec![authority(fallback)],
        referer_base: None,
        ..FetcherOptions::default()
    };
    ResourceFetcher::new(HttpClient::new(), options)
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.map_or(0, |r| r.len())
}

#[tokio::test]
async fn test_fetch_falls_back_to_second_host() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&primary)
        .await;
    Mock::given(method("GET"))
        .and(path("/galleries/100/1.jpg"))
        .respond_with(image_response("image/jpeg", JPEG_BODY))
        .mount(&secondary)
        .await;

    let fetcher = fetcher_with_fallback(&secondary);
    let url = format!("{}/galleries/100/1.jpg", primary.uri());
    let page = fetcher
        .fetch(FetchRequest {
            index: 0,
            url: &url,
            gallery_id: "42",
        })
        .await
        .expect("fallback host should serve the page");

    assert_eq!(page.bytes.as_ref(), JPEG_BODY);
    assert_eq!(page.extension, "jpg");
    assert_eq!(page.authority, authority(&secondary));
    // jpg then png on the primary before switching hosts
    assert_eq!(request_count(&primary).await, 2);
}

#[tokio::test]
async fn test_fetch_remembers_successful_host_per_gallery() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&primary)
        .await;
    Mock::given(method("GET"))
        .respond_with(image_response("image/jpeg", JPEG_BODY))
        .mount(&secondary)
        .await;

    let fetcher = fetcher_with_fallback(&secondary);
    for index in 0..3 {
        let url = format!("{}/galleries/100/{}.jpg", primary.uri(), index + 1);
        fetcher
            .fetch(FetchRequest {
                index,
                url: &url,
                gallery_id: "42",
            })
            .await
            .expect("fallback host should serve every page");
    }

    assert_eq!(
        fetcher.preferred_authority("42"),
        Some(authority(&secondary))
    );
    // Only the first page tried the failing primary
    assert_eq!(request_count(&primary).await, 2);
    assert_eq!(request_count(&secondary).await, 3);

    // Another gallery starts from the primary again
    assert!(fetcher.preferred_authority("43").is_none());
}

#[tokio::test]
async fn test_fetch_tries_other_extension_on_same_host_first() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/galleries/100/1.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&primary)
        .await;
    Mock::given(method("GET"))
        .and(path("/galleries/100/1.png"))
        .respond_with(image_response("image/png", b"\x89PNG\r\n\x1a\n"))
        .mount(&primary)
        .await;

    let fetcher = fetcher_with_fallback(&secondary);
    let url = format!("{}/galleries/100/1.jpg", primary.uri());
    let page = fetcher
        .fetch(FetchRequest {
            index: 0,
            url: &url,
            gallery_id: "7",
        })
        .await
        .expect("png variant should be served");

    assert_eq!(page.extension, "png");
    assert_eq!(page.authority, authority(&primary));
    assert_eq!(request_count(&secondary).await, 0);
}

#[tokio::test]
async fn test_fetch_rejects_html_and_keeps_going() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(image_response("text/html", b"<html>blocked</html>"))
        .mount(&primary)
        .await;
    Mock::given(method("GET"))
        .respond_with(image_response("image/jpeg", JPEG_BODY))
        .mount(&secondary)
        .await;

    let fetcher = fetcher_with_fallback(&secondary);
    let url = format!("{}/galleries/100/1.jpg", primary.uri());
    let page = fetcher
        .fetch(FetchRequest {
            index: 0,
            url: &url,
            gallery_id: "42",
        })
        .await
        .expect("an HTML body must not count as success");

    assert_eq!(page.authority, authority(&secondary));
}

#[tokio::test]
async fn test_fetch_exhausted_reports_every_candidate() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;

    for server in [&primary, &secondary] {
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(server)
            .await;
    }

    let fetcher = fetcher_with_fallback(&secondary);
    let url = format!("{}/galleries/100/5.webp", primary.uri());
    let result = fetcher
        .fetch(FetchRequest {
            index: 4,
            url: &url,
            gallery_id: "42",
        })
        .await;

    match result {
        Err(FetchError::Exhausted {
            index,
            candidates,
            last_error,
        }) => {
            assert_eq!(index, 4);
            // webp, jpg, png on each of the two hosts
            assert_eq!(candidates, 6);
            assert!(last_error.contains("404"), "last error: {last_error}");
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert_eq!(request_count(&primary).await, 3);
    assert_eq!(request_count(&secondary).await, 3);
    assert!(fetcher.preferred_authority("42").is_none());
}

#[tokio::test]
async fn test_fetch_invalid_url() {
    let fetcher = ResourceFetcher::new(HttpClient::new(), FetcherOptions::default());
    let result = fetcher
        .fetch(FetchRequest {
            index: 2,
            url: "not a url",
            gallery_id: "42",
        })
        .await;

    assert!(matches!(result, Err(FetchError::InvalidUrl { index: 2, .. })));
}
