//! Constants for the download module (timeouts, fallback hosts, body limits).

use std::time::Duration;

/// Default HTTP connect timeout (10 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default per-request timeout for a single image (15 seconds).
pub const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Largest response body accepted for a single page (64 MiB).
pub const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

/// Fallback authorities tried after a full-size image host (`i.`) fails.
pub const IMAGE_HOST_FALLBACK: [&str; 3] = ["i2.nhentai.net", "i3.nhentai.net", "i4.nhentai.net"];

/// Fallback authorities tried after a thumbnail host (`t.`) fails.
pub const THUMB_HOST_FALLBACK: [&str; 3] = ["t2.nhentai.net", "t3.nhentai.net", "t4.nhentai.net"];

/// Extensions tried when the server mis-serves the advertised one.
pub const FALLBACK_EXTENSIONS: [&str; 2] = ["jpg", "png"];

/// Upper bound for backoff after a timeout-class failure.
pub const TIMEOUT_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Upper bound for backoff after any other transient failure.
pub const TRANSIENT_BACKOFF_CAP: Duration = Duration::from_secs(5);
