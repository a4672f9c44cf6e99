//! Retry logic with backoff for transient page download failures.
//!
//! This module provides the [`RetryPolicy`] and [`FailureType`] types for
//! classifying download errors and determining retry behavior for one
//! candidate URL.
//!
//! # Overview
//!
//! When a download attempt fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Timeout`] - The request timed out; backs off steeply
//! - [`FailureType::Transient`] - Connection resets, 5xx, non-image bodies
//! - [`FailureType::RateLimited`] - Server rate limiting (HTTP 429)
//! - [`FailureType::Permanent`] - Retrying the same URL would not help
//!
//! In [`BackoffMode::Smart`] timeouts wait `min(base * 2^n, 10s)` while other
//! transient failures wait the shorter, flatter `min(base * 0.5 * 1.5^n, 5s)`.
//! [`BackoffMode::Fixed`] always waits `base`.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use gallery_core::download::{
//!     BackoffMode, DownloadError, RetryDecision, RetryPolicy, classify_error,
//! };
//!
//! let policy = RetryPolicy::new(3, Duration::from_secs(1), BackoffMode::Smart);
//! let error = DownloadError::http_status("https://i.example.com/1.jpg", 503);
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::DownloadError;
use super::constants::{TIMEOUT_BACKOFF_CAP, TRANSIENT_BACKOFF_CAP};

/// Default maximum retry attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between attempts (1 second).
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Maximum jitter added to delays (250ms).
const MAX_JITTER: Duration = Duration::from_millis(250);

/// Classification of download failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// The request timed out (client timeout or HTTP 408).
    Timeout,

    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: connection reset, 5xx server errors, non-image response.
    Transient,

    /// Server rate limiting (HTTP 429).
    RateLimited,

    /// Permanent failure for this URL.
    ///
    /// Examples: 404 Not Found, 410 Gone, invalid URL, oversized body.
    Permanent,
}

/// How delays grow between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffMode {
    /// Steep growth after timeouts, short flat growth after other errors.
    #[default]
    Smart,
    /// Always wait the base delay.
    Fixed,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Retry behavior for one candidate URL.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `base_delay`: 1 second
/// - `mode`: [`BackoffMode::Smart`]
/// - jitter: enabled (up to 250ms)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Delay growth mode.
    mode: BackoffMode,

    /// Whether random jitter is added to each delay.
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_RETRY_DELAY,
            mode: BackoffMode::Smart,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum attempts including initial (clamped to >= 1)
    /// * `base_delay` - Base delay for the first retry
    /// * `mode` - Delay growth mode
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, mode: BackoffMode) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            mode,
            jitter: true,
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Derives the per-candidate policy from a configured retry count.
    ///
    /// Every candidate URL gets `retries - 1` attempts (at least one), since a
    /// page already has several host/extension candidates to fall back on.
    #[must_use]
    pub fn for_candidates(retries: u32, base_delay: Duration, mode: BackoffMode) -> Self {
        Self::new(retries.saturating_sub(1), base_delay, mode)
    }

    /// Disables random jitter (useful for deterministic tests).
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the configured backoff mode.
    #[must_use]
    pub fn mode(&self) -> BackoffMode {
        self.mode
    }

    /// Determines whether to retry a failed attempt.
    ///
    /// `attempt` is the attempt number that just failed (1-indexed).
    #[instrument(level = "trace", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(failure_type, attempt);
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the delay after `attempt` failed with `failure_type`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn calculate_delay(&self, failure_type: FailureType, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));

        let delay_ms = match (self.mode, failure_type) {
            (BackoffMode::Fixed, _) => base_ms,
            (BackoffMode::Smart, FailureType::Timeout) => {
                (base_ms * 2f64.powf(exponent)).min(TIMEOUT_BACKOFF_CAP.as_millis() as f64)
            }
            (BackoffMode::Smart, _) => {
                (base_ms * 0.5 * 1.5f64.powf(exponent))
                    .min(TRANSIENT_BACKOFF_CAP.as_millis() as f64)
            }
        };

        let jitter = if self.jitter {
            self.calculate_jitter()
        } else {
            Duration::ZERO
        };

        Duration::from_millis(delay_ms as u64) + jitter
    }

    /// Generates random jitter between 0 and `MAX_JITTER`.
    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let jitter_ms = rng.gen_range(0..=MAX_JITTER.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }
}

/// Classifies a download error into a failure type for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | Timeout, HTTP 408 | Timeout |
/// | HTTP 429 | RateLimited |
/// | HTTP 5xx | Transient |
/// | Other HTTP 4xx | Permanent |
/// | Network (TLS) | Permanent |
/// | Network (other) | Transient |
/// | Non-image body | Transient |
/// | Oversized body, invalid URL | Permanent |
#[instrument(level = "trace")]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::Timeout { .. } => FailureType::Timeout,
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),
        DownloadError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        DownloadError::NotAnImage { .. } => FailureType::Transient,
        DownloadError::TooLarge { .. } | DownloadError::InvalidUrl { .. } => {
            FailureType::Permanent
        }
    }
}

/// Classifies an HTTP status code into a failure type.
#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Timeout,
        429 => FailureType::RateLimited,
        status if (500..600).contains(&status) => FailureType::Transient,
        status if (400..500).contains(&status) => FailureType::Permanent,
        _ => FailureType::Transient,
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
