//! TOML configuration file.
//!
//! Every field has a default, so a missing file or a partial file is fine.
//!
//! ```toml
//! [network]
//! concurrency = 10
//! timeout_secs = 15
//! retries = 3
//!
//! [cache]
//! image_cache_max_mb = 1024
//! document_cache_ttl_hours = 0   # never expires
//!
//! [output]
//! prepend_id_to_file = true
//! zip_compression_level = 6
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::CacheOptions;
use crate::download::{
    BackoffMode, DEFAULT_REFERER_BASE, FetcherOptions, RetryPolicy,
    constants::{IMAGE_HOST_FALLBACK, THUMB_HOST_FALLBACK},
};
use crate::job::{DEFAULT_API_BASE, DEFAULT_IMAGE_BASE, OrchestratorOptions};
use crate::package::{
    DEFAULT_COMPRESSION_LEVEL, DEFAULT_RECOMPRESSION_THRESHOLD_KB, DocumentOptions,
};
use crate::pipeline::{DEFAULT_CONCURRENCY, PipelineOptions};
use crate::transform::DEFAULT_JPEG_QUALITY;

const APP_DIR: &str = "gallery-fetch";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// Config file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// Config file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is outside its allowed range.
    #[error("invalid config value for `{field}`: {value}. Expected range: {expected}")]
    OutOfRange {
        /// Dotted field name.
        field: &'static str,
        /// Rejected value.
        value: String,
        /// Allowed range.
        expected: &'static str,
    },
}

/// `[network]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Concurrent page downloads per job.
    pub concurrency: usize,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Retry count; each candidate URL gets `retries - 1` attempts.
    pub retries: u32,
    /// Base retry delay in seconds.
    pub retry_delay_secs: u64,
    /// Grow the delay by failure class instead of using a fixed delay.
    pub smart_retry: bool,
    /// Prefer the host that last succeeded for the same gallery.
    pub host_affinity: bool,
    /// Fallback authorities for image hosts.
    pub image_fallback_hosts: Vec<String>,
    /// Fallback authorities for thumbnail hosts.
    pub thumb_fallback_hosts: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout_secs: 15,
            retries: 3,
            retry_delay_secs: 1,
            smart_retry: true,
            host_affinity: true,
            image_fallback_hosts: IMAGE_HOST_FALLBACK.iter().map(ToString::to_string).collect(),
            thumb_fallback_hosts: THUMB_HOST_FALLBACK.iter().map(ToString::to_string).collect(),
        }
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Base directory for every cache; defaults to the user cache dir.
    pub dir: Option<PathBuf>,
    /// Enable the raw and processed page caches.
    pub image_cache_enabled: bool,
    /// Page cache TTL in hours; `0` never expires.
    pub image_cache_ttl_hours: u64,
    /// Page cache budget in MiB, per instance.
    pub image_cache_max_mb: u64,
    /// Enable the finished-document cache.
    pub document_cache_enabled: bool,
    /// Document cache TTL in hours; `0` never expires.
    pub document_cache_ttl_hours: u64,
    /// Document cache budget in MiB.
    pub document_cache_max_mb: u64,
    /// Idle window before the index is written, in milliseconds.
    pub persist_debounce_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            image_cache_enabled: true,
            image_cache_ttl_hours: 24,
            image_cache_max_mb: 1024,
            document_cache_enabled: true,
            document_cache_ttl_hours: 0,
            document_cache_max_mb: 2048,
            persist_debounce_ms: 5000,
        }
    }
}

/// `[output]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Where artifacts are written; defaults to the working directory.
    pub download_path: Option<PathBuf>,
    /// Prefix filenames with `[id] `.
    pub prepend_id_to_file: bool,
    /// Zip deflate level.
    pub zip_compression_level: u32,
    /// Recompress large JPEG pages in documents.
    pub pdf_enable_compression: bool,
    /// JPEG quality for document pages.
    pub pdf_compression_quality: u8,
    /// Pages at or below this size (KiB) are not recompressed.
    pub pdf_jpeg_recompression_size_kb: u64,
    /// Run the protective pass on every page.
    pub protective_pass: bool,
    /// Password used when none is given on the command line.
    pub default_password: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            download_path: None,
            prepend_id_to_file: false,
            zip_compression_level: DEFAULT_COMPRESSION_LEVEL,
            pdf_enable_compression: false,
            pdf_compression_quality: DEFAULT_JPEG_QUALITY,
            pdf_jpeg_recompression_size_kb: DEFAULT_RECOMPRESSION_THRESHOLD_KB,
            protective_pass: false,
            default_password: None,
        }
    }
}

/// `[api]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Metadata API base URL.
    pub base_url: String,
    /// Base of page image URLs.
    pub image_base: String,
    /// Site sent as `Referer`; empty disables the header.
    pub referer_base: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            image_base: DEFAULT_IMAGE_BASE.to_string(),
            referer_base: DEFAULT_REFERER_BASE.to_string(),
        }
    }
}

/// Whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// See [`NetworkConfig`].
    pub network: NetworkConfig,
    /// See [`CacheConfig`].
    pub cache: CacheConfig,
    /// See [`OutputConfig`].
    pub output: OutputConfig,
    /// See [`ApiConfig`].
    pub api: ApiConfig,
}

impl AppConfig {
    /// Parses and validates `raw`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::OutOfRange`] for invalid values.
    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, or defaults when it does not exist.
    ///
    /// # Errors
    ///
    /// See [`from_toml_str`](Self::from_toml_str); also [`ConfigError::Read`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw, path)
    }

    /// Loads the file at [`default_config_path`], or defaults.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn load_default() -> Result<Self, ConfigError> {
        match default_config_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Validates every ranged value.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::OutOfRange`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check("network.concurrency", self.network.concurrency, 1..=25, "1..=25")?;
        check("network.timeout_secs", self.network.timeout_secs, 5..=300, "5..=300")?;
        check("network.retries", self.network.retries, 0..=5, "0..=5")?;
        check("network.retry_delay_secs", self.network.retry_delay_secs, 0..=60, "0..=60")?;
        check("output.zip_compression_level", self.output.zip_compression_level, 0..=9, "0..=9")?;
        check(
            "output.pdf_compression_quality",
            self.output.pdf_compression_quality,
            1..=100,
            "1..=100",
        )?;
        Ok(())
    }

    /// Fetcher options derived from `[network]` and `[api]`.
    #[must_use]
    pub fn fetcher_options(&self) -> FetcherOptions {
        let mode = if self.network.smart_retry {
            BackoffMode::Smart
        } else {
            BackoffMode::Fixed
        };
        FetcherOptions {
            retry: RetryPolicy::for_candidates(
                self.network.retries,
                Duration::from_secs(self.network.retry_delay_secs),
                mode,
            ),
            host_affinity: self.network.host_affinity,
            image_fallback: self.network.image_fallback_hosts.clone(),
            thumb_fallback: self.network.thumb_fallback_hosts.clone(),
            referer_base: Some(self.api.referer_base.clone()).filter(|b| !b.is_empty()),
            ..FetcherOptions::default()
        }
    }

    /// Request timeout for page downloads.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.network.timeout_secs)
    }

    /// Options for the raw and processed page caches.
    #[must_use]
    pub fn image_cache_options(&self) -> CacheOptions {
        self.cache_options(self.cache.image_cache_max_mb, self.cache.image_cache_ttl_hours)
    }

    /// Options for the document cache.
    #[must_use]
    pub fn document_cache_options(&self) -> CacheOptions {
        self.cache_options(self.cache.document_cache_max_mb, self.cache.document_cache_ttl_hours)
    }

    fn cache_options(&self, max_mb: u64, ttl_hours: u64) -> CacheOptions {
        CacheOptions {
            max_bytes: max_mb.saturating_mul(1024 * 1024),
            ttl: (ttl_hours > 0).then(|| Duration::from_secs(ttl_hours.saturating_mul(3600))),
            persist_debounce: Duration::from_millis(self.cache.persist_debounce_ms),
        }
    }

    /// Base directory for the caches.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .dir
            .clone()
            .or_else(default_cache_dir)
            .unwrap_or_else(|| env::temp_dir().join(APP_DIR))
    }

    /// Orchestrator options derived from the whole file.
    #[must_use]
    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            image_base: self.api.image_base.clone(),
            prepend_id: self.output.prepend_id_to_file,
            pipeline: PipelineOptions {
                concurrency: self.network.concurrency,
                protective_pass: self.output.protective_pass,
                ..PipelineOptions::default()
            },
            archive_compression_level: self.output.zip_compression_level,
            document: DocumentOptions {
                quality: self.output.pdf_compression_quality,
                enable_compression: self.output.pdf_enable_compression,
                recompression_threshold_kb: self.output.pdf_jpeg_recompression_size_kb,
                pages_protected: self.output.protective_pass,
                ..DocumentOptions::default()
            },
            default_password: self.output.default_password.clone(),
            ..OrchestratorOptions::default()
        }
    }
}

fn check<T>(
    field: &'static str,
    value: T,
    range: std::ops::RangeInclusive<T>,
    expected: &'static str,
) -> Result<(), ConfigError>
where
    T: PartialOrd + ToString,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            expected,
        })
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/gallery-fetch/config.toml`
/// 2. `$HOME/.config/gallery-fetch/config.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join(APP_DIR).join("config.toml"));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join("config.toml"),
    )
}

fn default_cache_dir() -> Option<PathBuf> {
    if let Some(xdg) = env_var_non_empty_os("XDG_CACHE_HOME") {
        return Some(PathBuf::from(xdg).join(APP_DIR));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(PathBuf::from(home).join(".cache").join(APP_DIR))
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}
