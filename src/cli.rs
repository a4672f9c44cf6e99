//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;
use std::sync::LazyLock;

use clap::{Parser, ValueEnum};
use gallery_core::OutputKind;
use regex::Regex;

/// Gallery links on the supported sites.
#[allow(clippy::expect_used)]
static GALLERY_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:https?://)?(?:www\.)?(?:nhentai\.net|nhentai\.to)/g/(\d+)/?(?:[?#].*)?$")
        .expect("gallery url regex is valid")
});

/// Fetch an image gallery and package it as PDF, ZIP or plain images.
#[derive(Parser, Debug)]
#[command(name = "gallery-fetch")]
#[command(author, version, about)]
pub struct Args {
    /// Gallery id or gallery URL
    pub gallery: String,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Pdf)]
    pub output: OutputFormat,

    /// Password for the PDF or ZIP (overrides the config default)
    #[arg(short, long)]
    pub password: Option<String>,

    /// Concurrent page downloads (1-25)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=25))]
    pub concurrency: Option<u8>,

    /// Retry count per page (0-5)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=5))]
    pub retries: Option<u8>,

    /// Directory the artifact is written to
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    /// Config file (default: $XDG_CONFIG_HOME/gallery-fetch/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bypass every disk cache
    #[arg(long)]
    pub no_cache: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Output format flag values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Single PDF document
    Pdf,
    /// Zip archive
    Zip,
    /// Numbered image files
    Img,
}

impl From<OutputFormat> for OutputKind {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Pdf => Self::Document,
            OutputFormat::Zip => Self::Archive,
            OutputFormat::Img => Self::ImageSet,
        }
    }
}

/// Extracts a gallery id from a bare id or a gallery URL.
pub fn parse_gallery_id(input: &str) -> Option<String> {
    let input = input.trim();
    if !input.is_empty() && input.chars().all(|c| c.is_ascii_digit()) {
        return Some(input.to_string());
    }
    GALLERY_URL_PATTERN
        .captures(input)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
