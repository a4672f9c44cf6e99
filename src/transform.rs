//! Image transform collaborator.
//!
//! The acquisition pipeline and the packagers only see the
//! [`ImageTransformer`] trait: bytes and a format in, bytes and a format out.
//! Transforms are pure and CPU-bound, so async callers run them through
//! [`tokio::task::spawn_blocking`] (see [`transform_or_original`]).
//!
//! Two implementations ship with the crate:
//! - [`PassthroughTransformer`] returns its input unchanged
//! - [`RasterTransformer`] decodes and re-encodes with the `image` crate

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

/// Default JPEG quality for re-encoded pages.
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Watermark opacity used by the protective pass.
const WATERMARK_OPACITY: f32 = 0.15;

/// Image container formats the crate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageFormat {
    /// JPEG.
    Jpeg,
    /// PNG.
    Png,
    /// GIF.
    Gif,
    /// WebP.
    WebP,
    /// Anything else.
    Unknown,
}

impl PageFormat {
    /// Maps a file extension (`jpg`, `jpeg`, `png`, `gif`, `webp`).
    #[must_use]
    pub fn from_extension(ext: &str) -> Self {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Self::Jpeg,
            "png" => Self::Png,
            "gif" => Self::Gif,
            "webp" => Self::WebP,
            _ => Self::Unknown,
        }
    }

    /// Detects the format from magic bytes.
    #[must_use]
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Self::Jpeg
        } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Self::Png
        } else if bytes.starts_with(b"GIF8") {
            Self::Gif
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Self::WebP
        } else {
            Self::Unknown
        }
    }

    /// Canonical file extension.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::WebP => "webp",
            Self::Unknown => "bin",
        }
    }

    /// Whether the container already carries compressed data.
    #[must_use]
    pub fn is_compressed(self) -> bool {
        matches!(self, Self::Jpeg | Self::Png | Self::Gif | Self::WebP)
    }

    fn image_format(self) -> Option<ImageFormat> {
        match self {
            Self::Jpeg => Some(ImageFormat::Jpeg),
            Self::Png => Some(ImageFormat::Png),
            Self::Gif => Some(ImageFormat::Gif),
            Self::WebP => Some(ImageFormat::WebP),
            Self::Unknown => None,
        }
    }
}

/// Output of a transform.
#[derive(Debug, Clone)]
pub struct Transformed {
    /// Encoded bytes.
    pub bytes: Bytes,
    /// Format of `bytes`.
    pub format: PageFormat,
}

/// Errors raised by transforms.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Input could not be decoded.
    #[error("failed to decode image: {source}")]
    Decode {
        /// Underlying codec error.
        #[source]
        source: image::ImageError,
    },

    /// Output could not be encoded.
    #[error("failed to encode {format:?}: {source}")]
    Encode {
        /// Requested output format.
        format: PageFormat,
        /// Underlying codec error.
        #[source]
        source: image::ImageError,
    },

    /// The requested output format has no encoder.
    #[error("unsupported target format {format:?}")]
    Unsupported {
        /// Requested output format.
        format: PageFormat,
    },

    /// The blocking worker running the transform died.
    #[error("transform task failed: {reason}")]
    Task {
        /// Join error message.
        reason: String,
    },
}

/// Stateless bytes-to-bytes image transform.
pub trait ImageTransformer: Send + Sync {
    /// Re-encodes `bytes` (currently `format`) as `target` at `quality` (1-100).
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] if decoding or encoding fails.
    fn transform(
        &self,
        bytes: &[u8],
        format: PageFormat,
        target: PageFormat,
        quality: u8,
    ) -> Result<Transformed, TransformError>;

    /// Alters the image just enough to change its fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] if decoding or encoding fails.
    fn apply_protective_pass(&self, bytes: &[u8]) -> Result<Transformed, TransformError>;
}

/// Transform that returns its input untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTransformer;

impl ImageTransformer for PassthroughTransformer {
    fn transform(
        &self,
        bytes: &[u8],
        format: PageFormat,
        _target: PageFormat,
        _quality: u8,
    ) -> Result<Transformed, TransformError> {
        Ok(Transformed {
            bytes: Bytes::copy_from_slice(bytes),
            format,
        })
    }

    fn apply_protective_pass(&self, bytes: &[u8]) -> Result<Transformed, TransformError> {
        Ok(Transformed {
            bytes: Bytes::copy_from_slice(bytes),
            format: PageFormat::sniff(bytes),
        })
    }
}

/// Transform backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct RasterTransformer;

impl RasterTransformer {
    fn decode(bytes: &[u8], format: PageFormat) -> Result<DynamicImage, TransformError> {
        let sniffed = PageFormat::sniff(bytes);
        let hint = if sniffed == PageFormat::Unknown { format } else { sniffed };
        match hint.image_format() {
            Some(fmt) => image::load_from_memory_with_format(bytes, fmt),
            None => image::load_from_memory(bytes),
        }
        .map_err(|source| TransformError::Decode { source })
    }

    fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Bytes, TransformError> {
        let (width, height) = img.dimensions();
        let quality = adjusted_quality(width, height, quality);
        let rgb = img.to_rgb8();

        let mut out = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode_image(&rgb)
            .map_err(|source| TransformError::Encode {
                format: PageFormat::Jpeg,
                source,
            })?;
        Ok(Bytes::from(out.into_inner()))
    }

    fn encode_png(img: &DynamicImage) -> Result<Bytes, TransformError> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png)
            .map_err(|source| TransformError::Encode {
                format: PageFormat::Png,
                source,
            })?;
        Ok(Bytes::from(out.into_inner()))
    }
}

impl ImageTransformer for RasterTransformer {
    fn transform(
        &self,
        bytes: &[u8],
        format: PageFormat,
        target: PageFormat,
        quality: u8,
    ) -> Result<Transformed, TransformError> {
        let img = Self::decode(bytes, format)?;
        let bytes = match target {
            PageFormat::Jpeg => Self::encode_jpeg(&img, quality)?,
            PageFormat::Png => Self::encode_png(&img)?,
            other => return Err(TransformError::Unsupported { format: other }),
        };
        Ok(Transformed {
            bytes,
            format: target,
        })
    }

    fn apply_protective_pass(&self, bytes: &[u8]) -> Result<Transformed, TransformError> {
        let img = Self::decode(bytes, PageFormat::Unknown)?;
        let mut rgba = img.to_rgba8();

        let mut rng = rand::thread_rng();
        let digit = rng.gen_range(0..10u8);
        let corner = rng.gen_range(0..4u8);
        draw_watermark(&mut rgba, digit, corner);

        let bytes = Self::encode_jpeg(&DynamicImage::ImageRgba8(rgba), DEFAULT_JPEG_QUALITY)?;
        Ok(Transformed {
            bytes,
            format: PageFormat::Jpeg,
        })
    }
}

/// Runs `transform` on the blocking pool, keeping the original on failure.
pub async fn transform_or_original(
    transformer: Arc<dyn ImageTransformer>,
    bytes: Bytes,
    format: PageFormat,
    target: PageFormat,
    quality: u8,
) -> Transformed {
    let input = bytes.clone();
    let result = tokio::task::spawn_blocking(move || {
        transformer.transform(&input, format, target, quality)
    })
    .await
    .map_err(|e| TransformError::Task {
        reason: e.to_string(),
    })
    .and_then(|r| r);

    match result {
        Ok(out) => out,
        Err(e) => {
            warn!(error = %e, ?target, "transform failed, using original bytes");
            Transformed { bytes, format }
        }
    }
}

/// Runs the protective pass on the blocking pool, keeping the original on failure.
pub async fn protect_or_original(
    transformer: Arc<dyn ImageTransformer>,
    bytes: Bytes,
    format: PageFormat,
) -> Transformed {
    let input = bytes.clone();
    let result = tokio::task::spawn_blocking(move || transformer.apply_protective_pass(&input))
        .await
        .map_err(|e| TransformError::Task {
            reason: e.to_string(),
        })
        .and_then(|r| r);

    match result {
        Ok(out) => {
            debug!(from = ?format, to = ?out.format, "protective pass applied");
            out
        }
        Err(e) => {
            warn!(error = %e, "protective pass failed, using original bytes");
            Transformed { bytes, format }
        }
    }
}

/// Nudges JPEG quality by image size: large pages lose 10, tiny ones gain 5.
fn adjusted_quality(width: u32, height: u32, quality: u8) -> u8 {
    let pixels = u64::from(width) * u64::from(height);
    let adjusted = if pixels > 4_000_000 {
        quality.saturating_sub(10)
    } else if pixels < 500_000 {
        quality.saturating_add(5)
    } else {
        quality
    };
    adjusted.clamp(1, 100)
}

/// 5x7 bitmap glyphs for the digits 0-9, one row per byte (low 5 bits).
const DIGIT_GLYPHS: [[u8; 7]; 10] = [
    [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
    [0b00100, 0b01100, 0b10100, 0b00100, 0b00100, 0b00100, 0b11111],
    [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
    [0b01110, 0b10001, 0b00001, 0b00110, 0b00001, 0b10001, 0b01110],
    [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
    [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
    [0b01110, 0b10001, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
    [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
    [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
    [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b10001, 0b01110],
];

/// Blends a black digit at low opacity into one corner (0 TL, 1 TR, 2 BR, 3 BL).
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
fn draw_watermark(rgba: &mut RgbaImage, digit: u8, corner: u8) {
    let (width, height) = rgba.dimensions();
    let scale = (width / 150).max(8);
    let margin = (scale / 2) as i64;
    let text_w = i64::from(5 * scale);
    let text_h = i64::from(7 * scale);
    let (w, h) = (i64::from(width), i64::from(height));

    let (x0, y0) = match corner {
        0 => (margin, margin),
        1 => (w - margin - text_w, margin),
        2 => (w - margin - text_w, h - margin - text_h),
        _ => (margin, h - margin - text_h),
    };

    let glyph = DIGIT_GLYPHS[usize::from(digit.min(9))];
    let fg = Rgba([0u8, 0, 0, 255]);
    for (gy, row) in glyph.iter().enumerate() {
        for gx in 0..5i64 {
            if row & (1 << (4 - gx)) == 0 {
                continue;
            }
            for sy in 0..i64::from(scale) {
                for sx in 0..i64::from(scale) {
                    let x = x0 + gx * i64::from(scale) + sx;
                    let y = y0 + gy as i64 * i64::from(scale) + sy;
                    if x < 0 || y < 0 || x >= w || y >= h {
                        continue;
                    }
                    let px = rgba.get_pixel_mut(x as u32, y as u32);
                    for c in 0..3 {
                        let src = f32::from(px[c]);
                        let out = src * (1.0 - WATERMARK_OPACITY) + f32::from(fg[c]) * WATERMARK_OPACITY;
                        px[c] = out.round().clamp(0.0, 255.0) as u8;
                    }
                }
            }
        }
    }
}
