//! Composite cache keys.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::transform::DEFAULT_JPEG_QUALITY;

/// Hex characters of the password digest kept in a document fingerprint.
const FINGERPRINT_LEN: usize = 16;

/// Transform settings a processed page or finished document was built with.
///
/// Artifacts built under different settings never share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformProfile {
    /// The protective pass ran on the downloaded bytes.
    pub protected: bool,
    /// JPEG quality used for conversion.
    pub quality: u8,
    /// JPEG pages above this size (KiB) are recompressed; `None` disables it.
    pub recompress_above_kb: Option<u64>,
}

impl Default for TransformProfile {
    fn default() -> Self {
        Self {
            protected: false,
            quality: DEFAULT_JPEG_QUALITY,
            recompress_above_kb: None,
        }
    }
}

impl fmt::Display for TransformProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}-q{}", u8::from(self.protected), self.quality)?;
        match self.recompress_above_kb {
            Some(kb) => write!(f, "-r{kb}"),
            None => f.write_str("-r0"),
        }
    }
}

/// Distinguishes artifacts derived from the same logical page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Variant {
    /// Bytes exactly as downloaded.
    Original,
    /// Bytes after the transform collaborator ran under `profile`.
    Processed {
        /// Settings the bytes were produced with.
        profile: TransformProfile,
    },
    /// A finished document; `fingerprint` identifies the password used.
    Document {
        /// Password fingerprint, or `nopass`.
        fingerprint: String,
        /// Settings the pages were produced with.
        profile: TransformProfile,
    },
}

/// Composite key `(gallery_id, media_id, page_index, variant)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Gallery identifier.
    pub gallery_id: String,
    /// Media identifier the page images live under.
    pub media_id: String,
    /// Zero-based page index (0 for whole-gallery artifacts).
    pub page_index: usize,
    /// Artifact variant.
    pub variant: Variant,
}

impl CacheKey {
    /// Key for downloaded page bytes.
    pub fn original(gallery_id: impl Into<String>, media_id: impl Into<String>, page_index: usize) -> Self {
        Self::new(gallery_id, media_id, page_index, Variant::Original)
    }

    /// Key for page bytes transformed under `profile`.
    pub fn processed(
        gallery_id: impl Into<String>,
        media_id: impl Into<String>,
        page_index: usize,
        profile: TransformProfile,
    ) -> Self {
        Self::new(gallery_id, media_id, page_index, Variant::Processed { profile })
    }

    /// Key for a finished document protected by `password` (if any).
    ///
    /// Only a digest prefix of the password ends up in the key.
    pub fn document(
        gallery_id: impl Into<String>,
        media_id: impl Into<String>,
        password: Option<&str>,
        profile: TransformProfile,
    ) -> Self {
        Self::new(
            gallery_id,
            media_id,
            0,
            Variant::Document {
                fingerprint: password_fingerprint(password),
                profile,
            },
        )
    }

    /// Builds a key from its parts.
    pub fn new(
        gallery_id: impl Into<String>,
        media_id: impl Into<String>,
        page_index: usize,
        variant: Variant,
    ) -> Self {
        Self {
            gallery_id: gallery_id.into(),
            media_id: media_id.into(),
            page_index,
            variant,
        }
    }

    /// SHA-256 hex digest of the rendered key, used as the on-disk file stem.
    #[must_use]
    pub fn digest(&self) -> String {
        hex(&Sha256::digest(self.to_string().as_bytes()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.gallery_id, self.media_id, self.page_index)?;
        match &self.variant {
            Variant::Original => Ok(()),
            Variant::Processed { profile } => write!(f, "-processed-{profile}"),
            Variant::Document {
                fingerprint,
                profile,
            } => write!(f, "-doc-{fingerprint}-{profile}"),
        }
    }
}

/// Fingerprint of an optional password: a SHA-256 hex prefix, or `nopass`.
#[must_use]
pub fn password_fingerprint(password: Option<&str>) -> String {
    match password.filter(|p| !p.is_empty()) {
        Some(password) => {
            let mut digest = hex(&Sha256::digest(password.as_bytes()));
            digest.truncate(FINGERPRINT_LEN);
            digest
        }
        None => "nopass".to_string(),
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(protected: bool, quality: u8) -> TransformProfile {
        TransformProfile {
            protected,
            quality,
            recompress_above_kb: None,
        }
    }

    #[test]
    fn test_key_display_variants() {
        assert_eq!(CacheKey::original("42", "1001", 3).to_string(), "42-1001-3");
        assert_eq!(
            CacheKey::processed("42", "1001", 3, profile(false, 80)).to_string(),
            "42-1001-3-processed-p0-q80-r0"
        );
        assert_eq!(
            CacheKey::document("42", "1001", None, profile(true, 70)).to_string(),
            "42-1001-0-doc-nopass-p1-q70-r0"
        );
    }

    #[test]
    fn test_transform_settings_separate_keys() {
        let plain = CacheKey::processed("42", "1001", 3, profile(false, 80));
        assert_ne!(plain, CacheKey::processed("42", "1001", 3, profile(true, 80)));
        assert_ne!(plain, CacheKey::processed("42", "1001", 3, profile(false, 60)));
        let recompressing = TransformProfile {
            recompress_above_kb: Some(500),
            ..profile(false, 80)
        };
        assert_ne!(
            plain.digest(),
            CacheKey::processed("42", "1001", 3, recompressing).digest()
        );
        assert_ne!(
            CacheKey::document("42", "1001", None, profile(false, 80)),
            CacheKey::document("42", "1001", None, profile(true, 80))
        );
    }

    #[test]
    fn test_digest_is_stable_hex() {
        let key = CacheKey::original("42", "1001", 3);
        let digest = key.digest();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, CacheKey::original("42", "1001", 3).digest());
        assert_ne!(
            digest,
            CacheKey::processed("42", "1001", 3, TransformProfile::default()).digest()
        );
    }

    #[test]
    fn test_password_fingerprint_hides_password() {
        let fp = password_fingerprint(Some("hunter2"));
        assert_eq!(fp.len(), FINGERPRINT_LEN);
        assert!(!fp.contains("hunter2"));
        assert_ne!(fp, password_fingerprint(Some("hunter3")));
        assert_eq!(password_fingerprint(Some("")), "nopass");
    }
}
