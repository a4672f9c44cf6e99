//! Zip archive packager.

use std::io::{Cursor, Write};
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use zip::write::SimpleFileOptions;
use zip::{AesMode, CompressionMethod, ZipWriter};

use super::{PackageError, PageSource};
use crate::transform::PageFormat;

/// Deflate level used when none is configured.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Minimum width of the zero-padded entry number.
const MIN_NAME_WIDTH: usize = 3;

/// Archive packaging options.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Deflate level, `0..=9`. `0` stores every entry.
    pub compression_level: u32,
    /// Encrypt every entry with AES-256 under this password.
    pub password: Option<String>,
    /// Folder inside the archive holding the pages; empty for the root.
    pub folder: String,
    /// Pages were re-encoded upstream, so compressed formats are stored as-is.
    pub pages_transformed: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            password: None,
            folder: String::new(),
            pages_transformed: false,
        }
    }
}

/// A finished archive.
#[derive(Debug, Clone)]
pub struct ArchiveArtifact {
    /// Complete zip file.
    pub bytes: Bytes,
    /// Entries written.
    pub entries: usize,
    /// Whether entries are AES encrypted.
    pub encrypted: bool,
}

/// Streams pages into an in-memory zip.
#[derive(Debug, Clone, Default)]
pub struct ArchivePackager {
    options: ArchiveOptions,
}

impl ArchivePackager {
    /// Creates a packager.
    #[must_use]
    pub fn new(options: ArchiveOptions) -> Self {
        Self { options }
    }

    /// Consumes `source` until exhausted and returns the finished archive.
    ///
    /// Entries are named `{folder}/{index + 1}.{ext}` with the number
    /// zero-padded to at least three digits, so names keep their gaps when
    /// pages are missing.
    ///
    /// # Errors
    ///
    /// - [`PackageError::Aborted`] if `cancel` fires
    /// - [`PackageError::NoPages`] if the source yields nothing
    /// - [`PackageError::Archive`] if the zip writer fails
    /// - [`PackageError::Worker`] if a blocking write task dies
    ///
    /// No partial archive is returned on error.
    #[instrument(skip_all, fields(total = total, encrypted = self.options.password.is_some()))]
    pub async fn package(
        &self,
        source: &mut dyn PageSource,
        total: usize,
        cancel: &CancellationToken,
    ) -> Result<ArchiveArtifact, PackageError> {
        let width = name_width(total);
        let password: Option<Arc<str>> = self
            .options
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(Arc::from);
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let mut entries = 0usize;

        loop {
            let page = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PackageError::Aborted),
                page = source.next_page() => page,
            };
            let Some(page) = page else { break };

            let name = entry_name(&self.options.folder, page.index, width, &page.extension);
            let options = self.entry_options(PageFormat::from_extension(&page.extension));
            writer = append_entry(writer, name.clone(), options, password.clone(), page.bytes).await?;
            entries += 1;
            debug!(index = page.index, name = %name, "archived page");
        }

        if entries == 0 {
            return Err(PackageError::NoPages);
        }

        let bytes = tokio::task::spawn_blocking(move || writer.finish())
            .await
            .map_err(PackageError::worker)?
            .map_err(PackageError::archive)?
            .into_inner();
        info!(entries, size = bytes.len(), "archive finished");
        Ok(ArchiveArtifact {
            bytes: Bytes::from(bytes),
            entries,
            encrypted: password.is_some(),
        })
    }

    fn entry_options(&self, format: PageFormat) -> SimpleFileOptions {
        let level = self.options.compression_level.min(9);
        let store = level == 0 || (self.options.pages_transformed && format.is_compressed());
        if store {
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
        } else {
            SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(i64::from(level)))
        }
    }
}

/// Writes one entry on the blocking pool and hands the writer back.
async fn append_entry(
    mut writer: ZipWriter<Cursor<Vec<u8>>>,
    name: String,
    options: SimpleFileOptions,
    password: Option<Arc<str>>,
    bytes: Bytes,
) -> Result<ZipWriter<Cursor<Vec<u8>>>, PackageError> {
    tokio::task::spawn_blocking(move || {
        match password.as_deref() {
            Some(password) => writer.start_file(
                name.as_str(),
                options.with_aes_encryption(AesMode::Aes256, password),
            ),
            None => writer.start_file(name.as_str(), options),
        }
        .map_err(PackageError::archive)?;
        writer
            .write_all(&bytes)
            .map_err(|e| PackageError::archive(e.into()))?;
        Ok(writer)
    })
    .await
    .map_err(PackageError::worker)?
}

fn name_width(total: usize) -> usize {
    total.to_string().len().max(MIN_NAME_WIDTH)
}

fn entry_name(folder: &str, index: usize, width: usize, extension: &str) -> String {
    let folder = folder.trim_matches('/');
    let ext = if extension.is_empty() { "bin" } else { extension };
    if folder.is_empty() {
        format!("{:0width$}.{ext}", index + 1)
    } else {
        format!("{folder}/{:0width$}.{ext}", index + 1)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::pipeline::PageImage;
    use std::io::Read;

    fn page(index: usize, body: &str) -> PageImage {
        PageImage {
            index,
            bytes: Bytes::from(body.to_string()),
            extension: "jpg".to_string(),
            gallery_id: "42".to_string(),
            media_id: "7".to_string(),
            processed: None,
        }
    }

    // ==================== Naming Tests ====================

    #[test]
    fn test_entry_name_padding() {
        assert_eq!(entry_name("Title", 0, 3, "jpg"), "Title/001.jpg");
        assert_eq!(entry_name("", 41, 3, "png"), "042.png");
        assert_eq!(entry_name("/x/", 9, 4, ""), "x/0010.bin");
    }

    #[test]
    fn test_name_width_grows_with_total() {
        assert_eq!(name_width(0), 3);
        assert_eq!(name_width(999), 3);
        assert_eq!(name_width(1000), 4);
    }

    // ==================== Packaging Tests ====================

    #[tokio::test]
    async fn test_package_keeps_order_and_gaps() {
        let packager = ArchivePackager::new(ArchiveOptions {
            folder: "Gallery".to_string(),
            ..ArchiveOptions::default()
        });
        let mut source = vec![page(0, "zero"), page(1, "one"), page(3, "three")].into_iter();

        let artifact = packager
            .package(&mut source, 4, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(artifact.entries, 3);
        assert!(!artifact.encrypted);

        let mut zip = zip::ZipArchive::new(Cursor::new(artifact.bytes.to_vec())).unwrap();
        let names: Vec<String> = zip.file_names().map(ToString::to_string).collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"Gallery/004.jpg".to_string()));
        assert!(!names.contains(&"Gallery/003.jpg".to_string()));

        let mut body = String::new();
        zip.by_name("Gallery/002.jpg")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "one");
    }

    #[tokio::test]
    async fn test_package_encrypts_with_password() {
        let packager = ArchivePackager::new(ArchiveOptions {
            password: Some("pw".to_string()),
            ..ArchiveOptions::default()
        });
        let mut source = vec![page(0, "secret page")].into_iter();

        let artifact = packager
            .package(&mut source, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert!(artifact.encrypted);

        let mut zip = zip::ZipArchive::new(Cursor::new(artifact.bytes.to_vec())).unwrap();
        assert!(zip.by_index_raw(0).unwrap().encrypted());
        let raw = artifact.bytes.to_vec();
        assert!(!raw.windows(11).any(|w| w == b"secret page"));
    }

    #[tokio::test]
    async fn test_transformed_pages_are_stored() {
        let packager = ArchivePackager::new(ArchiveOptions {
            pages_transformed: true,
            ..ArchiveOptions::default()
        });
        let mut source = vec![page(0, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")].into_iter();
        let artifact = packager
            .package(&mut source, 1, &CancellationToken::new())
            .await
            .unwrap();

        let mut zip = zip::ZipArchive::new(Cursor::new(artifact.bytes.to_vec())).unwrap();
        assert_eq!(zip.by_index(0).unwrap().compression(), CompressionMethod::Stored);
    }

    #[tokio::test]
    async fn test_compression_leaves_the_runtime_responsive() {
        // Incompressible pages keep deflate busy for a while
        let mut state = 0x2545_f491_u32;
        let pages: Vec<PageImage> = (0..6)
            .map(|index| {
                let body: Vec<u8> = (0..1 << 20)
                    .map(|_| {
                        state ^= state << 13;
                        state ^= state >> 17;
                        state ^= state << 5;
                        state.to_le_bytes()[0]
                    })
                    .collect();
                PageImage {
                    bytes: Bytes::from(body),
                    extension: "bin".to_string(),
                    ..page(index, "")
                }
            })
            .collect();

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = Arc::clone(&ticks);
            async move {
                loop {
                    ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    tokio::task::yield_now().await;
                }
            }
        });

        let packager = ArchivePackager::new(ArchiveOptions {
            compression_level: 9,
            ..ArchiveOptions::default()
        });
        let artifact = packager
            .package(&mut pages.into_iter(), 6, &CancellationToken::new())
            .await
            .unwrap();
        ticker.abort();

        assert_eq!(artifact.entries, 6);
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_empty_source_is_an_error() {
        let packager = ArchivePackager::default();
        let mut source = Vec::<PageImage>::new().into_iter();
        let err = packager
            .package(&mut source, 5, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PackageError::NoPages));
    }

    #[tokio::test]
    async fn test_cancelled_job_is_aborted() {
        let packager = ArchivePackager::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut source = vec![page(0, "x")].into_iter();
        let err = packager.package(&mut source, 1, &cancel).await.unwrap_err();
        assert!(matches!(err, PackageError::Aborted));
    }
}
