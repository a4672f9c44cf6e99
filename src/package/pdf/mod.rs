//! Streaming PDF writer for image-only documents.
//!
//! Pages are appended one at a time straight to a file, so peak memory stays
//! at one page regardless of document length. Each page is an A4 media box
//! with one JPEG image fitted and centred in it. JPEG data is embedded as-is
//! (`/DCTDecode`).
//!
//! Object layout: `1` catalog, `2` page tree, then three objects per page
//! (image, content stream, page), then the optional `/Encrypt` dictionary.

mod jpeg;
mod security;

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

pub use jpeg::{JpegInfo, read_info};
pub use security::Security;

/// A4 width in points.
pub const PAGE_WIDTH: f64 = 595.0;

/// A4 height in points.
pub const PAGE_HEIGHT: f64 = 842.0;

const CATALOG_ID: u32 = 1;
const PAGES_ID: u32 = 2;
const FIRST_FREE_ID: u32 = 3;

/// Incremental writer of an image-only PDF.
#[derive(Debug)]
pub struct PdfWriter {
    out: BufWriter<File>,
    path: PathBuf,
    offset: u64,
    offsets: Vec<u64>,
    page_ids: Vec<u32>,
    file_id: [u8; 16],
    security: Option<Security>,
}

impl PdfWriter {
    /// Creates `path` and writes the file header.
    ///
    /// `seed` determines the document `/ID`, so identical input produces an
    /// identical file. With a `password` every stream is encrypted and the
    /// password is required to open the document.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be created or written.
    pub async fn create(path: &Path, seed: &str, password: Option<&str>) -> std::io::Result<Self> {
        let file = File::create(path).await?;
        let mut file_id = [0u8; 16];
        file_id.copy_from_slice(&Sha256::digest(seed.as_bytes())[..16]);
        let security = password
            .filter(|p| !p.is_empty())
            .map(|p| Security::new(p, &file_id));

        let mut writer = Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            offset: 0,
            offsets: vec![0; FIRST_FREE_ID as usize],
            page_ids: Vec::new(),
            file_id,
            security,
        };
        writer.write(b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n").await?;
        Ok(writer)
    }

    /// Path being written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pages written so far.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    /// Whether streams are encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.security.is_some()
    }

    /// Appends one page showing `jpeg`, fitted and centred on A4.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if writing fails.
    pub async fn add_jpeg_page(&mut self, jpeg: &[u8], info: JpegInfo) -> std::io::Result<()> {
        let image_id = self.reserve();
        let content_id = self.reserve();
        let page_id = self.reserve();

        let decode = if info.components == 4 {
            " /Decode [1 0 1 0 1 0 1 0]"
        } else {
            ""
        };
        let image_dict = format!(
            "/Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace {} /BitsPerComponent 8 /Filter /DCTDecode{decode}",
            info.width,
            info.height,
            info.color_space()
        );
        self.write_stream(image_id, &image_dict, jpeg).await?;

        let placement = fit_centered(info.width, info.height);
        let content = format!(
            "q {:.2} 0 0 {:.2} {:.2} {:.2} cm /Im0 Do Q",
            placement.width, placement.height, placement.x, placement.y
        );
        self.write_stream(content_id, "", content.as_bytes()).await?;

        let page = format!(
            "<< /Type /Page /Parent {PAGES_ID} 0 R /MediaBox [0 0 {PAGE_WIDTH} {PAGE_HEIGHT}] /Resources << /XObject << /Im0 {image_id} 0 R >> >> /Contents {content_id} 0 R >>"
        );
        self.write_object(page_id, page.as_bytes()).await?;

        self.page_ids.push(page_id);
        Ok(())
    }

    /// Writes the page tree, catalog, cross-reference table and trailer.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if writing or syncing fails.
    pub async fn finish(mut self) -> std::io::Result<PathBuf> {
        let kids = self
            .page_ids
            .iter()
            .map(|id| format!("{id} 0 R"))
            .collect::<Vec<_>>()
            .join(" ");
        let pages = format!(
            "<< /Type /Pages /Kids [{kids}] /Count {} >>",
            self.page_ids.len()
        );
        self.write_object(PAGES_ID, pages.as_bytes()).await?;

        let catalog = format!("<< /Type /Catalog /Pages {PAGES_ID} 0 R >>");
        self.write_object(CATALOG_ID, catalog.as_bytes()).await?;

        let encrypt_id = match self.security.as_ref().map(Security::dictionary) {
            Some(dict) => {
                let id = self.reserve();
                self.write_object(id, dict.as_bytes()).await?;
                Some(id)
            }
            None => None,
        };

        let xref_offset = self.offset;
        let size = self.offsets.len();
        let mut xref = format!("xref\n0 {size}\n0000000000 65535 f \n");
        for offset in self.offsets.iter().skip(1) {
            xref.push_str(&format!("{offset:010} 00000 n \n"));
        }
        self.write(xref.as_bytes()).await?;

        let id_hex = crate::cache::hex(&self.file_id);
        let encrypt = encrypt_id
            .map(|id| format!(" /Encrypt {id} 0 R"))
            .unwrap_or_default();
        let trailer = format!(
            "trailer\n<< /Size {size} /Root {CATALOG_ID} 0 R{encrypt} /ID [<{id_hex}> <{id_hex}>] >>\nstartxref\n{xref_offset}\n%%EOF\n"
        );
        self.write(trailer.as_bytes()).await?;

        self.out.flush().await?;
        self.out.get_ref().sync_all().await?;
        Ok(self.path)
    }

    fn reserve(&mut self) -> u32 {
        self.offsets.push(0);
        u32::try_from(self.offsets.len() - 1).unwrap_or(u32::MAX)
    }

    async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.out.write_all(bytes).await?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    async fn write_object(&mut self, id: u32, body: &[u8]) -> std::io::Result<()> {
        self.offsets[id as usize] = self.offset;
        self.write(format!("{id} 0 obj\n").as_bytes()).await?;
        self.write(body).await?;
        self.write(b"\nendobj\n").await
    }

    async fn write_stream(&mut self, id: u32, dict: &str, data: &[u8]) -> std::io::Result<()> {
        let encrypted;
        let data = match &self.security {
            Some(security) => {
                encrypted = security.apply(id, data);
                encrypted.as_slice()
            }
            None => data,
        };

        self.offsets[id as usize] = self.offset;
        let sep = if dict.is_empty() { "" } else { " " };
        let header = format!("{id} 0 obj\n<< {dict}{sep}/Length {} >>\nstream\n", data.len());
        self.write(header.as_bytes()).await?;
        self.write(data).await?;
        self.write(b"\nendstream\nendobj\n").await
    }
}

/// Where an image lands on the page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    /// Left edge.
    pub x: f64,
    /// Bottom edge.
    pub y: f64,
    /// Drawn width.
    pub width: f64,
    /// Drawn height.
    pub height: f64,
}

/// Scales `width x height` to fit A4 (up or down) and centres it.
#[must_use]
pub fn fit_centered(width: u32, height: u32) -> Placement {
    let (w, h) = (f64::from(width.max(1)), f64::from(height.max(1)));
    let scale = (PAGE_WIDTH / w).min(PAGE_HEIGHT / h);
    let (dw, dh) = (w * scale, h * scale);
    Placement {
        x: (PAGE_WIDTH - dw) / 2.0,
        y: (PAGE_HEIGHT - dh) / 2.0,
        width: dw,
        height: dh,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_pixel(width, height, Rgb([200u8, 100, 50]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 80)
            .encode_image(&img)
            .unwrap();
        out
    }

    #[test]
    fn test_fit_portrait_fills_height() {
        let p = fit_centered(595, 1684);
        assert!((p.height - PAGE_HEIGHT).abs() < 1e-9);
        assert!((p.width - 297.5).abs() < 1e-9);
        assert!((p.x - 148.75).abs() < 1e-9);
        assert!(p.y.abs() < 1e-9);
    }

    #[test]
    fn test_fit_small_image_is_enlarged() {
        let p = fit_centered(100, 100);
        assert!((p.width - PAGE_WIDTH).abs() < 1e-9);
        assert!((p.y - (PAGE_HEIGHT - PAGE_WIDTH) / 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_writes_valid_structure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.pdf");
        let data = jpeg(40, 60);
        let info = read_info(&data).unwrap();

        let mut writer = PdfWriter::create(&path, "42", None).await.unwrap();
        writer.add_jpeg_page(&data, info).await.unwrap();
        writer.add_jpeg_page(&data, info).await.unwrap();
        assert_eq!(writer.page_count(), 2);
        let path = writer.finish().await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("%PDF-1.4"));
        assert!(text.contains("/Count 2"));
        assert!(text.contains("/Filter /DCTDecode"));
        assert!(text.trim_end().ends_with("%%EOF"));
        assert!(!text.contains("/Encrypt"));

        // startxref must point at the xref keyword.
        let startxref = text.rfind("startxref\n").unwrap();
        let offset: usize = text[startxref + 10..]
            .lines()
            .next()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(&bytes[offset..offset + 4], b"xref");
    }

    #[tokio::test]
    async fn test_xref_offsets_point_at_objects() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.pdf");
        let data = jpeg(10, 10);
        let info = read_info(&data).unwrap();

        let mut writer = PdfWriter::create(&path, "7", None).await.unwrap();
        writer.add_jpeg_page(&data, info).await.unwrap();
        let offsets = writer.offsets.clone();
        writer.finish().await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        for (id, offset) in offsets.iter().enumerate().skip(FIRST_FREE_ID as usize) {
            let expected = format!("{id} 0 obj");
            let offset = usize::try_from(*offset).unwrap();
            assert_eq!(&bytes[offset..offset + expected.len()], expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_encrypted_document_hides_stream_and_declares_handler() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret.pdf");
        let data = jpeg(10, 10);
        let info = read_info(&data).unwrap();

        let mut writer = PdfWriter::create(&path, "42", Some("pw")).await.unwrap();
        assert!(writer.is_encrypted());
        writer.add_jpeg_page(&data, info).await.unwrap();
        writer.finish().await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("/Filter /Standard /V 2 /R 3"));
        assert!(text.contains("/Encrypt 6 0 R"));
        assert!(!text.contains("/Im0 Do"));
    }

    #[tokio::test]
    async fn test_same_seed_same_bytes() {
        let dir = TempDir::new().unwrap();
        let data = jpeg(12, 12);
        let info = read_info(&data).unwrap();

        let mut outputs = Vec::new();
        for name in ["a.pdf", "b.pdf"] {
            let mut writer = PdfWriter::create(&dir.path().join(name), "42", Some("pw"))
                .await
                .unwrap();
            writer.add_jpeg_page(&data, info).await.unwrap();
            let path = writer.finish().await.unwrap();
            outputs.push(std::fs::read(path).unwrap());
        }
        assert_eq!(outputs[0], outputs[1]);
    }
}
