use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

use super::{label_pages, PageText, TextSource, TextSourceError};

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR tool '{0}' is not installed or not on PATH")]
    Unavailable(String),

    #[error("{program} failed: {message}")]
    Command { program: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rasterizes pages with `pdftoppm` and reads them back with `tesseract`.
///
/// Child processes are spawned with `kill_on_drop`, and the page images
/// live in a temp dir owned by the future, so aborting the task releases
/// both.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    pdftoppm: String,
    tesseract: String,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self {
            pdftoppm: "pdftoppm".to_string(),
            tesseract: "tesseract".to_string(),
        }
    }
}

impl TesseractOcr {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>, OcrError> {
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => OcrError::Unavailable(program.to_string()),
                _ => OcrError::Io(e),
            })?;

        if !output.status.success() {
            return Err(OcrError::Command {
                program: program.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn render_pages(&self, pdf_path: &Path, out_dir: &Path, dpi: u32, max_pages: usize) -> Result<Vec<PathBuf>, OcrError> {
        let prefix = out_dir.join("page");
        let dpi = dpi.to_string();
        let last = max_pages.max(1).to_string();
        let pdf = pdf_path.to_string_lossy();
        let prefix_str = prefix.to_string_lossy();
        self.run(
            &self.pdftoppm,
            &["-r", dpi.as_str(), "-f", "1", "-l", last.as_str(), "-png", &*pdf, &*prefix_str],
        )
        .await?;

        let mut images: Vec<(usize, PathBuf)> = std::fs::read_dir(out_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|ext| ext == "png").unwrap_or(false))
            .filter_map(|p| page_number(&p).map(|n| (n, p)))
            .collect();
        images.sort_by_key(|(n, _)| *n);
        Ok(images.into_iter().map(|(_, p)| p).collect())
    }

    async fn recognize(&self, image: &Path) -> Result<String, OcrError> {
        let image = image.to_string_lossy();
        let stdout = self.run(&self.tesseract, &[&*image, "stdout"]).await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

/// `page-07.png` -> 7. pdftoppm zero-pads to the width of the page count.
fn page_number(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?;
    stem.rsplit('-').next()?.parse().ok()
}

#[async_trait]
impl TextSource for TesseractOcr {
    fn name(&self) -> &'static str {
        "ocr"
    }

    async fn extract(&self, pdf_path: &Path, dpi: u32, max_pages: usize) -> Result<PageText, TextSourceError> {
        let scratch = tempfile::tempdir().map_err(OcrError::from)?;
        let images = self.render_pages(pdf_path, scratch.path(), dpi, max_pages).await?;
        tracing::debug!(pages = images.len(), dpi, "Rendered pages for OCR");

        let mut pages = Vec::with_capacity(images.len());
        for image in &images {
            pages.push(self.recognize(image).await?);
        }
        Ok(PageText { text: label_pages(&pages), page_count: pages.len() })
    }
}
