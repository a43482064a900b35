//! PDF rasterization using Poppler's `pdftocairo` CLI tool.

use async_trait::async_trait;
use tokio::{fs, process::Command};

use crate::prelude::*;

/// Capability interface for turning a PDF into page images.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Render each page of `path` to an image, returning the image paths in
    /// page order. Fails as a whole for a corrupt or unreadable PDF.
    async fn pdf_to_images(&self, path: &Path) -> Result<Vec<PathBuf>>;
}

/// A [`Rasterizer`] that shells out to `pdftocairo`.
///
/// Page images live in a temporary directory owned by this value, so they
/// remain readable until the rasterizer is dropped at the end of the run.
pub struct PdftocairoRasterizer {
    dpi: u32,
    workdir: tempfile::TempDir,
}

impl PdftocairoRasterizer {
    pub fn new(dpi: u32) -> Result<Self> {
        let workdir = tempfile::TempDir::with_prefix("passport-ocr-pages")
            .context("failed to create temporary page directory")?;
        Ok(Self { dpi, workdir })
    }
}

#[async_trait]
impl Rasterizer for PdftocairoRasterizer {
    #[instrument(level = "debug", skip(self), fields(path = %path.display()))]
    async fn pdf_to_images(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let stem = path
            .file_stem()
            .with_context(|| format!("failed to get file name from {}", path.display()))?;
        let page_dir = self.workdir.path().join(stem);
        fs::create_dir_all(&page_dir)
            .await
            .context("failed to create page directory")?;

        // pdftocairo appends `-<page>` and `.png` to the output prefix.
        let out_prefix = page_dir.join(stem);
        let output = Command::new("pdftocairo")
            .arg("-png")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg(path)
            .arg(&out_prefix)
            .output()
            .await
            .with_context(|| format!("failed to run pdftocairo on {}", path.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "pdftocairo failed on {}: {}",
                path.display(),
                stderr.trim()
            ));
        }

        // Page numbers are zero-padded to a fixed width, so lexical order is
        // page order.
        let mut pages = Vec::new();
        let mut entries = fs::read_dir(&page_dir)
            .await
            .context("failed to read page directory")?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("failed to read page directory")?
        {
            pages.push(entry.path());
        }
        pages.sort();
        if pages.is_empty() {
            return Err(anyhow!(
                "pdftocairo produced no pages for {}",
                path.display()
            ));
        }
        Ok(pages)
    }
}
