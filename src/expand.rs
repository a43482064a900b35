//! Decomposing downloaded files into OCR-dispatchable units.

use std::sync::Arc;

use crate::{
    drive::{DownloadedFile, MediaType},
    prelude::*,
    rasterize::Rasterizer,
};

/// One OCR-dispatchable item: a whole image file, or one page of a PDF.
#[derive(Clone, Debug)]
pub struct Unit {
    /// Index of the originating file within the batch input.
    pub file_index: usize,

    /// Name of the originating file.
    pub file_name: String,

    /// Page number within the parent PDF, if any.
    pub page_index: Option<usize>,

    /// The image to OCR.
    pub image_path: PathBuf,
}

impl Unit {
    /// Display name used for progress and logging.
    pub fn label(&self) -> String {
        match self.page_index {
            Some(page) => format!("{} (page {})", self.file_name, page + 1),
            None => self.file_name.clone(),
        }
    }
}

/// What a file expands to.
#[derive(Debug)]
pub enum Expansion {
    /// The file's OCR work, one unit per image or page.
    Units(Vec<Unit>),

    /// The file can't be processed at all; this is its error message.
    Failed(String),
}

/// Expands downloaded files into units, rasterizing PDFs as needed.
pub struct FileExpander {
    rasterizer: Arc<dyn Rasterizer>,
}

impl FileExpander {
    pub fn new(rasterizer: Arc<dyn Rasterizer>) -> Self {
        Self { rasterizer }
    }

    /// Expand one file. Rasterization failures and unsupported media are
    /// file-level terminal errors which never reach the OCR machinery.
    #[instrument(level = "debug", skip_all, fields(file = %file.file_name))]
    pub async fn expand(&self, file_index: usize, file: &DownloadedFile) -> Expansion {
        match file.media_type {
            MediaType::Image => Expansion::Units(vec![Unit {
                file_index,
                file_name: file.file_name.clone(),
                page_index: None,
                image_path: file.path.clone(),
            }]),
            MediaType::Pdf => match self.rasterizer.pdf_to_images(&file.path).await {
                Ok(pages) => Expansion::Units(
                    pages
                        .into_iter()
                        .enumerate()
                        .map(|(page_index, image_path)| Unit {
                            file_index,
                            file_name: file.file_name.clone(),
                            page_index: Some(page_index),
                            image_path,
                        })
                        .collect(),
                ),
                Err(err) => {
                    warn!(error = %err, "failed to rasterize PDF");
                    Expansion::Failed(format!("failed to rasterize PDF: {err:#}"))
                }
            },
            MediaType::Unsupported => Expansion::Failed("unsupported file format".to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    struct FixedRasterizer {
        pages: Result<Vec<PathBuf>, String>,
    }

    #[async_trait]
    impl Rasterizer for FixedRasterizer {
        async fn pdf_to_images(&self, _path: &Path) -> Result<Vec<PathBuf>> {
            match &self.pages {
                Ok(pages) => Ok(pages.clone()),
                Err(msg) => Err(anyhow!("{msg}")),
            }
        }
    }

    fn file(name: &str) -> DownloadedFile {
        DownloadedFile::new(name.to_owned(), PathBuf::from(format!("downloads/{name}")))
    }

    fn expander(pages: Result<Vec<PathBuf>, String>) -> FileExpander {
        FileExpander::new(Arc::new(FixedRasterizer { pages }))
    }

    #[tokio::test]
    async fn image_expands_to_a_single_unit() {
        let expander = expander(Ok(vec![]));
        let Expansion::Units(units) = expander.expand(4, &file("photo.png")).await else {
            panic!("expected units");
        };
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].file_index, 4);
        assert_eq!(units[0].page_index, None);
        assert_eq!(units[0].image_path, PathBuf::from("downloads/photo.png"));
    }

    #[tokio::test]
    async fn pdf_expands_to_one_unit_per_page() {
        let pages = vec![PathBuf::from("/tmp/p-1.png"), PathBuf::from("/tmp/p-2.png")];
        let expander = expander(Ok(pages));
        let Expansion::Units(units) = expander.expand(0, &file("scan.pdf")).await else {
            panic!("expected units");
        };
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].page_index, Some(0));
        assert_eq!(units[1].page_index, Some(1));
        assert_eq!(units[1].label(), "scan.pdf (page 2)");
    }

    #[tokio::test]
    async fn corrupt_pdf_fails_at_the_file_level() {
        let expander = expander(Err("broken xref table".to_owned()));
        let Expansion::Failed(error) = expander.expand(0, &file("scan.pdf")).await else {
            panic!("expected failure");
        };
        assert!(error.contains("failed to rasterize PDF"));
    }

    #[tokio::test]
    async fn unsupported_files_never_reach_the_rasterizer() {
        let expander = expander(Err("should not be called".to_owned()));
        let Expansion::Failed(error) = expander.expand(0, &file("notes.txt")).await else {
            panic!("expected failure");
        };
        assert_eq!(error, "unsupported file format");
    }
}
