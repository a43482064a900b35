//! Listing and downloading files from a Google Drive folder.
//!
//! We talk to the Drive v3 REST API directly with an API key. A download
//! failure here is fatal to the whole run: we never OCR a partial folder.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs;

use crate::{
    prelude::*,
    ui::{ProgressConfig, Ui},
};

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";

/// Media types we know how to process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaType {
    Image,
    Pdf,
    Unsupported,
}

impl MediaType {
    /// Detect a file's media type from its name.
    pub fn from_path(path: &Path) -> Self {
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        match (mime.type_().as_str(), mime.subtype().as_str()) {
            ("image", "png" | "jpeg" | "gif" | "bmp" | "webp") => MediaType::Image,
            ("application", "pdf") => MediaType::Pdf,
            _ => MediaType::Unsupported,
        }
    }
}

/// A file fetched from the source folder.
#[derive(Clone, Debug)]
pub struct DownloadedFile {
    /// The file's name within the folder.
    pub file_name: String,

    /// Where the file landed on the local disk.
    pub path: PathBuf,

    /// What kind of file this is.
    pub media_type: MediaType,
}

impl DownloadedFile {
    pub fn new(file_name: String, path: PathBuf) -> Self {
        let media_type = MediaType::from_path(&path);
        Self {
            file_name,
            path,
            media_type,
        }
    }
}

/// Capability interface for fetching a folder's files.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// List every file in `folder_id` and download it locally, returning the
    /// files in the folder's listing order.
    async fn list_and_download(&self, folder_id: &str) -> Result<Vec<DownloadedFile>>;
}

/// Response shape of the Drive `files.list` endpoint.
#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileMeta>,
}

#[derive(Debug, Deserialize)]
struct FileMeta {
    id: String,
    name: String,
}

/// A [`Downloader`] backed by the Google Drive v3 API.
pub struct DriveDownloader {
    client: reqwest::Client,
    api_key: String,
    download_dir: PathBuf,
    ui: Ui,
}

impl DriveDownloader {
    pub fn new(api_key: String, download_dir: PathBuf, ui: Ui) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            download_dir,
            ui,
        }
    }

    async fn list_files(&self, folder_id: &str) -> Result<Vec<FileMeta>> {
        let response = self
            .client
            .get(format!("{DRIVE_API_BASE}/files"))
            .query(&[
                ("q", format!("'{folder_id}' in parents")),
                ("fields", "files(id, name)".to_owned()),
                ("pageSize", "1000".to_owned()),
                ("key", self.api_key.clone()),
            ])
            .send()
            .await
            .with_context(|| format!("failed to list folder {folder_id}"))?
            .error_for_status()
            .with_context(|| format!("failed to list folder {folder_id}"))?;
        let list = response
            .json::<FileList>()
            .await
            .context("failed to parse folder listing")?;
        if list.files.is_empty() {
            return Err(anyhow!("no files found in folder {folder_id}"));
        }
        Ok(list.files)
    }

    async fn download_file(&self, meta: &FileMeta, dest: &Path) -> Result<()> {
        let bytes = self
            .client
            .get(format!("{DRIVE_API_BASE}/files/{}", meta.id))
            .query(&[("alt", "media"), ("key", self.api_key.as_str())])
            .send()
            .await
            .with_context(|| format!("failed to download {}", meta.name))?
            .error_for_status()
            .with_context(|| format!("failed to download {}", meta.name))?
            .bytes()
            .await
            .with_context(|| format!("failed to download {}", meta.name))?;
        fs::write(dest, &bytes)
            .await
            .with_context(|| format!("failed to write {}", dest.display()))?;
        Ok(())
    }
}

#[async_trait]
impl Downloader for DriveDownloader {
    #[instrument(level = "debug", skip(self))]
    async fn list_and_download(&self, folder_id: &str) -> Result<Vec<DownloadedFile>> {
        fs::create_dir_all(&self.download_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create download directory {}",
                    self.download_dir.display()
                )
            })?;

        let files = self.list_files(folder_id).await?;
        let pb = self.ui.new_progress_bar(
            &ProgressConfig {
                emoji: "⬇️",
                msg: "Downloading files",
                done_msg: "Downloaded files",
            },
            files.len() as u64,
        );

        let mut downloaded = Vec::with_capacity(files.len());
        for meta in files {
            let dest = self.download_dir.join(&meta.name);
            if fs::try_exists(&dest).await? {
                debug!(name = %meta.name, "already downloaded, skipping");
            } else {
                self.download_file(&meta, &dest).await?;
            }
            downloaded.push(DownloadedFile::new(meta.name, dest));
            pb.inc(1);
        }
        pb.finish_using_style();
        Ok(downloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_detection() {
        assert_eq!(MediaType::from_path(Path::new("a.png")), MediaType::Image);
        assert_eq!(MediaType::from_path(Path::new("a.JPG")), MediaType::Image);
        assert_eq!(MediaType::from_path(Path::new("a.jpeg")), MediaType::Image);
        assert_eq!(MediaType::from_path(Path::new("scan.pdf")), MediaType::Pdf);
        assert_eq!(
            MediaType::from_path(Path::new("notes.txt")),
            MediaType::Unsupported
        );
        assert_eq!(
            MediaType::from_path(Path::new("no_extension")),
            MediaType::Unsupported
        );
    }
}
