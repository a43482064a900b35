//! Result records, persistence, and console display.
//!
//! The persisted artifact is an ordered JSON array mirroring the input file
//! order. Optional fields are omitted from the JSON entirely rather than
//! serialized as `null`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
    drive::{DownloadedFile, MediaType},
    ocr::PassportFields,
    prelude::*,
    processor::UnitOutcome,
    progress::ProgressSnapshot,
    ui::Ui,
};

/// What kind of source document produced a result.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Image,
    Pdf,
}

/// The outcome of one page of a PDF.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PageResult {
    /// Name of the rasterized page image.
    pub filename: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_data: Option<PassportFields>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The persisted, per-input-file record combining all of that file's unit
/// outcomes.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FileResult {
    pub filename: String,
    pub file_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<SourceType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages_processed: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_data: Option<PassportFields>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_results: Option<Vec<PageResult>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileResult {
    fn empty(file: &DownloadedFile) -> Self {
        let source_type = match file.media_type {
            MediaType::Image => Some(SourceType::Image),
            MediaType::Pdf => Some(SourceType::Pdf),
            MediaType::Unsupported => None,
        };
        Self {
            filename: file.file_name.clone(),
            file_path: file.path.to_string_lossy().into_owned(),
            source_type,
            total_pages: None,
            pages_processed: None,
            ocr_data: None,
            page_results: None,
            error: None,
        }
    }

    /// A record for a file that failed before any OCR work (unsupported
    /// format, corrupt PDF).
    pub fn failed(file: &DownloadedFile, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::empty(file)
        }
    }

    /// Fold a single image's unit outcome into its record.
    pub fn from_image_outcome(file: &DownloadedFile, outcome: UnitOutcome) -> Self {
        let mut result = Self::empty(file);
        match outcome.result {
            Ok(fields) => result.ocr_data = Some(fields),
            Err(err) => result.error = Some(err.to_string()),
        }
        result
    }

    /// Fold a PDF's page outcomes (already in page order) into its record.
    ///
    /// The top-level `ocr_data` comes from the first page that succeeded, in
    /// page order; if every page failed, a summary error is recorded instead.
    /// Every page is accounted for in `page_results` either way.
    pub fn from_pdf_outcomes(
        file: &DownloadedFile,
        total_pages: usize,
        outcomes: Vec<UnitOutcome>,
    ) -> Self {
        let mut result = Self::empty(file);
        result.total_pages = Some(total_pages);
        result.pages_processed = Some(outcomes.len());

        let mut page_results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let filename = outcome
                .unit
                .image_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| outcome.unit.label());
            match outcome.result {
                Ok(fields) => {
                    if result.ocr_data.is_none() {
                        result.ocr_data = Some(fields.clone());
                    }
                    page_results.push(PageResult {
                        filename,
                        ocr_data: Some(fields),
                        error: None,
                    });
                }
                Err(err) => page_results.push(PageResult {
                    filename,
                    ocr_data: None,
                    error: Some(err.to_string()),
                }),
            }
        }

        if result.ocr_data.is_none() {
            result.error = Some(format!("all {total_pages} pages failed OCR"));
        }
        result.page_results = Some(page_results);
        result
    }

    /// Did this file produce usable data?
    pub fn is_success(&self) -> bool {
        self.ocr_data.is_some()
    }
}

/// Write the full result set as a pretty-printed JSON array.
///
/// This is always written, even if every unit failed, so a caller can
/// distinguish "ran with failures" from "did not run".
pub async fn save_results(path: &Path, results: &[FileResult]) -> Result<()> {
    let json = serde_json::to_string_pretty(results).context("failed to serialize results")?;
    fs::write(path, json)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Load results saved by a previous run, keyed by file path.
///
/// An absent or unreadable output file simply means there's nothing to reuse.
pub async fn load_previous_results(path: &Path) -> HashMap<String, FileResult> {
    let Ok(data) = fs::read_to_string(path).await else {
        return HashMap::new();
    };
    match serde_json::from_str::<Vec<FileResult>>(&data) {
        Ok(results) => results
            .into_iter()
            .map(|result| (result.file_path.clone(), result))
            .collect(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unparseable previous results");
            HashMap::new()
        }
    }
}

/// Render one successful extraction as a fielded console block.
pub fn display_extraction(ui: &Ui, result: &FileResult) {
    let Some(fields) = &result.ocr_data else {
        return;
    };
    let sep = "=".repeat(50);
    ui.display_block(&format!(
        "\n{sep}\nFILE: {}\n{sep}\n\
         Last Name: {}\nFirst Name: {}\nPassport Number: {}\nNationality: {}\n{sep}\n",
        result.filename,
        fields.last_name,
        fields.first_name,
        fields.passport_number,
        fields.nationality,
    ));
}

/// Report where the results went and how the batch did overall.
pub fn display_summary(
    ui: &Ui,
    output_file: &Path,
    snapshot: &ProgressSnapshot,
    results: &[FileResult],
) {
    let succeeded = results.iter().filter(|result| result.is_success()).count();
    let failed = results.len() - succeeded;
    ui.display_message(
        "💾",
        &format!("All OCR results saved to {}", output_file.display()),
    );
    ui.display_message(
        "📊",
        &format!(
            "{} of {} files extracted, {} failed, {} retries",
            succeeded,
            results.len(),
            failed,
            snapshot.retried_count
        ),
    );
}
