//! The batch orchestration core.
//!
//! Expands each downloaded file into units, dispatches every unit under one
//! global concurrency cap, and folds the outcomes back into per-file records
//! in the original input order. A unit's terminal failure only ever affects
//! its own file's record; the run itself always completes and returns one
//! record per input file.

use std::sync::Arc;

use futures::{StreamExt as _, stream};

use crate::{
    drive::{DownloadedFile, MediaType},
    expand::{Expansion, FileExpander},
    output::FileResult,
    prelude::*,
    processor::{UnitOutcome, UnitProcessor},
    progress::ProgressTracker,
};

/// Per-file bookkeeping between expansion and folding.
enum FileSlot {
    /// The file failed before any OCR work; its record is already final.
    Done(FileResult),

    /// The file contributed `total_units` units to the work list.
    Pending { total_units: usize },
}

/// Drives one batch run.
pub struct BatchScheduler {
    expander: FileExpander,
    processor: Arc<UnitProcessor>,
    tracker: ProgressTracker,
    max_concurrent_files: usize,
}

impl BatchScheduler {
    pub fn new(
        expander: FileExpander,
        processor: Arc<UnitProcessor>,
        tracker: ProgressTracker,
        max_concurrent_files: usize,
    ) -> Self {
        Self {
            expander,
            processor,
            tracker,
            max_concurrent_files,
        }
    }

    /// Process `files`, returning one result per input file, in input order.
    #[instrument(level = "debug", skip_all, fields(files = files.len()))]
    pub async fn run(&self, files: &[DownloadedFile]) -> Vec<FileResult> {
        // Expand every file up front so the unit total (and hence progress
        // percentages and the ETA) are known before dispatch begins.
        let mut slots = Vec::with_capacity(files.len());
        let mut work = Vec::new();
        for (file_index, file) in files.iter().enumerate() {
            match self.expander.expand(file_index, file).await {
                Expansion::Units(units) => {
                    slots.push(FileSlot::Pending {
                        total_units: units.len(),
                    });
                    work.extend(units);
                }
                Expansion::Failed(error) => {
                    slots.push(FileSlot::Done(FileResult::failed(file, error)));
                }
            }
        }
        self.tracker.set_total_units(work.len());

        // Dispatch all units under the global concurrency cap. The cap is
        // enforced structurally by `buffer_unordered`, so completion order is
        // unconstrained and a slow unit (or one sleeping out a retry) never
        // blocks the others.
        let outcomes = stream::iter(work)
            .map(|unit| {
                let processor = self.processor.clone();
                let tracker = self.tracker.clone();
                async move {
                    let outcome = processor.process(unit).await;
                    tracker.record_outcome(outcome.is_success());
                    outcome
                }
            })
            .buffer_unordered(self.max_concurrent_files.max(1))
            .collect::<Vec<_>>()
            .await;
        self.tracker.finish();

        // Regroup the out-of-order outcomes under their originating files.
        let mut per_file: Vec<Vec<UnitOutcome>> = files.iter().map(|_| Vec::new()).collect();
        for outcome in outcomes {
            per_file[outcome.unit.file_index].push(outcome);
        }

        // Fold each file's outcomes into its final record, in input order.
        files
            .iter()
            .zip(slots)
            .zip(per_file)
            .map(|((file, slot), mut outcomes)| match slot {
                FileSlot::Done(result) => result,
                FileSlot::Pending { total_units } => {
                    outcomes.sort_by_key(|outcome| outcome.unit.page_index);
                    fold_file(file, total_units, outcomes)
                }
            })
            .collect()
    }
}

/// Fold one file's unit outcomes into its final record.
fn fold_file(
    file: &DownloadedFile,
    total_units: usize,
    outcomes: Vec<UnitOutcome>,
) -> FileResult {
    match file.media_type {
        MediaType::Pdf => FileResult::from_pdf_outcomes(file, total_units, outcomes),
        _ => match outcomes.into_iter().next() {
            Some(outcome) => FileResult::from_image_outcome(file, outcome),
            None => FileResult::failed(file, "no OCR outcome was produced"),
        },
    }
}
