use std::{collections::HashMap, str::FromStr, sync::Arc};

use clap::Parser;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{
    batch::BatchScheduler,
    config::{BatchOpts, OcrOpts},
    drive::{Downloader as _, DriveDownloader},
    expand::FileExpander,
    ocr::{LlmOcrClient, OcrClient},
    output::FileResult,
    prelude::*,
    processor::UnitProcessor,
    progress::ProgressTracker,
    rasterize::{PdftocairoRasterizer, Rasterizer},
    ui::{ProgressConfig, Ui},
};

mod batch;
mod config;
mod drive;
mod expand;
mod ocr;
mod output;
mod prelude;
mod processor;
mod progress;
mod rasterize;
mod retry;
mod ui;

/// Extract passport fields from every document in a Google Drive folder.
#[derive(Debug, Parser)]
#[clap(
    version,
    after_help = r#"
Environment Variables:
  - GEMINI_API_KEY: Google API key, used for both the Drive API and
    the OCR endpoint.
  - OPENAI_API_BASE (optional): Override the OCR endpoint URL.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    /// The Google Drive folder to process.
    folder_id: String,

    /// Where to write the JSON results.
    #[clap(short = 'o', long = "output", default_value = "ocr_results.json")]
    output_file: PathBuf,

    /// Directory where downloaded files are stored.
    #[clap(long, default_value = "downloads")]
    download_dir: PathBuf,

    /// The DPI to use when rasterizing PDF pages.
    #[clap(long, default_value = "300")]
    rasterize_dpi: u32,

    /// Reprocess every file, ignoring results from a previous run.
    #[clap(long)]
    force: bool,

    #[clap(flatten)]
    batch: BatchOpts,

    #[clap(flatten)]
    ocr: OcrOpts,
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive = Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Download the folder. A failure here aborts the whole run; we never OCR
    // a partial folder.
    let downloader = DriveDownloader::new(
        opts.ocr.api_key.clone(),
        opts.download_dir.clone(),
        ui.clone(),
    );
    let files = downloader.list_and_download(&opts.folder_id).await?;
    info!("downloaded {} files", files.len());

    // Results from a previous run can satisfy some files without re-OCRing
    // them. Files whose previous entry failed are tried again.
    let previous = if opts.force {
        HashMap::new()
    } else {
        output::load_previous_results(&opts.output_file).await
    };
    let mut slots: Vec<Option<FileResult>> = vec![None; files.len()];
    let mut pending = Vec::new();
    for (index, file) in files.iter().enumerate() {
        match previous.get(file.path.to_string_lossy().as_ref()) {
            Some(prev) if prev.is_success() => {
                info!(file = %file.file_name, "reusing result from a previous run");
                slots[index] = Some(prev.clone());
            }
            _ => pending.push(file.clone()),
        }
    }

    // Wire up the batch machinery. All of this is scoped to the single run.
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing files",
            done_msg: "OCRed files",
        },
        0,
    );
    let tracker = ProgressTracker::with_bar(0, pb);
    let ocr_client: Arc<dyn OcrClient> = Arc::new(LlmOcrClient::new(
        &opts.ocr.api_key,
        opts.ocr.api_base.as_deref(),
        opts.ocr.model.clone(),
    ));
    let rasterizer: Arc<dyn Rasterizer> = Arc::new(PdftocairoRasterizer::new(opts.rasterize_dpi)?);
    let processor = Arc::new(UnitProcessor::new(
        ocr_client,
        opts.batch.retry_policy(),
        tracker.clone(),
    ));
    let scheduler = BatchScheduler::new(
        FileExpander::new(rasterizer),
        processor,
        tracker.clone(),
        opts.batch.max_concurrent_files,
    );

    let processed = scheduler.run(&pending).await;

    // Merge freshly processed results back into the reused ones, preserving
    // the folder's file order.
    let mut processed = processed.into_iter();
    let results = slots
        .into_iter()
        .map(|slot| match slot {
            Some(result) => result,
            None => processed
                .next()
                .expect("scheduler returned one result per pending file"),
        })
        .collect::<Vec<_>>();

    for result in &results {
        output::display_extraction(&ui, result);
    }

    // The results file is always written, even if every unit failed.
    output::save_results(&opts.output_file, &results).await?;
    output::display_summary(&ui, &opts.output_file, &tracker.snapshot(), &results);
    Ok(())
}
