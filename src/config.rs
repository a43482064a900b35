//! Configuration for a batch run.
//!
//! These are plain values passed explicitly into the scheduler and its
//! children. There are no process-wide config singletons, so multiple batch
//! runs in one process (tests, mostly) can't contaminate each other.

use clap::Args;

use crate::retry::RetryPolicy;

/// Options controlling batch scheduling and retries.
#[derive(Args, Clone, Debug)]
pub struct BatchOpts {
    /// Max number of units (images or PDF pages) to OCR at a time.
    #[clap(short = 'j', long = "jobs", default_value = "3")]
    pub max_concurrent_files: usize,

    /// Maximum number of retries per unit after the initial attempt.
    #[clap(long, default_value = "3")]
    pub max_retries: u32,

    /// Delay before the first retry, in seconds.
    #[clap(long, default_value = "1.0")]
    pub retry_base_delay: f64,

    /// Multiplier applied to the retry delay per attempt.
    #[clap(long, default_value = "2.0")]
    pub retry_backoff_factor: f64,

    /// Upper bound on the retry delay, in seconds.
    #[clap(long, default_value = "60.0")]
    pub max_retry_delay: f64,
}

impl BatchOpts {
    /// Build the retry policy described by these options.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
            backoff_factor: self.retry_backoff_factor,
            max_delay: self.max_retry_delay,
            ..RetryPolicy::default()
        }
    }
}

/// Options for the OCR model endpoint.
#[derive(Args, Clone, Debug)]
pub struct OcrOpts {
    /// The multimodal model to use for extraction.
    #[clap(long, default_value = "gemini-2.0-flash")]
    pub model: String,

    /// Google API key, used for both the Drive API and the OCR endpoint.
    #[clap(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Override the OpenAI-compatible API base URL.
    #[clap(long, env = "OPENAI_API_BASE")]
    pub api_base: Option<String>,
}
