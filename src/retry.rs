//! Error classification and retry backoff.
//!
//! By default, we assume errors are not transient, until they've been observed
//! in the wild, investigated and determined to be transient. This prevents us
//! from doing large numbers of retries with exponential backoff on errors that
//! will never resolve.

use std::{error, fmt, time::Duration};

use rand::Rng as _;
use reqwest::StatusCode;

/// What kind of failure was this? Only some kinds are worth retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A network-level failure (connection error, timeout, 5xx gateway
    /// errors). Usually resolves on its own.
    TransientNetwork,

    /// The OCR endpoint told us to slow down (HTTP 429).
    RateLimit,

    /// The model produced output we couldn't use (not JSON, empty response).
    /// Another attempt often produces a usable one.
    TransientModel,

    /// The input itself is bad: unreadable image, missing file, a response
    /// that parsed but lacks required fields. Retrying cannot help.
    InvalidInput,

    /// A file format we don't handle.
    UnsupportedFormat,
}

impl ErrorKind {
    /// Is a failure of this kind worth another attempt?
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNetwork | ErrorKind::RateLimit | ErrorKind::TransientModel
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::TransientNetwork => write!(f, "transient network error"),
            ErrorKind::RateLimit => write!(f, "rate limited"),
            ErrorKind::TransientModel => write!(f, "transient model error"),
            ErrorKind::InvalidInput => write!(f, "invalid input"),
            ErrorKind::UnsupportedFormat => write!(f, "unsupported format"),
        }
    }
}

/// A classified failure from processing a single unit.
///
/// The message is what ends up in the persisted result record, so it should
/// be human-readable and free of internal debug formatting.
#[derive(Clone, Debug)]
pub struct UnitError {
    pub kind: ErrorKind,
    pub message: String,
}

impl UnitError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl error::Error for UnitError {}

/// Is this error a known transient error?
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status == StatusCode::TOO_MANY_REQUESTS || status.is_known_transient()
        } else {
            // Assume all other kinds of HTTP errors are transient. Unfortunately,
            // there are a lot of things that can go wrong, and `reqwest` doesn't
            // expose most of them in sufficient detail to be certain which are
            // transient.
            true
        }
    }
}

/// Classify an HTTP status code from the OCR endpoint.
pub fn kind_for_status(status: StatusCode) -> ErrorKind {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ErrorKind::RateLimit
    } else if status.is_known_transient() {
        ErrorKind::TransientNetwork
    } else {
        ErrorKind::InvalidInput
    }
}

/// Backoff policy for retryable unit failures.
///
/// This is pure computation; the caller is responsible for sleeping. Delays
/// grow exponentially up to `max_delay`, with uniform jitter added on top to
/// desynchronize concurrently-failing units.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,

    /// Delay before the first retry, in seconds.
    pub base_delay: f64,

    /// Multiplier applied per attempt.
    pub backoff_factor: f64,

    /// Upper bound on the un-jittered delay, in seconds.
    pub max_delay: f64,

    /// Jitter as a fraction of the computed delay.
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: 1.0,
            backoff_factor: 2.0,
            max_delay: 60.0,
            jitter_fraction: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Should we retry after a failure of `kind` on attempt `attempt_number`
    /// (0-based)?
    pub fn should_retry(&self, attempt_number: u32, kind: ErrorKind) -> bool {
        attempt_number < self.max_retries && kind.is_retryable()
    }

    /// How long to sleep before retrying attempt `attempt_number`.
    pub fn delay_for(&self, attempt_number: u32) -> Duration {
        let base = self.delay_without_jitter(attempt_number);
        let jitter = if base > 0.0 && self.jitter_fraction > 0.0 {
            rand::thread_rng().gen_range(0.0..=base * self.jitter_fraction)
        } else {
            0.0
        };
        Duration::from_secs_f64(base + jitter)
    }

    fn delay_without_jitter(&self, attempt_number: u32) -> f64 {
        (self.base_delay * self.backoff_factor.powi(attempt_number as i32)).min(self.max_delay)
    }
}
