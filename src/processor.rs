//! Processing a single unit through the OCR capability.

use std::sync::Arc;

use tokio::time;

use crate::{
    expand::Unit,
    ocr::{OcrClient, PassportFields},
    prelude::*,
    progress::ProgressTracker,
    retry::{RetryPolicy, UnitError},
};

/// The final outcome of one unit.
///
/// Exactly one of these is produced per dispatched unit; failures are
/// captured here and never propagated.
#[derive(Clone, Debug)]
pub struct UnitOutcome {
    pub unit: Unit,
    pub result: Result<PassportFields, UnitError>,
    pub attempts_made: u32,
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs units through the OCR capability, applying the retry policy around
/// the OCR call only.
pub struct UnitProcessor {
    ocr: Arc<dyn OcrClient>,
    policy: RetryPolicy,
    tracker: ProgressTracker,
}

impl UnitProcessor {
    pub fn new(ocr: Arc<dyn OcrClient>, policy: RetryPolicy, tracker: ProgressTracker) -> Self {
        Self {
            ocr,
            policy,
            tracker,
        }
    }

    /// Process one unit. Never fails outward; all errors end up in the
    /// outcome.
    #[instrument(level = "debug", skip_all, fields(unit = %unit.label()))]
    pub async fn process(&self, unit: Unit) -> UnitOutcome {
        self.tracker.record_start(&unit.label());
        let mut attempt = 0;
        loop {
            match self.ocr.extract(&unit.image_path).await {
                Ok(fields) => {
                    debug!(attempts = attempt + 1, "extraction succeeded");
                    return UnitOutcome {
                        unit,
                        result: Ok(fields),
                        attempts_made: attempt + 1,
                    };
                }
                Err(err) if self.policy.should_retry(attempt, err.kind) => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        error = %err,
                        delay_secs = delay.as_secs_f64(),
                        "retrying {}",
                        unit.label()
                    );
                    self.tracker.record_retry();
                    // Sleeping here parks only this unit's task; other units
                    // keep running in their own slots.
                    time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(error = %err, "giving up on {}", unit.label());
                    return UnitOutcome {
                        unit,
                        result: Err(err),
                        attempts_made: attempt + 1,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::Mutex,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::retry::ErrorKind;

    /// An OCR stub that plays back a fixed sequence of results.
    struct ScriptedOcr {
        script: Mutex<VecDeque<Result<PassportFields, UnitError>>>,
    }

    impl ScriptedOcr {
        fn new(script: Vec<Result<PassportFields, UnitError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl OcrClient for ScriptedOcr {
        async fn extract(&self, _image_path: &Path) -> Result<PassportFields, UnitError> {
            self.script
                .lock()
                .expect("lock poisoned")
                .pop_front()
                .expect("OCR called more times than scripted")
        }
    }

    fn fields() -> PassportFields {
        PassportFields {
            last_name: "DOE".to_owned(),
            first_name: "JANE".to_owned(),
            passport_number: "AB123456".to_owned(),
            nationality: "UTOPIAN".to_owned(),
        }
    }

    fn unit() -> Unit {
        Unit {
            file_index: 0,
            file_name: "passport.png".to_owned(),
            page_index: None,
            image_path: PathBuf::from("downloads/passport.png"),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: 0.001,
            max_delay: 0.002,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn first_attempt_success_makes_one_call() {
        let ocr = ScriptedOcr::new(vec![Ok(fields())]);
        let tracker = ProgressTracker::new(1);
        let processor = UnitProcessor::new(ocr, fast_policy(), tracker.clone());
        let outcome = processor.process(unit()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts_made, 1);
        assert_eq!(tracker.snapshot().retried_count, 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let transient = |msg: &str| Err(UnitError::new(ErrorKind::TransientNetwork, msg));
        let ocr = ScriptedOcr::new(vec![
            transient("connection reset"),
            transient("connection reset"),
            Ok(fields()),
        ]);
        let tracker = ProgressTracker::new(1);
        let processor = UnitProcessor::new(ocr, fast_policy(), tracker.clone());
        let outcome = processor.process(unit()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts_made, 3);
        assert_eq!(tracker.snapshot().retried_count, 2);
    }

    #[tokio::test]
    async fn retries_are_exhausted_after_max_attempts() {
        let script = (0..4)
            .map(|_| Err(UnitError::new(ErrorKind::RateLimit, "slow down")))
            .collect();
        let tracker = ProgressTracker::new(1);
        let processor = UnitProcessor::new(ScriptedOcr::new(script), fast_policy(), tracker.clone());
        let outcome = processor.process(unit()).await;
        assert!(!outcome.is_success());
        // Initial attempt plus max_retries.
        assert_eq!(outcome.attempts_made, 4);
        assert_eq!(tracker.snapshot().retried_count, 3);
    }

    #[tokio::test]
    async fn terminal_failures_are_not_retried() {
        let ocr = ScriptedOcr::new(vec![Err(UnitError::new(
            ErrorKind::InvalidInput,
            "OCR response is missing required fields: nationality",
        ))]);
        let tracker = ProgressTracker::new(1);
        let processor = UnitProcessor::new(ocr, fast_policy(), tracker.clone());
        let outcome = processor.process(unit()).await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts_made, 1);
        assert_eq!(tracker.snapshot().retried_count, 0);
        let err = outcome.result.unwrap_err();
        assert!(err.message.contains("nationality"));
    }
}
