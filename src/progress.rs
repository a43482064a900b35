//! Batch progress accounting.
//!
//! One [`ProgressTracker`] is scoped to one batch run and passed explicitly
//! into the scheduler and its children, so parallel runs (such as tests)
//! never share counters.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use indicatif::ProgressBar;

/// A point-in-time view of batch progress.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub total_units: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retried_count: usize,

    /// Estimated seconds remaining. `None` until the first unit completes.
    pub eta_seconds: Option<f64>,

    /// Display name of the most recently started unit. Informational only;
    /// concurrent starts race and the last writer wins.
    pub current_label: String,
}

#[derive(Default)]
struct ProgressState {
    total_units: usize,
    completed: usize,
    succeeded: usize,
    failed: usize,
    retried_count: usize,
    current_label: String,
}

/// Accumulates per-unit outcomes across concurrent tasks.
///
/// Cheap to clone; all clones share one set of counters. We hold the sync
/// lock just for an instant per update, so it's safe to call from any number
/// of in-flight units.
#[derive(Clone)]
pub struct ProgressTracker {
    started_at: Instant,
    state: Arc<Mutex<ProgressState>>,
    bar: Option<ProgressBar>,
}

impl ProgressTracker {
    /// Create a tracker with no attached progress bar (used in tests).
    pub fn new(total_units: usize) -> Self {
        Self {
            started_at: Instant::now(),
            state: Arc::new(Mutex::new(ProgressState {
                total_units,
                ..ProgressState::default()
            })),
            bar: None,
        }
    }

    /// Create a tracker that mirrors its counts onto an indicatif bar.
    pub fn with_bar(total_units: usize, bar: ProgressBar) -> Self {
        Self {
            bar: Some(bar),
            ..Self::new(total_units)
        }
    }

    /// Set the unit total once file expansion has determined it.
    pub fn set_total_units(&self, total_units: usize) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.total_units = total_units;
        if let Some(bar) = &self.bar {
            bar.set_length(total_units as u64);
        }
    }

    /// Note that a unit has started processing.
    pub fn record_start(&self, label: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.current_label = label.to_owned();
        if let Some(bar) = &self.bar {
            bar.set_message(label.to_owned());
        }
    }

    /// Note that a unit is being retried.
    pub fn record_retry(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.retried_count += 1;
    }

    /// Note that a unit has finished, one way or the other.
    pub fn record_outcome(&self, success: bool) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.completed += 1;
        if success {
            state.succeeded += 1;
        } else {
            state.failed += 1;
        }
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    /// Take a snapshot of the current counts.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock().expect("lock poisoned");
        let eta_seconds = if state.completed > 0 {
            let elapsed = self.started_at.elapsed().as_secs_f64();
            let remaining = state.total_units.saturating_sub(state.completed);
            Some(remaining as f64 * elapsed / state.completed as f64)
        } else {
            None
        };
        ProgressSnapshot {
            total_units: state.total_units,
            completed: state.completed,
            succeeded: state.succeeded,
            failed: state.failed,
            retried_count: state.retried_count,
            eta_seconds,
            current_label: state.current_label.clone(),
        }
    }

    /// Finish the attached progress bar, if any.
    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_using_style();
        }
    }
}
