use crate::models::ModelConfiguration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Receives search progress as candidates finish.
pub trait SearchObserver: Send + Sync {
    fn on_search_started(&self, _total_iterations: usize) {}
    fn on_candidate(&self, _configuration: &ModelConfiguration, _best_score: Option<f64>) {}
    fn on_candidate_failed(&self, _iteration: usize, _reason: &str) {}
}

#[derive(Clone, Default)]
pub struct OptimizerStatus {
    inner: Arc<Mutex<OptimizerStatusData>>,
}

#[derive(Default)]
struct OptimizerStatusData {
    phase: String,
    total_iterations: usize,
    completed_iterations: usize,
    failed_iterations: usize,
    best_score: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OptimizerStatusSnapshot {
    pub phase: String,
    pub total_iterations: usize,
    pub completed_iterations: usize,
    pub failed_iterations: usize,
    pub best_score: Option<f64>,
}

impl OptimizerStatus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(OptimizerStatusData {
                phase: "Initializing".to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn set_phase<S: Into<String>>(&self, phase: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase.into();
        }
    }

    pub fn snapshot(&self) -> OptimizerStatusSnapshot {
        if let Ok(data) = self.inner.lock() {
            OptimizerStatusSnapshot {
                phase: data.phase.clone(),
                total_iterations: data.total_iterations,
                completed_iterations: data.completed_iterations,
                failed_iterations: data.failed_iterations,
                best_score: data.best_score,
            }
        } else {
            OptimizerStatusSnapshot {
                phase: "Status unavailable".to_string(),
                total_iterations: 0,
                completed_iterations: 0,
                failed_iterations: 0,
                best_score: None,
            }
        }
    }
}

impl SearchObserver for OptimizerStatus {
    fn on_search_started(&self, total_iterations: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = "Searching hyperparameters".to_string();
            data.total_iterations = total_iterations;
            data.completed_iterations = 0;
            data.failed_iterations = 0;
            data.best_score = None;
        }
    }

    fn on_candidate(&self, _configuration: &ModelConfiguration, best_score: Option<f64>) {
        if let Ok(mut data) = self.inner.lock() {
            data.completed_iterations += 1;
            data.best_score = best_score;
        }
    }

    fn on_candidate_failed(&self, _iteration: usize, _reason: &str) {
        if let Ok(mut data) = self.inner.lock() {
            data.completed_iterations += 1;
            data.failed_iterations += 1;
        }
    }
}

/// Shared flag a caller sets to abort a run at the next checkpoint.
#[derive(Clone, Default, Debug)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
