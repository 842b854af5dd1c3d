use crate::booster::{Booster, BoosterParams};
use crate::config::{PipelineConfig, SearchObjective};
use crate::cross_validation::{stratified_folds, Fold};
use crate::error::{PipelineError, Result};
use crate::gaussian_process::GaussianProcess;
use crate::metrics::{accuracy, argmax, log_loss};
use crate::models::{Hyperparameters, ModelConfiguration};
use crate::optimizer_status::{CancellationToken, SearchObserver};
use crate::search_space::SearchSpace;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use ndarray::{aview1, Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const ACQUISITION_CANDIDATES: usize = 512;
const EXPLORATION_MARGIN: f64 = 0.01;

/// Scores one hyperparameter assignment on one cross-validation fold.
/// Higher is better.
pub trait CandidateEvaluator: Sync {
    fn evaluate_fold(&self, params: &Hyperparameters, fold: &Fold) -> Result<f64>;
}

/// Fits a boosted ensemble on the fold's training rows and scores its
/// validation rows.
pub struct BoostedFoldEvaluator<'a> {
    matrix: ArrayView2<'a, f64>,
    labels: &'a [usize],
    num_classes: usize,
    rounds: usize,
    objective: SearchObjective,
}

impl<'a> BoostedFoldEvaluator<'a> {
    pub fn new(
        matrix: ArrayView2<'a, f64>,
        labels: &'a [usize],
        num_classes: usize,
        rounds: usize,
        objective: SearchObjective,
    ) -> Self {
        Self {
            matrix,
            labels,
            num_classes,
            rounds,
            objective,
        }
    }
}

impl CandidateEvaluator for BoostedFoldEvaluator<'_> {
    fn evaluate_fold(&self, params: &Hyperparameters, fold: &Fold) -> Result<f64> {
        let train_x = self.matrix.select(Axis(0), &fold.train);
        let train_y: Vec<usize> = fold.train.iter().map(|&row| self.labels[row]).collect();
        let booster = Booster::fit(
            train_x.view(),
            &train_y,
            self.num_classes,
            &BoosterParams {
                max_depth: params.max_depth,
                learning_rate: params.learning_rate,
                rounds: self.rounds,
                ..BoosterParams::default()
            },
        )?;

        let mut distributions = Vec::with_capacity(fold.validation.len());
        for &row in &fold.validation {
            let distribution = booster.predict_distribution(self.matrix.row(row)).ok_or_else(|| {
                PipelineError::FitFailed(format!("non-finite probabilities for row {}", row))
            })?;
            distributions.push(distribution);
        }
        let actual: Vec<usize> = fold.validation.iter().map(|&row| self.labels[row]).collect();

        Ok(match self.objective {
            SearchObjective::Accuracy => {
                let predicted: Vec<usize> = distributions.iter().map(|d| argmax(d)).collect();
                accuracy(&predicted, &actual)
            }
            SearchObjective::LogLoss => -log_loss(&distributions, &actual),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerSettings {
    pub iterations: usize,
    pub initial_points: usize,
    pub folds: usize,
    pub seed: u64,
    pub time_budget: Option<Duration>,
    pub space: SearchSpace,
    pub objective: SearchObjective,
    pub boosting_rounds: usize,
}

impl OptimizerSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            iterations: config.search_iterations,
            initial_points: config.initial_points,
            folds: config.cv_folds,
            seed: config.seed,
            time_budget: config.search_time_budget,
            space: config.search_space,
            objective: config.objective,
            boosting_rounds: config.boosting_rounds,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub best: ModelConfiguration,
    /// Every candidate that produced a score, in evaluation order.
    pub history: Vec<ModelConfiguration>,
    pub failed: usize,
}

/// Sequential model-based search over [`SearchSpace`].
///
/// The first `initial_points` candidates are drawn at random; later ones
/// maximise expected improvement under a Gaussian-process surrogate of the
/// scores seen so far. Each candidate's folds run on a worker pool and are
/// all collected before the next candidate is chosen.
pub struct HyperparameterOptimizer {
    settings: OptimizerSettings,
    observer: Option<Arc<dyn SearchObserver>>,
    cancel: Option<CancellationToken>,
}

type CandidateResult = std::result::Result<(f64, usize), String>;

impl HyperparameterOptimizer {
    pub fn new(settings: OptimizerSettings) -> Self {
        Self {
            settings,
            observer: None,
            cancel: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SearchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Searches with the boosted-ensemble evaluator.
    pub fn optimize(
        &self,
        matrix: ArrayView2<'_, f64>,
        labels: &[usize],
        num_classes: usize,
    ) -> Result<SearchOutcome> {
        let evaluator = BoostedFoldEvaluator::new(
            matrix.view(),
            labels,
            num_classes,
            self.settings.boosting_rounds,
            self.settings.objective,
        );
        self.search(&evaluator, labels)
    }

    pub fn search<E: CandidateEvaluator>(&self, evaluator: &E, labels: &[usize]) -> Result<SearchOutcome> {
        let settings = &self.settings;
        settings.space.validate()?;
        let folds = stratified_folds(labels, settings.folds)?;

        info!(
            "Starting hyperparameter search: {} iterations ({} random), {} folds, objective {}",
            settings.iterations,
            settings.initial_points.min(settings.iterations),
            folds.len(),
            settings.objective.label()
        );
        if let Some(observer) = &self.observer {
            observer.on_search_started(settings.iterations);
        }

        let started = Instant::now();
        let mut rng = StdRng::seed_from_u64(settings.seed);
        let mut observed_points: Vec<[f64; SearchSpace::DIMENSIONS]> = Vec::new();
        let mut observed_scores: Vec<f64> = Vec::new();
        let mut evaluated: HashMap<String, CandidateResult> = HashMap::new();
        let mut history: Vec<ModelConfiguration> = Vec::new();
        let mut best: Option<ModelConfiguration> = None;
        let mut failed = 0;

        for iteration in 0..settings.iterations {
            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(PipelineError::Cancelled {
                    stage: "hyperparameter search",
                });
            }
            if let Some(budget) = settings.time_budget {
                if iteration > 0 && started.elapsed() >= budget {
                    info!(
                        "Search time budget of {:.1}s reached after {} iterations",
                        budget.as_secs_f64(),
                        iteration
                    );
                    break;
                }
            }

            let point = if iteration < settings.initial_points || observed_scores.len() < 2 {
                settings.space.sample_unit(&mut rng)
            } else {
                propose(&settings.space, &observed_points, &observed_scores, &mut rng)
            };
            let params = settings.space.decode(&point);
            let signature = parameter_signature(&params);

            let result = match evaluated.get(&signature) {
                Some(previous) => {
                    debug!("Iteration {} repeats {}; reusing score", iteration, signature);
                    previous.clone()
                }
                None => {
                    let result = evaluate_candidate(evaluator, &params, &folds);
                    evaluated.insert(signature, result.clone());
                    result
                }
            };

            match result {
                Ok((score, folds_completed)) => {
                    let configuration = ModelConfiguration {
                        iteration,
                        hyperparameters: params,
                        cv_score: score,
                        folds_completed,
                    };
                    observed_points.push(settings.space.encode(&params));
                    observed_scores.push(score);
                    if best.as_ref().map_or(true, |current| score > current.cv_score) {
                        best = Some(configuration.clone());
                    }
                    info!(
                        "Candidate {} finished: {} {:.4} over {} folds (max_depth: {}, learning_rate: {:.4})",
                        iteration,
                        settings.objective.label(),
                        score,
                        folds_completed,
                        params.max_depth,
                        params.learning_rate
                    );
                    if let Some(observer) = &self.observer {
                        observer.on_candidate(&configuration, best.as_ref().map(|b| b.cv_score));
                    }
                    history.push(configuration);
                }
                Err(reason) => {
                    failed += 1;
                    warn!("Candidate {} failed on every fold: {}", iteration, reason);
                    if let Some(observer) = &self.observer {
                        observer.on_candidate_failed(iteration, &reason);
                    }
                }
            }
        }

        let best = best.ok_or_else(|| {
            PipelineError::OptimizationExhausted(format!(
                "none of {} candidates completed a fold",
                failed
            ))
        })?;
        info!(
            "Best configuration from iteration {}: max_depth {}, learning_rate {:.4}, score {:.4}",
            best.iteration, best.hyperparameters.max_depth, best.hyperparameters.learning_rate, best.cv_score
        );

        Ok(SearchOutcome {
            best,
            history,
            failed,
        })
    }
}

pub(crate) fn parameter_signature(params: &Hyperparameters) -> String {
    format!(
        "max_depth={}|learning_rate={}",
        params.max_depth, params.learning_rate
    )
}

/// Runs every fold on a bounded worker pool. The score is the mean over the
/// folds that succeeded; the candidate fails only if none did.
fn evaluate_candidate<E: CandidateEvaluator>(
    evaluator: &E,
    params: &Hyperparameters,
    folds: &[Fold],
) -> CandidateResult {
    let num_workers = std::cmp::min(folds.len(), std::cmp::max(1, num_cpus::get()));
    let (tx, rx): (Sender<&Fold>, Receiver<&Fold>) = bounded(folds.len());
    let (result_tx, result_rx): (Sender<(usize, Result<f64>)>, Receiver<(usize, Result<f64>)>) =
        bounded(folds.len());

    let mut results: Vec<(usize, Result<f64>)> = thread::scope(|scope| {
        for _worker_id in 0..num_workers {
            let rx = rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                while let Ok(fold) = rx.recv() {
                    let outcome = evaluator.evaluate_fold(params, fold);
                    if result_tx.send((fold.index, outcome)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for fold in folds {
            if tx.send(fold).is_err() {
                break;
            }
        }
        drop(tx);

        result_rx.iter().collect()
    });
    results.sort_by_key(|(index, _)| *index);

    let mut scores = Vec::with_capacity(results.len());
    let mut first_error: Option<String> = None;
    for (index, outcome) in results {
        match outcome {
            Ok(score) if score.is_finite() => scores.push(score),
            Ok(score) => {
                warn!("Fold {} produced a non-finite score ({}); skipping", index, score);
                first_error.get_or_insert_with(|| format!("fold {} score {}", index, score));
            }
            Err(err) => {
                warn!("Fold {} failed: {}", index, err);
                first_error.get_or_insert_with(|| err.to_string());
            }
        }
    }

    if scores.is_empty() {
        return Err(first_error.unwrap_or_else(|| "no folds were evaluated".to_string()));
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    Ok((mean, scores.len()))
}

/// Picks the unit-cube point with the highest expected improvement among
/// random candidates. Equal values keep the earlier candidate.
fn propose(
    space: &SearchSpace,
    points: &[[f64; SearchSpace::DIMENSIONS]],
    scores: &[f64],
    rng: &mut StdRng,
) -> [f64; SearchSpace::DIMENSIONS] {
    let x = Array2::from_shape_fn((points.len(), SearchSpace::DIMENSIONS), |(row, dim)| {
        points[row][dim]
    });
    let mut surrogate = GaussianProcess::default();
    let standard_normal = Normal::new(0.0, 1.0);
    let fitted = surrogate.fit(x, Array1::from(scores.to_vec()));
    let (true, Ok(standard_normal)) = (fitted, standard_normal) else {
        debug!("Surrogate unavailable; sampling at random");
        return space.sample_unit(rng);
    };

    let incumbent = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut best_point = space.sample_unit(rng);
    let mut best_value = f64::NEG_INFINITY;

    for candidate_index in 0..ACQUISITION_CANDIDATES {
        let candidate = if candidate_index == 0 {
            best_point
        } else {
            space.sample_unit(rng)
        };
        let (mean, variance) = surrogate.predict(aview1(&candidate));
        let sigma = variance.sqrt();
        let improvement = mean - incumbent - EXPLORATION_MARGIN;
        let value = if sigma < 1e-12 {
            improvement.max(0.0)
        } else {
            let z = improvement / sigma;
            improvement * standard_normal.cdf(z) + sigma * standard_normal.pdf(z)
        };
        if value > best_value {
            best_value = value;
            best_point = candidate;
        }
    }

    debug!("Expected improvement {:.6} at {:?}", best_value, best_point);
    best_point
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search_space::{IntRange, LogRange};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(iterations: usize) -> OptimizerSettings {
        OptimizerSettings {
            iterations,
            initial_points: 3,
            folds: 3,
            seed: 42,
            time_budget: None,
            space: SearchSpace::default(),
            objective: SearchObjective::Accuracy,
            boosting_rounds: 10,
        }
    }

    fn labels() -> Vec<usize> {
        (0..12).map(|i| i % 2).collect()
    }

    struct Constant;

    impl CandidateEvaluator for Constant {
        fn evaluate_fold(&self, _params: &Hyperparameters, _fold: &Fold) -> Result<f64> {
            Ok(0.5)
        }
    }

    struct AlwaysFails;

    impl CandidateEvaluator for AlwaysFails {
        fn evaluate_fold(&self, _params: &Hyperparameters, _fold: &Fold) -> Result<f64> {
            Err(PipelineError::FitFailed("diverged".to_string()))
        }
    }

    struct FirstFoldFails;

    impl CandidateEvaluator for FirstFoldFails {
        fn evaluate_fold(&self, _params: &Hyperparameters, fold: &Fold) -> Result<f64> {
            if fold.index == 0 {
                Err(PipelineError::FitFailed("singular".to_string()))
            } else {
                Ok(fold.index as f64 / 10.0)
            }
        }
    }

    struct Counting(AtomicUsize);

    impl CandidateEvaluator for Counting {
        fn evaluate_fold(&self, _params: &Hyperparameters, _fold: &Fold) -> Result<f64> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(0.7)
        }
    }

    /// Rewards shallow trees with large learning rates.
    struct Shaped;

    impl CandidateEvaluator for Shaped {
        fn evaluate_fold(&self, params: &Hyperparameters, _fold: &Fold) -> Result<f64> {
            Ok(params.learning_rate - params.max_depth as f64 * 0.001)
        }
    }

    #[test]
    fn ties_keep_the_first_candidate() {
        let outcome = HyperparameterOptimizer::new(settings(6))
            .search(&Constant, &labels())
            .expect("search");
        assert_eq!(outcome.best.iteration, 0);
        assert_eq!(outcome.history.len(), 6);
        assert_eq!(outcome.best.folds_completed, 3);
    }

    #[test]
    fn all_failures_exhaust_the_search() {
        let err = HyperparameterOptimizer::new(settings(4))
            .search(&AlwaysFails, &labels())
            .expect_err("nothing succeeds");
        assert!(matches!(err, PipelineError::OptimizationExhausted(_)));
    }

    #[test]
    fn failed_folds_are_skipped() {
        let outcome = HyperparameterOptimizer::new(settings(2))
            .search(&FirstFoldFails, &labels())
            .expect("partial folds");
        assert_eq!(outcome.best.folds_completed, 2);
        assert!((outcome.best.cv_score - 0.15).abs() < 1e-12);
    }

    #[test]
    fn repeated_proposals_reuse_scores() {
        let mut settings = settings(5);
        settings.space = SearchSpace {
            max_depth: IntRange { min: 4, max: 4 },
            learning_rate: LogRange { min: 0.1, max: 0.1 },
        };
        let evaluator = Counting(AtomicUsize::new(0));
        let outcome = HyperparameterOptimizer::new(settings)
            .search(&evaluator, &labels())
            .expect("search");
        assert_eq!(evaluator.0.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.history.len(), 5);
    }

    #[test]
    fn guided_search_finds_a_good_region() {
        let outcome = HyperparameterOptimizer::new(settings(15))
            .search(&Shaped, &labels())
            .expect("search");
        let best = outcome.best.hyperparameters;
        assert!(outcome.best.cv_score >= outcome.history[0].cv_score);
        assert!(best.learning_rate > 0.05, "learning rate {}", best.learning_rate);
    }

    #[test]
    fn zero_time_budget_still_evaluates_one_candidate() {
        let mut settings = settings(10);
        settings.time_budget = Some(Duration::ZERO);
        let outcome = HyperparameterOptimizer::new(settings)
            .search(&Constant, &labels())
            .expect("search");
        assert_eq!(outcome.history.len(), 1);
    }

    #[test]
    fn cancelled_search_stops_before_evaluating() {
        let token = CancellationToken::new();
        token.cancel();
        let err = HyperparameterOptimizer::new(settings(3))
            .with_cancellation(token)
            .search(&Constant, &labels())
            .expect_err("cancelled");
        assert!(matches!(err, PipelineError::Cancelled { .. }));
    }

    #[test]
    fn boosted_evaluator_scores_separable_data() {
        let matrix = Array2::from_shape_fn((24, 1), |(i, _)| (i % 2) as f64 * 5.0 + (i % 3) as f64);
        let labels: Vec<usize> = (0..24).map(|i| i % 2).collect();
        let outcome = HyperparameterOptimizer::new(settings(3))
            .optimize(matrix.view(), &labels, 2)
            .expect("search");
        assert!((outcome.best.cv_score - 1.0).abs() < 1e-12);
    }
}
