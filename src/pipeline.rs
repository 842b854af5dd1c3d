use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::features::FeatureEngineer;
use crate::forest::ForestParams;
use crate::model::TrainedModel;
use crate::models::{FeatureSet, LabelEncoder, ModelConfiguration, PredictedRow, RecordTable};
use crate::optimizer::{HyperparameterOptimizer, OptimizerSettings};
use crate::optimizer_status::{CancellationToken, OptimizerStatus, SearchObserver};
use crate::selection::FeatureSelector;
use crate::trainer::{holdout_split, Trainer};
use log::info;
use ndarray::Axis;
use std::sync::Arc;
use std::time::Instant;

/// Everything a run produces.
pub struct PipelineOutput {
    pub model: TrainedModel,
    pub accuracy: f64,
    pub holdout_size: usize,
    pub feature_set: FeatureSet,
    pub best_configuration: ModelConfiguration,
    pub search_history: Vec<ModelConfiguration>,
    pub failed_candidates: usize,
    /// One row per engineered row, in frame order.
    pub predictions: Vec<PredictedRow>,
}

/// Runs engineering, selection, search and training as one sequential batch.
/// Each stage owns its inputs; nothing survives between runs except what the
/// caller keeps from [`PipelineOutput`].
pub struct Pipeline {
    config: PipelineConfig,
    status: OptimizerStatus,
    cancel: CancellationToken,
    observer: Option<Arc<dyn SearchObserver>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            status: OptimizerStatus::new(),
            cancel: CancellationToken::new(),
            observer: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Additional observer notified alongside the built-in status.
    pub fn with_observer(mut self, observer: Arc<dyn SearchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn status(&self) -> &OptimizerStatus {
        &self.status
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn run(&self, table: &RecordTable) -> Result<PipelineOutput> {
        let started = Instant::now();
        self.config.validate()?;

        self.enter("feature engineering")?;
        let frame = FeatureEngineer::new(self.config.features.clone()).transform(table)?;
        if frame.is_empty() {
            return Err(PipelineError::FeatureDeficiency(format!(
                "no rows survive a rolling window of {}",
                self.config.features.window
            )));
        }
        let outcomes = frame.outcomes();
        let encoder = LabelEncoder::fit(&outcomes)?;
        let labels = encoder.encode_all(&outcomes)?;
        info!(
            "Engineered {} rows x {} columns; {} outcome classes",
            frame.len(),
            frame.columns.len(),
            encoder.num_classes()
        );

        self.enter("feature selection")?;
        let selector = FeatureSelector::new(
            self.config.selected_feature_count,
            ForestParams {
                n_trees: self.config.selector_trees,
                min_samples_leaf: 1,
                seed: self.config.seed,
            },
        );
        let feature_set = selector.select(&frame, &labels, encoder.num_classes())?;
        let matrix = frame.project(&feature_set)?;
        info!("Selected features: {}", feature_set.names().join(", "));

        let split = holdout_split(matrix.nrows(), self.config.holdout_fraction, self.config.seed)?;
        let train_x = matrix.select(Axis(0), &split.train);
        let train_y: Vec<usize> = split.train.iter().map(|&row| labels[row]).collect();

        self.enter("hyperparameter search")?;
        let optimizer = HyperparameterOptimizer::new(OptimizerSettings::from_config(&self.config))
            .with_observer(Arc::new(StatusFanOut {
                status: self.status.clone(),
                extra: self.observer.clone(),
            }))
            .with_cancellation(self.cancel.clone());
        let search = optimizer.optimize(train_x.view(), &train_y, encoder.num_classes())?;

        self.enter("training")?;
        let outcome = Trainer::new(self.config.boosting_rounds).train(
            matrix.view(),
            &labels,
            &encoder,
            &feature_set,
            &search.best,
            &split,
        )?;

        self.enter("prediction")?;
        let predictions = outcome.model.predict_frame(&frame)?;

        self.status.set_phase("Finished");
        info!(
            "Pipeline finished in {:.1}s: accuracy {:.4} on {} held-out rows (model {})",
            started.elapsed().as_secs_f64(),
            outcome.accuracy,
            outcome.holdout_size,
            outcome.model.id()
        );

        Ok(PipelineOutput {
            accuracy: outcome.accuracy,
            holdout_size: outcome.holdout_size,
            model: outcome.model,
            feature_set,
            best_configuration: search.best,
            search_history: search.history,
            failed_candidates: search.failed,
            predictions,
        })
    }

    fn enter(&self, stage: &'static str) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.status.set_phase("Cancelled");
            return Err(PipelineError::Cancelled { stage });
        }
        self.status.set_phase(stage);
        info!("Stage: {}", stage);
        Ok(())
    }
}

struct StatusFanOut {
    status: OptimizerStatus,
    extra: Option<Arc<dyn SearchObserver>>,
}

impl SearchObserver for StatusFanOut {
    fn on_search_started(&self, total_iterations: usize) {
        self.status.on_search_started(total_iterations);
        if let Some(extra) = &self.extra {
            extra.on_search_started(total_iterations);
        }
    }

    fn on_candidate(&self, configuration: &ModelConfiguration, best_score: Option<f64>) {
        self.status.on_candidate(configuration, best_score);
        if let Some(extra) = &self.extra {
            extra.on_candidate(configuration, best_score);
        }
    }

    fn on_candidate_failed(&self, iteration: usize, reason: &str) {
        self.status.on_candidate_failed(iteration, reason);
        if let Some(extra) = &self.extra {
            extra.on_candidate_failed(iteration, reason);
        }
    }
}
