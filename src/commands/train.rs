use crate::commands::InputArgs;
use crate::config::PipelineConfig;
use crate::dataset::{load_records, write_predictions};
use crate::models::ModelConfiguration;
use crate::optimizer_status::SearchObserver;
use crate::pipeline::Pipeline;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Flags of the `train` subcommand that override the settings map.
#[derive(Debug, Clone, Default)]
pub struct TrainOverrides {
    pub selected_feature_count: Option<usize>,
    pub search_iterations: Option<usize>,
    pub cv_folds: Option<usize>,
    pub holdout_fraction: Option<f64>,
    pub seed: Option<u64>,
}

impl TrainOverrides {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(value) = self.selected_feature_count {
            config.selected_feature_count = value;
        }
        if let Some(value) = self.search_iterations {
            config.search_iterations = value;
            config.initial_points = config.initial_points.min(value);
        }
        if let Some(value) = self.cv_folds {
            config.cv_folds = value;
        }
        if let Some(value) = self.holdout_fraction {
            config.holdout_fraction = value;
        }
        if let Some(value) = self.seed {
            config.seed = value;
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TrainingSummary {
    model_id: String,
    accuracy: f64,
    holdout_size: usize,
    feature_set: Vec<String>,
    class_labels: Vec<String>,
    best_configuration: ModelConfiguration,
    candidates_evaluated: usize,
    candidates_failed: usize,
    predicted_rows: usize,
}

struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self { bar }
    }
}

impl SearchObserver for ProgressObserver {
    fn on_search_started(&self, total_iterations: usize) {
        self.bar.set_length(total_iterations as u64);
        self.bar.set_position(0);
    }

    fn on_candidate(&self, _configuration: &ModelConfiguration, best_score: Option<f64>) {
        if let Some(best) = best_score {
            self.bar.set_message(format!("best {:.4}", best));
        }
        self.bar.inc(1);
    }

    fn on_candidate_failed(&self, _iteration: usize, _reason: &str) {
        self.bar.inc(1);
    }
}

pub fn run(
    mut config: PipelineConfig,
    input: &InputArgs,
    overrides: &TrainOverrides,
    model_out: &Path,
    predictions_out: Option<PathBuf>,
) -> Result<()> {
    input.apply(&mut config.features)?;
    overrides.apply(&mut config);
    config.validate()?;

    info!(
        "Training from {} (window {}, {} features, {} search iterations, {} folds)",
        input.input.display(),
        config.features.window,
        config.selected_feature_count,
        config.search_iterations,
        config.cv_folds
    );
    let table = load_records(&input.input, &input.schema())
        .with_context(|| format!("Failed to load {}", input.input.display()))?;

    let observer = Arc::new(ProgressObserver::new());
    let pipeline = Pipeline::new(config).with_observer(observer.clone());
    let output = pipeline.run(&table);
    observer.bar.finish_and_clear();
    let output = output?;

    if let Some(parent) = model_out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let model_text = output.model.to_model_text()?;
    fs::write(model_out, model_text)
        .with_context(|| format!("Failed to write {}", model_out.display()))?;
    println!("Saved model {} to {}", output.model.id(), model_out.display());

    if let Some(path) = predictions_out {
        write_predictions(&path, &output.predictions)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved {} predicted rows to {}", output.predictions.len(), path.display());
    }

    println!(
        "Hold-out accuracy: {:.4} over {} rows",
        output.accuracy, output.holdout_size
    );

    let summary = TrainingSummary {
        model_id: output.model.id().to_string(),
        accuracy: output.accuracy,
        holdout_size: output.holdout_size,
        feature_set: output.feature_set.names().to_vec(),
        class_labels: output.model.class_labels().to_vec(),
        best_configuration: output.best_configuration.clone(),
        candidates_evaluated: output.search_history.len(),
        candidates_failed: output.failed_candidates,
        predicted_rows: output.predictions.len(),
    };
    match serde_json::to_string(&summary) {
        Ok(payload) => println!("OUTCOME_ENGINE_TRAIN_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize training summary: {err}"),
    }

    Ok(())
}
