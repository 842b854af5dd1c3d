use crate::booster::{Booster, BoosterParams};
use crate::error::{PipelineError, Result};
use crate::metrics::{accuracy, argmax};
use crate::model::TrainedModel;
use crate::models::{FeatureSet, LabelEncoder, ModelConfiguration};
use log::info;
use ndarray::{ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeSet;

/// Row indices of a seeded train/test partition, each in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldoutSplit {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Shuffles `0..n` with `seed` and holds out `ceil(n * fraction)` rows,
/// clamped so both sides keep at least one row.
pub fn holdout_split(n: usize, fraction: f64, seed: u64) -> Result<HoldoutSplit> {
    if n < 2 {
        return Err(PipelineError::TrainingDataInsufficient(format!(
            "a hold-out split needs at least 2 rows, got {}",
            n
        )));
    }
    let test_size = ((n as f64 * fraction).ceil() as usize).clamp(1, n - 1);

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let mut test = indices[..test_size].to_vec();
    let mut train = indices[test_size..].to_vec();
    test.sort_unstable();
    train.sort_unstable();
    Ok(HoldoutSplit { train, test })
}

pub struct TrainingOutcome {
    pub model: TrainedModel,
    /// Accuracy on the held-out rows, in `[0, 1]`.
    pub accuracy: f64,
    pub holdout_size: usize,
}

/// Fits the final ensemble on the training side of a split and scores the
/// held-out side.
pub struct Trainer {
    rounds: usize,
}

impl Trainer {
    pub fn new(rounds: usize) -> Self {
        Self { rounds }
    }

    pub fn train(
        &self,
        matrix: ArrayView2<'_, f64>,
        labels: &[usize],
        encoder: &LabelEncoder,
        feature_set: &FeatureSet,
        configuration: &ModelConfiguration,
        split: &HoldoutSplit,
    ) -> Result<TrainingOutcome> {
        let train_classes: BTreeSet<usize> = split.train.iter().map(|&row| labels[row]).collect();
        let test_classes: BTreeSet<usize> = split.test.iter().map(|&row| labels[row]).collect();
        if let Some(missing) = train_classes.difference(&test_classes).next() {
            return Err(PipelineError::TrainingDataInsufficient(format!(
                "hold-out split of {} rows contains no examples of class {}",
                split.test.len(),
                encoder.decode(*missing).unwrap_or("?")
            )));
        }

        let train_x = matrix.select(Axis(0), &split.train);
        let train_y: Vec<usize> = split.train.iter().map(|&row| labels[row]).collect();
        let params = BoosterParams {
            max_depth: configuration.hyperparameters.max_depth,
            learning_rate: configuration.hyperparameters.learning_rate,
            rounds: self.rounds,
            ..BoosterParams::default()
        };
        let booster = Booster::fit(train_x.view(), &train_y, encoder.num_classes(), &params)?;

        let mut predicted = Vec::with_capacity(split.test.len());
        for &row in &split.test {
            let distribution = booster.predict_distribution(matrix.row(row)).ok_or_else(|| {
                PipelineError::FitFailed(format!("non-finite probabilities for row {}", row))
            })?;
            predicted.push(argmax(&distribution));
        }
        let actual: Vec<usize> = split.test.iter().map(|&row| labels[row]).collect();
        let accuracy = accuracy(&predicted, &actual);

        info!(
            "Trained final model on {} rows; hold-out accuracy {:.4} over {} rows",
            split.train.len(),
            accuracy,
            split.test.len()
        );

        Ok(TrainingOutcome {
            model: TrainedModel::new(
                feature_set.clone(),
                encoder.clone(),
                configuration.clone(),
                booster,
            ),
            accuracy,
            holdout_size: split.test.len(),
        })
    }
}
