use crate::cart::{grow, NewtonObjective, TreeParams};
use crate::error::{PipelineError, Result};
use crate::metrics::argmax;
use crate::tree::{parse_array, parse_value, Tree};
use log::debug;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt::Write as _;

const EPSILON: f64 = 1e-12;
const PROBABILITY_FLOOR: f64 = 1e-6;
const MIN_HESSIAN: f64 = 1e-16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectiveKind {
    Binary,
    Multiclass,
}

impl ObjectiveKind {
    fn label(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Multiclass => "multiclass",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoosterParams {
    pub max_depth: usize,
    pub learning_rate: f64,
    pub rounds: usize,
    pub lambda: f64,
    pub min_samples_leaf: usize,
}

impl Default for BoosterParams {
    fn default() -> Self {
        Self {
            max_depth: 6,
            learning_rate: 0.1,
            rounds: 100,
            lambda: 1.0,
            min_samples_leaf: 1,
        }
    }
}

/// Gradient-boosted tree ensemble.
///
/// Binary models carry one tree per round and score the log-odds of class 1.
/// Multiclass models carry one tree per class per round, stored round-major,
/// and score each class independently before a softmax.
#[derive(Debug, Clone, PartialEq)]
pub struct Booster {
    objective: ObjectiveKind,
    num_classes: usize,
    num_tree_per_iteration: usize,
    base_scores: Vec<f64>,
    trees: Vec<Tree>,
    feature_count: usize,
}

impl Booster {
    pub fn fit(
        matrix: ArrayView2<'_, f64>,
        labels: &[usize],
        num_classes: usize,
        params: &BoosterParams,
    ) -> Result<Self> {
        if num_classes < 2 {
            return Err(PipelineError::FitFailed(format!(
                "need at least two classes, got {}",
                num_classes
            )));
        }
        if matrix.nrows() == 0 || matrix.nrows() != labels.len() {
            return Err(PipelineError::FitFailed(format!(
                "{} rows supplied with {} labels",
                matrix.nrows(),
                labels.len()
            )));
        }
        if let Some(label) = labels.iter().find(|&&label| label >= num_classes) {
            return Err(PipelineError::FitFailed(format!(
                "label {} is out of range for {} classes",
                label, num_classes
            )));
        }
        if !(params.learning_rate.is_finite() && params.learning_rate > 0.0) {
            return Err(PipelineError::FitFailed(format!(
                "learning rate must be positive (value: {})",
                params.learning_rate
            )));
        }

        let (n_rows, feature_count) = matrix.dim();
        let (objective, outputs) = if num_classes == 2 {
            (ObjectiveKind::Binary, 1)
        } else {
            (ObjectiveKind::Multiclass, num_classes)
        };

        let mut class_counts = vec![0.0; num_classes];
        for &label in labels {
            class_counts[label] += 1.0;
        }
        let base_scores: Vec<f64> = match objective {
            ObjectiveKind::Binary => {
                let p = (class_counts[1] / n_rows as f64).clamp(PROBABILITY_FLOOR, 1.0 - PROBABILITY_FLOOR);
                vec![(p / (1.0 - p)).ln()]
            }
            ObjectiveKind::Multiclass => class_counts
                .iter()
                .map(|count| (count / n_rows as f64).max(PROBABILITY_FLOOR).ln())
                .collect(),
        };

        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_leaf: params.min_samples_leaf,
            max_features: None,
            min_gain: EPSILON,
        };
        let rows: Vec<usize> = (0..n_rows).collect();
        let mut raw = Array2::from_shape_fn((n_rows, outputs), |(_, output)| base_scores[output]);
        let mut trees = Vec::with_capacity(params.rounds * outputs);
        let mut gradients = vec![0.0; n_rows];
        let mut hessians = vec![0.0; n_rows];
        // Every feature is a split candidate, so the generator is never drawn from.
        let mut rng = StdRng::seed_from_u64(0);

        for round in 0..params.rounds {
            let mut probabilities = Array2::<f64>::zeros((n_rows, num_classes));
            for (scores, mut distribution) in raw.rows().into_iter().zip(probabilities.rows_mut()) {
                distribution.assign(&output_probabilities(objective, scores));
            }

            for output in 0..outputs {
                for row in 0..n_rows {
                    let (p, y) = match objective {
                        ObjectiveKind::Binary => (probabilities[[row, 1]], (labels[row] == 1) as u8 as f64),
                        ObjectiveKind::Multiclass => {
                            (probabilities[[row, output]], (labels[row] == output) as u8 as f64)
                        }
                    };
                    gradients[row] = p - y;
                    hessians[row] = (p * (1.0 - p)).max(MIN_HESSIAN);
                }

                let split_objective = NewtonObjective::new(&gradients, &hessians, params.lambda);
                let mut tree = grow(&split_objective, matrix, &rows, feature_count, &tree_params, &mut rng).tree;
                tree.shrinkage = params.learning_rate;

                for (row, features) in matrix.rows().into_iter().enumerate() {
                    raw[[row, output]] += tree.predict(features);
                    if !raw[[row, output]].is_finite() {
                        return Err(PipelineError::FitFailed(format!(
                            "raw score diverged in round {} for row {}",
                            round, row
                        )));
                    }
                }
                trees.push(tree);
            }

            if round % 25 == 0 {
                let loss = log_loss_of(probabilities.view(), labels);
                debug!("Boosting round {}: training log-loss {:.6}", round, loss);
            }
        }

        Ok(Self {
            objective,
            num_classes,
            num_tree_per_iteration: outputs,
            base_scores,
            trees,
            feature_count,
        })
    }

    pub fn objective(&self) -> ObjectiveKind {
        self.objective
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_features(&self) -> usize {
        self.feature_count
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// Number of raw score outputs (1 for binary, one per class otherwise).
    pub fn num_outputs(&self) -> usize {
        self.num_tree_per_iteration
    }

    pub fn base_score(&self, output: usize) -> f64 {
        self.base_scores.get(output).copied().unwrap_or_default()
    }

    /// Trees contributing to `output`, in boosting order.
    pub fn trees_for_output(&self, output: usize) -> impl Iterator<Item = &Tree> {
        self.trees
            .iter()
            .skip(output)
            .step_by(self.num_tree_per_iteration.max(1))
    }

    pub fn raw_scores(&self, features: ArrayView1<'_, f64>) -> Array1<f64> {
        let mut scores = Array1::from(self.base_scores.clone());
        for (tree_idx, tree) in self.trees.iter().enumerate() {
            let bucket = tree_idx % self.num_tree_per_iteration;
            if let Some(slot) = scores.get_mut(bucket) {
                *slot += tree.predict(features);
            }
        }
        scores
    }

    /// Class probabilities, or `None` when the row is narrower than the model.
    pub fn predict_distribution(&self, features: ArrayView1<'_, f64>) -> Option<Vec<f64>> {
        if features.len() < self.feature_count {
            return None;
        }
        let probabilities = output_probabilities(self.objective, self.raw_scores(features).view());
        if probabilities.iter().all(|p| p.is_finite()) {
            Some(probabilities.to_vec())
        } else {
            None
        }
    }

    /// Most probable class and its probability; ties keep the lower class.
    pub fn predict_class(&self, features: ArrayView1<'_, f64>) -> Option<(usize, f64)> {
        let distribution = self.predict_distribution(features)?;
        let best = argmax(&distribution);
        Some((best, distribution[best]))
    }

    /// Mean raw score of `output` over the training rows.
    pub fn expected_raw_score(&self, output: usize) -> f64 {
        self.base_score(output)
            + self
                .trees_for_output(output)
                .map(Tree::expected_value)
                .sum::<f64>()
    }

    pub fn supports_attribution(&self) -> bool {
        self.trees.iter().all(Tree::has_covers)
    }

    pub fn write_text(&self, out: &mut String) {
        let _ = writeln!(out, "objective={}", self.objective.label());
        let _ = writeln!(out, "num_class={}", self.num_classes);
        let _ = writeln!(out, "num_tree_per_iteration={}", self.num_tree_per_iteration);
        let _ = writeln!(out, "max_feature_idx={}", self.feature_count.saturating_sub(1));
        let base: Vec<String> = self.base_scores.iter().map(f64::to_string).collect();
        let _ = writeln!(out, "base_score={}", base.join(" "));
        out.push('\n');
        for (index, tree) in self.trees.iter().enumerate() {
            tree.write_block(index, out);
        }
        out.push_str("end of trees\n");
    }

    /// Parses the booster section of a model file; unrelated keys are skipped.
    pub fn from_model_text(text: &str) -> Result<Self> {
        let mut lines = text.lines().peekable();
        let mut trees = Vec::new();
        let mut max_feature_idx: Option<usize> = None;
        let mut num_classes: Option<usize> = None;
        let mut num_tree_per_iteration: usize = 1;
        let mut objective: Option<ObjectiveKind> = None;
        let mut base_scores: Vec<f64> = Vec::new();

        while let Some(line) = lines.next() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if let Some(raw) = trimmed.strip_prefix("objective=") {
                objective = match raw.split_whitespace().next() {
                    Some("binary") => Some(ObjectiveKind::Binary),
                    Some("multiclass") => Some(ObjectiveKind::Multiclass),
                    other => {
                        return Err(PipelineError::ModelFormat(format!(
                            "unsupported objective {:?}",
                            other
                        )))
                    }
                };
            } else if trimmed.starts_with("num_class=") {
                num_classes = Some(parse_value(trimmed, "num_class=")?);
            } else if trimmed.starts_with("num_tree_per_iteration=") {
                num_tree_per_iteration = parse_value(trimmed, "num_tree_per_iteration=")?;
            } else if trimmed.starts_with("max_feature_idx=") {
                max_feature_idx = Some(parse_value(trimmed, "max_feature_idx=")?);
            } else if trimmed.starts_with("base_score=") {
                base_scores = parse_array(trimmed, "base_score=")?;
            } else if trimmed.starts_with("Tree=") {
                trees.push(Tree::from_lines(&mut lines)?);
            } else if trimmed == "end of trees" {
                break;
            }
        }

        let objective =
            objective.ok_or_else(|| PipelineError::ModelFormat("missing objective".to_string()))?;
        let num_classes =
            num_classes.ok_or_else(|| PipelineError::ModelFormat("missing num_class".to_string()))?;
        let expected_outputs = match objective {
            ObjectiveKind::Binary => 1,
            ObjectiveKind::Multiclass => num_classes,
        };
        if num_classes < 2
            || (objective == ObjectiveKind::Binary && num_classes != 2)
            || num_tree_per_iteration != expected_outputs
        {
            return Err(PipelineError::ModelFormat(format!(
                "{} objective with {} classes cannot have {} trees per iteration",
                objective.label(),
                num_classes,
                num_tree_per_iteration
            )));
        }
        if base_scores.len() != expected_outputs {
            return Err(PipelineError::ModelFormat(format!(
                "expected {} base scores, found {}",
                expected_outputs,
                base_scores.len()
            )));
        }
        if trees.is_empty() || trees.len() % num_tree_per_iteration != 0 {
            return Err(PipelineError::ModelFormat(format!(
                "{} trees do not fill whole iterations of {}",
                trees.len(),
                num_tree_per_iteration
            )));
        }

        let inferred_max_feature = trees
            .iter()
            .flat_map(|tree| tree.split_features.iter())
            .copied()
            .max()
            .unwrap_or(0);
        let feature_count = max_feature_idx
            .map(|idx| idx + 1)
            .unwrap_or(inferred_max_feature + 1);
        if trees
            .iter()
            .flat_map(|tree| tree.split_features.iter())
            .any(|&feature| feature >= feature_count)
        {
            return Err(PipelineError::ModelFormat(format!(
                "split feature out of range for {} features",
                feature_count
            )));
        }

        Ok(Self {
            objective,
            num_classes,
            num_tree_per_iteration,
            base_scores,
            trees,
            feature_count,
        })
    }
}

fn output_probabilities(objective: ObjectiveKind, raw_scores: ArrayView1<'_, f64>) -> Array1<f64> {
    match objective {
        ObjectiveKind::Binary => {
            let logit = raw_scores.get(0).copied().unwrap_or(0.0);
            let probability = 1.0 / (1.0 + (-logit).exp());
            Array1::from(vec![
                (1.0 - probability).clamp(0.0, 1.0),
                probability.clamp(0.0, 1.0),
            ])
        }
        ObjectiveKind::Multiclass => {
            let max_score = raw_scores
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, |acc, value| acc.max(value));
            let exp_scores = raw_scores.mapv(|score| (score - max_score).exp());
            let denom = exp_scores.sum();
            if !denom.is_finite() || denom <= EPSILON {
                return Array1::from_elem(raw_scores.len(), f64::NAN);
            }
            exp_scores / denom
        }
    }
}

fn log_loss_of(probabilities: ArrayView2<'_, f64>, labels: &[usize]) -> f64 {
    let total: f64 = labels
        .iter()
        .enumerate()
        .map(|(row, &label)| -probabilities[[row, label]].max(PROBABILITY_FLOOR).ln())
        .sum();
    total / labels.len().max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, aview1};

    fn separable() -> (Array2<f64>, Vec<usize>) {
        let matrix = Array2::from_shape_fn((20, 2), |(i, column)| match column {
            0 => i as f64,
            _ => (i % 3) as f64,
        });
        let labels: Vec<usize> = (0..20).map(|i| usize::from(i >= 10)).collect();
        (matrix, labels)
    }

    fn params(rounds: usize) -> BoosterParams {
        BoosterParams {
            max_depth: 3,
            learning_rate: 0.3,
            rounds,
            ..BoosterParams::default()
        }
    }

    #[test]
    fn binary_booster_learns_threshold() {
        let (matrix, labels) = separable();
        let booster = Booster::fit(matrix.view(), &labels, 2, &params(20)).expect("fit");
        assert_eq!(booster.objective(), ObjectiveKind::Binary);
        assert_eq!(booster.num_trees(), 20);
        assert_eq!(booster.predict_class(aview1(&[2.0, 0.0])).map(|p| p.0), Some(0));
        assert_eq!(booster.predict_class(aview1(&[17.0, 1.0])).map(|p| p.0), Some(1));
    }

    #[test]
    fn multiclass_booster_grows_one_tree_per_class_per_round() {
        let matrix = Array2::from_shape_fn((30, 1), |(i, _)| i as f64);
        let labels: Vec<usize> = (0..30).map(|i| i / 10).collect();
        let booster = Booster::fit(matrix.view(), &labels, 3, &params(10)).expect("fit");
        assert_eq!(booster.num_outputs(), 3);
        assert_eq!(booster.num_trees(), 30);
        let distribution = booster.predict_distribution(aview1(&[25.0])).expect("distribution");
        assert!((distribution.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert_eq!(booster.predict_class(aview1(&[25.0])).map(|p| p.0), Some(2));
        assert_eq!(booster.predict_class(aview1(&[5.0])).map(|p| p.0), Some(0));
    }

    #[test]
    fn expected_raw_score_is_training_mean() {
        let (matrix, labels) = separable();
        let booster = Booster::fit(matrix.view(), &labels, 2, &params(5)).expect("fit");
        let mean: f64 = matrix
            .rows()
            .into_iter()
            .map(|row| booster.raw_scores(row)[0])
            .sum::<f64>()
            / matrix.nrows() as f64;
        assert!((booster.expected_raw_score(0) - mean).abs() < 1e-9);
    }

    #[test]
    fn model_text_round_trips() {
        let (matrix, labels) = separable();
        let booster = Booster::fit(matrix.view(), &labels, 2, &params(4)).expect("fit");
        let mut text = String::new();
        booster.write_text(&mut text);
        let parsed = Booster::from_model_text(&text).expect("parse");
        assert_eq!(parsed, booster);
    }

    #[test]
    fn rejects_single_class() {
        let matrix = array![[1.0], [2.0]];
        let err = Booster::fit(matrix.view(), &[0, 0], 1, &params(2)).expect_err("one class");
        assert!(matches!(err, PipelineError::FitFailed(_)));
    }

    #[test]
    fn rejects_text_without_trees() {
        let text = "objective=binary\nnum_class=2\nnum_tree_per_iteration=1\nbase_score=0\n";
        let err = Booster::from_model_text(text).expect_err("no trees");
        assert!(matches!(err, PipelineError::ModelFormat(_)));
    }
}
