use crate::error::{PipelineError, Result};
use crate::forest::{ForestParams, ImportanceForest};
use crate::models::{FeatureFrame, FeatureSet};
use crate::scaling::StandardScaler;
use log::{debug, info};
use ndarray::Axis;

/// Recursive feature elimination driven by forest importances.
pub struct FeatureSelector {
    target: usize,
    forest: ForestParams,
}

impl FeatureSelector {
    pub fn new(target: usize, forest: ForestParams) -> Self {
        Self { target, forest }
    }

    /// Returns `min(target, columns)` feature names in their original column
    /// order. One feature is eliminated per refit; among equally unimportant
    /// features the one appearing last is dropped first.
    pub fn select(&self, frame: &FeatureFrame, labels: &[usize], n_classes: usize) -> Result<FeatureSet> {
        if frame.columns.is_empty() {
            return Err(PipelineError::FeatureDeficiency(
                "no numeric feature columns to select from".to_string(),
            ));
        }
        if frame.is_empty() {
            return Err(PipelineError::FeatureDeficiency(
                "no complete feature rows remain after engineering".to_string(),
            ));
        }
        if labels.len() != frame.len() {
            return Err(PipelineError::FeatureDeficiency(format!(
                "{} labels supplied for {} feature rows",
                labels.len(),
                frame.len()
            )));
        }

        let scaled = StandardScaler::fit_transform(frame.matrix().view());
        let mut remaining: Vec<usize> = (0..frame.columns.len()).collect();

        while remaining.len() > self.target {
            let subset = scaled.select(Axis(1), &remaining);
            let forest = ImportanceForest::fit(subset.view(), labels, n_classes, &self.forest);

            let mut weakest = 0;
            for (position, importance) in forest.importances().iter().enumerate() {
                if *importance <= forest.importances()[weakest] {
                    weakest = position;
                }
            }
            let dropped = remaining.remove(weakest);
            debug!(
                "Eliminated feature {} (importance {:.6}), {} remain",
                frame.columns[dropped],
                forest.importances()[weakest],
                remaining.len()
            );
        }

        let names: Vec<String> = remaining
            .iter()
            .map(|&column| frame.columns[column].clone())
            .collect();
        info!("Selected {} features: {}", names.len(), names.join(", "));
        Ok(FeatureSet::new(names))
    }
}
