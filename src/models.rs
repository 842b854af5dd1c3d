use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One observation for an entity at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub entity: String,
    pub timestamp: DateTime<Utc>,
    /// Statistic values aligned with `RecordTable::columns`. NaN marks a
    /// missing cell.
    pub values: Vec<f64>,
    pub outcome: String,
}

/// Input table: named statistic columns plus the records that fill them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordTable {
    pub columns: Vec<String>,
    pub records: Vec<Record>,
}

impl RecordTable {
    pub fn new(columns: Vec<String>, records: Vec<Record>) -> Result<Self> {
        for (index, record) in records.iter().enumerate() {
            if record.values.len() != columns.len() {
                return Err(PipelineError::DataUnavailable(format!(
                    "record {} for {} has {} values, expected {}",
                    index,
                    record.entity,
                    record.values.len(),
                    columns.len()
                )));
            }
        }
        Ok(Self { columns, records })
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }
}

/// A record after feature engineering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureRow {
    pub entity: String,
    pub timestamp: DateTime<Utc>,
    /// Position of the originating record in the input table.
    pub source_index: usize,
    pub values: Vec<f64>,
    pub outcome: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureFrame {
    pub columns: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

impl FeatureFrame {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Rows by columns; a row narrower than `columns` reads NaN past its end.
    pub fn matrix(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.rows.len(), self.columns.len()), |(row, column)| {
            self.rows[row].values.get(column).copied().unwrap_or(f64::NAN)
        })
    }

    pub fn outcomes(&self) -> Vec<String> {
        self.rows.iter().map(|row| row.outcome.clone()).collect()
    }

    /// Projects every row onto `feature_set`, in feature-set order.
    pub fn project(&self, feature_set: &FeatureSet) -> Result<Array2<f64>> {
        let indices = feature_set
            .names()
            .iter()
            .map(|name| {
                self.column_index(name).ok_or_else(|| {
                    PipelineError::FeatureDeficiency(format!(
                        "feature {} is not present in the engineered frame",
                        name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Array2::from_shape_fn(
            (self.rows.len(), indices.len()),
            |(row, column)| {
                self.rows[row]
                    .values
                    .get(indices[column])
                    .copied()
                    .unwrap_or(f64::NAN)
            },
        ))
    }
}

/// Ordered feature names chosen by the selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet(Vec<String>);

impl FeatureSet {
    pub fn new(names: Vec<String>) -> Self {
        Self(names)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub max_depth: usize,
    pub learning_rate: f64,
}

/// A searched point and its cross-validated score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfiguration {
    pub iteration: usize,
    pub hyperparameters: Hyperparameters,
    pub cv_score: f64,
    pub folds_completed: usize,
}

/// Additive attribution for one prediction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplanationRecord {
    pub feature_importance: BTreeMap<String, f64>,
    pub base_value: f64,
    pub prediction: f64,
    pub predicted_label: String,
    pub probability: f64,
}

impl ExplanationRecord {
    pub fn additivity_gap(&self) -> f64 {
        let total: f64 = self.feature_importance.values().sum();
        (total + self.base_value - self.prediction).abs()
    }
}

/// A feature row with the model's prediction appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictedRow {
    pub entity: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: String,
    pub predicted_outcome: String,
    pub probability: f64,
}

/// Maps outcome labels to dense class indices in lexical order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoder {
    labels: Vec<String>,
}

impl LabelEncoder {
    pub fn fit<S: AsRef<str>>(outcomes: &[S]) -> Result<Self> {
        let mut labels: Vec<String> = outcomes.iter().map(|s| s.as_ref().to_string()).collect();
        labels.sort();
        labels.dedup();
        if labels.len() < 2 {
            return Err(PipelineError::TrainingDataInsufficient(format!(
                "need at least two distinct outcomes, found {}",
                labels.len()
            )));
        }
        Ok(Self { labels })
    }

    pub fn from_labels(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn encode(&self, label: &str) -> Option<usize> {
        self.labels.binary_search_by(|probe| probe.as_str().cmp(label)).ok()
    }

    pub fn encode_all<S: AsRef<str>>(&self, outcomes: &[S]) -> Result<Vec<usize>> {
        outcomes
            .iter()
            .map(|label| {
                self.encode(label.as_ref()).ok_or_else(|| {
                    PipelineError::TrainingDataInsufficient(format!(
                        "outcome {} was not seen when the encoder was fitted",
                        label.as_ref()
                    ))
                })
            })
            .collect()
    }

    pub fn decode(&self, class: usize) -> Option<&str> {
        self.labels.get(class).map(String::as_str)
    }
}
