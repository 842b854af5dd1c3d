use crate::booster::Booster;
use crate::error::{PipelineError, Result};
use crate::models::{
    FeatureFrame, FeatureSet, Hyperparameters, LabelEncoder, ModelConfiguration, PredictedRow,
};
use crate::tree::parse_value;
use ndarray::{ArrayView1, Axis};
use std::fmt::Write as _;
use std::sync::Arc;
use uuid::Uuid;

const FORMAT_MARKER: &str = "outcome_engine_model=v2";

/// Result of the Predict operation for one feature vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class: usize,
    pub label: String,
    pub probability: f64,
    pub distribution: Vec<f64>,
}

/// A fitted ensemble bound to the features and configuration it was trained
/// with. The id changes whenever a new model is fitted and is preserved
/// through persistence.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    id: Uuid,
    feature_set: FeatureSet,
    encoder: LabelEncoder,
    configuration: ModelConfiguration,
    booster: Arc<Booster>,
}

impl TrainedModel {
    pub fn new(
        feature_set: FeatureSet,
        encoder: LabelEncoder,
        configuration: ModelConfiguration,
        booster: Booster,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            feature_set,
            encoder,
            configuration,
            booster: Arc::new(booster),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn feature_set(&self) -> &FeatureSet {
        &self.feature_set
    }

    pub fn class_labels(&self) -> &[String] {
        self.encoder.labels()
    }

    pub fn encoder(&self) -> &LabelEncoder {
        &self.encoder
    }

    pub fn configuration(&self) -> &ModelConfiguration {
        &self.configuration
    }

    pub fn booster(&self) -> &Booster {
        &self.booster
    }

    pub(crate) fn booster_handle(&self) -> Arc<Booster> {
        Arc::clone(&self.booster)
    }

    pub fn predict(&self, features: &[f64]) -> Result<Prediction> {
        self.predict_row(ArrayView1::from(features))
    }

    pub fn predict_row(&self, features: ArrayView1<'_, f64>) -> Result<Prediction> {
        self.check_width(features.len())?;
        let distribution = self.booster.predict_distribution(features).ok_or_else(|| {
            PipelineError::FitFailed("model produced non-finite probabilities".to_string())
        })?;
        let class = crate::metrics::argmax(&distribution);
        let label = self.encoder.decode(class).unwrap_or_default().to_string();
        Ok(Prediction {
            class,
            label,
            probability: distribution[class],
            distribution,
        })
    }

    /// Appends a predicted outcome to every row of `frame`.
    pub fn predict_frame(&self, frame: &FeatureFrame) -> Result<Vec<PredictedRow>> {
        let matrix = frame.project(&self.feature_set)?;
        frame
            .rows
            .iter()
            .zip(matrix.axis_iter(Axis(0)))
            .map(|(row, features)| {
                let prediction = self.predict_row(features)?;
                Ok(PredictedRow {
                    entity: row.entity.clone(),
                    timestamp: row.timestamp,
                    outcome: row.outcome.clone(),
                    predicted_outcome: prediction.label,
                    probability: prediction.probability,
                })
            })
            .collect()
    }

    pub(crate) fn check_width(&self, width: usize) -> Result<()> {
        if width != self.feature_set.len() {
            return Err(PipelineError::FeatureDeficiency(format!(
                "model expects {} features, got {}",
                self.feature_set.len(),
                width
            )));
        }
        Ok(())
    }

    /// Names are written as JSON string arrays so any column or outcome
    /// label survives the round trip.
    pub fn to_model_text(&self) -> Result<String> {
        let feature_names = serde_json::to_string(self.feature_set.names())
            .map_err(|err| PipelineError::ModelFormat(err.to_string()))?;
        let class_labels = serde_json::to_string(self.encoder.labels())
            .map_err(|err| PipelineError::ModelFormat(err.to_string()))?;

        let mut out = String::new();
        let _ = writeln!(out, "{}", FORMAT_MARKER);
        let _ = writeln!(out, "model_id={}", self.id);
        let _ = writeln!(out, "feature_names={}", feature_names);
        let _ = writeln!(out, "class_labels={}", class_labels);
        let _ = writeln!(out, "max_depth={}", self.configuration.hyperparameters.max_depth);
        let _ = writeln!(
            out,
            "learning_rate={}",
            self.configuration.hyperparameters.learning_rate
        );
        let _ = writeln!(out, "cv_score={}", self.configuration.cv_score);
        let _ = writeln!(out, "search_iteration={}", self.configuration.iteration);
        let _ = writeln!(out, "folds_completed={}", self.configuration.folds_completed);
        self.booster.write_text(&mut out);
        Ok(out)
    }

    pub fn from_model_text(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim);
        if lines.next() != Some(FORMAT_MARKER) {
            return Err(PipelineError::ModelFormat(format!(
                "missing {} header",
                FORMAT_MARKER
            )));
        }

        let mut id: Option<Uuid> = None;
        let mut feature_names: Option<Vec<String>> = None;
        let mut class_labels: Option<Vec<String>> = None;
        let mut max_depth: usize = 0;
        let mut learning_rate: f64 = 0.0;
        let mut cv_score: f64 = f64::NAN;
        let mut iteration: usize = 0;
        let mut folds_completed: usize = 0;

        for line in lines.take_while(|line| !line.starts_with("Tree=")) {
            if let Some(raw) = line.strip_prefix("model_id=") {
                id = Some(Uuid::parse_str(raw.trim()).map_err(|err| {
                    PipelineError::ModelFormat(format!("invalid model id {}: {}", raw, err))
                })?);
            } else if let Some(raw) = line.strip_prefix("feature_names=") {
                feature_names = Some(parse_names(raw, "feature_names")?);
            } else if let Some(raw) = line.strip_prefix("class_labels=") {
                class_labels = Some(parse_names(raw, "class_labels")?);
            } else if line.starts_with("max_depth=") {
                max_depth = parse_value(line, "max_depth=")?;
            } else if line.starts_with("learning_rate=") {
                learning_rate = parse_value(line, "learning_rate=")?;
            } else if line.starts_with("cv_score=") {
                cv_score = parse_value(line, "cv_score=")?;
            } else if line.starts_with("search_iteration=") {
                iteration = parse_value(line, "search_iteration=")?;
            } else if line.starts_with("folds_completed=") {
                folds_completed = parse_value(line, "folds_completed=")?;
            }
        }

        let id = id.ok_or_else(|| PipelineError::ModelFormat("missing model_id".to_string()))?;
        let feature_names = feature_names
            .ok_or_else(|| PipelineError::ModelFormat("missing feature_names".to_string()))?;
        let class_labels = class_labels
            .ok_or_else(|| PipelineError::ModelFormat("missing class_labels".to_string()))?;

        let booster = Booster::from_model_text(text)?;
        if booster.num_features() != feature_names.len() {
            return Err(PipelineError::ModelFormat(format!(
                "{} feature names for a model over {} features",
                feature_names.len(),
                booster.num_features()
            )));
        }
        if booster.num_classes() != class_labels.len() {
            return Err(PipelineError::ModelFormat(format!(
                "{} class labels for a model over {} classes",
                class_labels.len(),
                booster.num_classes()
            )));
        }

        Ok(Self {
            id,
            feature_set: FeatureSet::new(feature_names),
            encoder: LabelEncoder::from_labels(class_labels),
            configuration: ModelConfiguration {
                iteration,
                hyperparameters: Hyperparameters {
                    max_depth,
                    learning_rate,
                },
                cv_score,
                folds_completed,
            },
            booster: Arc::new(booster),
        })
    }
}

fn parse_names(raw: &str, key: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw)
        .map_err(|err| PipelineError::ModelFormat(format!("invalid {}: {}", key, err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booster::BoosterParams;
    use ndarray::Array2;

    fn fitted_model() -> TrainedModel {
        let matrix = Array2::from_shape_fn((20, 2), |(i, column)| match column {
            0 => i as f64,
            _ => (i % 4) as f64,
        });
        let labels: Vec<usize> = (0..20).map(|i| usize::from(i >= 10)).collect();
        let booster = Booster::fit(
            matrix.view(),
            &labels,
            2,
            &BoosterParams {
                max_depth: 3,
                learning_rate: 0.2,
                rounds: 8,
                ..BoosterParams::default()
            },
        )
        .expect("fit");
        TrainedModel::new(
            FeatureSet::new(vec!["goals_rolling_mean_5".into(), "goals".into()]),
            LabelEncoder::from_labels(vec!["loss".into(), "win".into()]),
            ModelConfiguration {
                iteration: 4,
                hyperparameters: Hyperparameters {
                    max_depth: 3,
                    learning_rate: 0.2,
                },
                cv_score: 0.9,
                folds_completed: 3,
            },
            booster,
        )
    }

    #[test]
    fn predict_returns_label_and_probability() {
        let model = fitted_model();
        let prediction = model.predict(&[18.0, 1.0]).expect("predict");
        assert_eq!(prediction.label, "win");
        assert!(prediction.probability > 0.5);
        let err = model.predict(&[1.0]).expect_err("narrow row");
        assert!(matches!(err, PipelineError::FeatureDeficiency(_)));
    }

    #[test]
    fn model_text_preserves_identity_and_predictions() {
        let model = fitted_model();
        let text = model.to_model_text().expect("serialise");
        let restored = TrainedModel::from_model_text(&text).expect("parse");

        assert_eq!(restored.id(), model.id());
        assert_eq!(restored.feature_set(), model.feature_set());
        assert_eq!(restored.class_labels(), model.class_labels());
        assert_eq!(restored.configuration(), model.configuration());
        assert_eq!(restored.booster(), model.booster());
        for x in [0.0, 9.0, 10.0, 19.0] {
            assert_eq!(
                restored.predict(&[x, 2.0]).expect("restored"),
                model.predict(&[x, 2.0]).expect("original")
            );
        }
    }

    #[test]
    fn names_with_spaces_round_trip() {
        let mut model = fitted_model();
        model.feature_set = FeatureSet::new(vec!["Goal Diff".into(), "shots on \"target\"".into()]);
        model.encoder = LabelEncoder::from_labels(vec!["Away Win".into(), "Home Win".into()]);
        let text = model.to_model_text().expect("serialise");
        let restored = TrainedModel::from_model_text(&text).expect("parse");

        assert_eq!(restored.feature_set(), model.feature_set());
        assert_eq!(restored.class_labels(), &["Away Win", "Home Win"]);
        let prediction = restored.predict(&[18.0, 1.0]).expect("predict");
        assert_eq!(prediction.label, "Home Win");
    }

    #[test]
    fn rejects_malformed_name_list() {
        let text = fitted_model()
            .to_model_text()
            .expect("serialise")
            .replace("feature_names=[", "feature_names=");
        let err = TrainedModel::from_model_text(&text).expect_err("malformed names");
        assert!(matches!(err, PipelineError::ModelFormat(_)));
    }

    #[test]
    fn rejects_foreign_text() {
        let err = TrainedModel::from_model_text("tree\nversion=v3\n").expect_err("foreign");
        assert!(matches!(err, PipelineError::ModelFormat(_)));
    }
}
