use outcome_engine::booster::{Booster, BoosterParams};
use outcome_engine::explainer::Explainer;
use outcome_engine::model::TrainedModel;
use outcome_engine::models::{FeatureSet, Hyperparameters, LabelEncoder, ModelConfiguration};
use outcome_engine::PipelineError;
use ndarray::{s, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;

fn configuration(max_depth: usize, learning_rate: f64) -> ModelConfiguration {
    ModelConfiguration {
        iteration: 0,
        hyperparameters: Hyperparameters {
            max_depth,
            learning_rate,
        },
        cv_score: 0.8,
        folds_completed: 3,
    }
}

fn sample_rows(count: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((count, 3), |(_, column)| match column {
        2 => rng.gen_range(-1.0..1.0),
        _ => rng.gen_range(0.0..4.0),
    })
}

fn binary_model() -> (TrainedModel, Array2<f64>) {
    let rows = sample_rows(200, 11);
    let labels: Vec<usize> = rows
        .rows()
        .into_iter()
        .map(|row| usize::from(row[0] + 0.5 * row[1] > 3.0))
        .collect();
    let booster = Booster::fit(
        rows.view(),
        &labels,
        2,
        &BoosterParams {
            max_depth: 4,
            learning_rate: 0.2,
            rounds: 25,
            ..BoosterParams::default()
        },
    )
    .expect("fit binary");
    let model = TrainedModel::new(
        FeatureSet::new(vec![
            "goals_rolling_mean_5".to_string(),
            "shots".to_string(),
            "noise".to_string(),
        ]),
        LabelEncoder::from_labels(vec!["L".to_string(), "W".to_string()]),
        configuration(4, 0.2),
        booster,
    );
    (model, rows)
}

fn multiclass_model() -> (TrainedModel, Array2<f64>) {
    let rows = sample_rows(240, 23);
    let labels: Vec<usize> = rows
        .rows()
        .into_iter()
        .map(|row| {
            let margin = row[0] - row[1];
            if margin > 1.0 {
                2
            } else if margin < -1.0 {
                0
            } else {
                1
            }
        })
        .collect();
    let booster = Booster::fit(
        rows.view(),
        &labels,
        3,
        &BoosterParams {
            max_depth: 3,
            learning_rate: 0.3,
            rounds: 15,
            ..BoosterParams::default()
        },
    )
    .expect("fit multiclass");
    let model = TrainedModel::new(
        FeatureSet::new(vec![
            "goals".to_string(),
            "conceded".to_string(),
            "noise".to_string(),
        ]),
        LabelEncoder::from_labels(vec!["D".to_string(), "L".to_string(), "W".to_string()]),
        configuration(3, 0.3),
        booster,
    );
    (model, rows)
}

#[test]
fn binary_explanations_are_additive() {
    let (model, rows) = binary_model();
    let explainer = Explainer::new();
    let explanations = explainer
        .explain_batch(&model, rows.slice(s![..40, ..]))
        .expect("explain");

    assert_eq!(explanations.len(), 40);
    for (row, explanation) in rows.rows().into_iter().zip(&explanations) {
        assert!(explanation.additivity_gap() < 1e-4, "gap {}", explanation.additivity_gap());
        assert_eq!(explanation.feature_importance.len(), 3);
        let prediction = model.predict_row(row).expect("predict");
        assert_eq!(explanation.predicted_label, prediction.label);
        assert_eq!(explanation.probability, prediction.probability);
    }

    // The informative feature should carry more attribution than noise.
    let mean_abs = |name: &str| {
        explanations
            .iter()
            .map(|e| e.feature_importance[name].abs())
            .sum::<f64>()
            / explanations.len() as f64
    };
    assert!(mean_abs("goals_rolling_mean_5") > mean_abs("noise"));
}

#[test]
fn multiclass_explanations_are_additive() {
    let (model, rows) = multiclass_model();
    let explainer = Explainer::new();
    for row in rows.rows().into_iter().take(30) {
        let explanation = explainer.explain(&model, &row.to_vec()).expect("explain");
        assert!(explanation.additivity_gap() < 1e-4, "gap {}", explanation.additivity_gap());
    }
}

#[test]
fn re_explaining_is_idempotent() {
    let (model, rows) = binary_model();
    let explainer = Explainer::new();
    let row = rows.row(3).to_vec();
    let first = explainer.explain(&model, &row).expect("first");
    let second = explainer.explain(&model, &row).expect("second");
    assert_eq!(first, second);
}

#[test]
fn cache_follows_the_supplied_model() {
    let (first_model, rows) = binary_model();
    let (second_model, _) = binary_model();
    let row = rows.row(0).to_vec();
    let explainer = Explainer::new();
    assert_eq!(explainer.cached_model_id(), None);

    explainer.explain(&first_model, &row).expect("first model");
    assert_eq!(explainer.cached_model_id(), Some(first_model.id()));

    explainer.explain(&second_model, &row).expect("second model");
    assert_eq!(explainer.cached_model_id(), Some(second_model.id()));
}

#[test]
fn persisted_model_explains_identically() {
    let (model, rows) = binary_model();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("outcome_model.txt");
    fs::write(&path, model.to_model_text().expect("serialise")).expect("write");

    let restored =
        TrainedModel::from_model_text(&fs::read_to_string(&path).expect("read")).expect("parse");
    let row = rows.row(7).to_vec();
    let explainer = Explainer::new();
    let original = explainer.explain(&model, &row).expect("original");
    let reloaded = explainer.explain(&restored, &row).expect("restored");
    assert_eq!(original, reloaded);
}

#[test]
fn model_without_node_counts_cannot_be_explained() {
    let (model, rows) = binary_model();
    let stripped: String = model
        .to_model_text()
        .expect("serialise")
        .lines()
        .filter(|line| !line.starts_with("leaf_count=") && !line.starts_with("internal_count="))
        .map(|line| format!("{line}\n"))
        .collect();
    let restored = TrainedModel::from_model_text(&stripped).expect("parse without counts");
    let row = rows.row(0).to_vec();
    assert_eq!(
        restored.predict(&row).expect("predict"),
        model.predict(&row).expect("predict")
    );

    let err = Explainer::new()
        .explain(&restored, &row)
        .expect_err("no counts");
    assert!(matches!(err, PipelineError::ExplanationUnavailable(_)));
}

#[test]
fn wrong_width_row_is_rejected() {
    let (model, _) = binary_model();
    let err = Explainer::new()
        .explain(&model, &[1.0, 2.0])
        .expect_err("narrow row");
    assert!(matches!(err, PipelineError::FeatureDeficiency(_)));
}
