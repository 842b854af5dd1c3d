use crate::commands::InputArgs;
use crate::config::FeatureConfig;
use crate::dataset::load_records;
use crate::explainer::Explainer;
use crate::features::FeatureEngineer;
use crate::model::TrainedModel;
use crate::models::ExplanationRecord;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use ndarray::Axis;
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Serialize)]
struct ExplainedRow<'a> {
    entity: &'a str,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    explanation: ExplanationRecord,
}

/// Explains the `limit` most recent engineered rows, optionally for a single
/// entity, printing one JSON object per line.
pub fn run(
    mut features: FeatureConfig,
    input: &InputArgs,
    model_path: &Path,
    entity: Option<&str>,
    limit: usize,
) -> Result<()> {
    input.apply(&mut features)?;

    let model_text = fs::read_to_string(model_path)
        .with_context(|| format!("Failed to read {}", model_path.display()))?;
    let model = TrainedModel::from_model_text(&model_text)
        .with_context(|| format!("Failed to parse {}", model_path.display()))?;
    info!(
        "Loaded model {} over {} features",
        model.id(),
        model.feature_set().len()
    );

    let table = load_records(&input.input, &input.schema())
        .with_context(|| format!("Failed to load {}", input.input.display()))?;
    let frame = FeatureEngineer::new(features).transform(&table)?;

    let mut selected: Vec<usize> = (0..frame.len())
        .filter(|&idx| entity.map_or(true, |name| frame.rows[idx].entity == name))
        .collect();
    if selected.is_empty() {
        return Err(anyhow!(
            "no engineered rows to explain{}",
            entity.map(|name| format!(" for {}", name)).unwrap_or_default()
        ));
    }
    selected.sort_by_key(|&idx| frame.rows[idx].timestamp);
    let keep_from = selected.len().saturating_sub(limit.max(1));
    let selected = &selected[keep_from..];

    let matrix = frame.project(model.feature_set())?;
    let rows = matrix.select(Axis(0), selected);
    let explanations = Explainer::new().explain_batch(&model, rows.view())?;

    for (&idx, explanation) in selected.iter().zip(explanations) {
        let row = &frame.rows[idx];
        let payload = serde_json::to_string(&ExplainedRow {
            entity: &row.entity,
            timestamp: row.timestamp,
            explanation,
        })?;
        println!("{payload}");
    }

    Ok(())
}
