//! Additive per-feature attributions for boosted tree ensembles.
//!
//! Uses path-dependent TreeSHAP: every tree's contribution is split across
//! the features on each root-to-leaf path, with unseen branches weighted by
//! the training row counts stored in the tree. Attributions for a row plus
//! the ensemble's mean training score reproduce the row's raw score.

use crate::booster::{Booster, ObjectiveKind};
use crate::error::{PipelineError, Result};
use crate::model::TrainedModel;
use crate::models::{ExplanationRecord, FeatureFrame};
use crate::tree::{NodeRef, Tree};
use log::debug;
use ndarray::{Array1, ArrayView1, ArrayView2};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct PathElement {
    feature: Option<usize>,
    zero_fraction: f64,
    one_fraction: f64,
    pweight: f64,
}

/// Per-model state derived once and reused for every row.
struct Prepared {
    model_id: Uuid,
    booster: Arc<Booster>,
    base_values: Vec<f64>,
}

/// Explains predictions of a [`TrainedModel`], caching the derived state of
/// the last model it saw.
#[derive(Default)]
pub struct Explainer {
    cache: Mutex<Option<Arc<Prepared>>>,
}

impl Explainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the model whose state is cached, if any.
    pub fn cached_model_id(&self) -> Option<Uuid> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|prepared| prepared.model_id)
    }

    pub fn explain(&self, model: &TrainedModel, features: &[f64]) -> Result<ExplanationRecord> {
        let prepared = self.prepare(model)?;
        explain_row(&prepared, model, ArrayView1::from(features))
    }

    /// Explains each row of `rows` in parallel, in row order.
    pub fn explain_batch(
        &self,
        model: &TrainedModel,
        rows: ArrayView2<'_, f64>,
    ) -> Result<Vec<ExplanationRecord>> {
        let prepared = self.prepare(model)?;
        (0..rows.nrows())
            .into_par_iter()
            .map(|row| explain_row(&prepared, model, rows.row(row)))
            .collect()
    }

    /// Explains every row of an engineered frame.
    pub fn explain_frame(&self, model: &TrainedModel, frame: &FeatureFrame) -> Result<Vec<ExplanationRecord>> {
        let rows = frame.project(model.feature_set())?;
        self.explain_batch(model, rows.view())
    }

    fn prepare(&self, model: &TrainedModel) -> Result<Arc<Prepared>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(prepared) = cache.as_ref() {
            if prepared.model_id == model.id() {
                return Ok(Arc::clone(prepared));
            }
        }

        let booster = model.booster_handle();
        if !booster.supports_attribution() {
            return Err(PipelineError::ExplanationUnavailable(format!(
                "model {} has trees without node counts",
                model.id()
            )));
        }
        let base_values = (0..booster.num_outputs())
            .map(|output| booster.expected_raw_score(output))
            .collect();
        debug!(
            "Prepared explainer for model {} ({} trees)",
            model.id(),
            booster.num_trees()
        );

        let prepared = Arc::new(Prepared {
            model_id: model.id(),
            booster,
            base_values,
        });
        *cache = Some(Arc::clone(&prepared));
        Ok(prepared)
    }
}

fn explain_row(
    prepared: &Prepared,
    model: &TrainedModel,
    features: ArrayView1<'_, f64>,
) -> Result<ExplanationRecord> {
    let prediction = model.predict_row(features)?;
    let booster = &prepared.booster;
    let output = match booster.objective() {
        ObjectiveKind::Binary => 0,
        ObjectiveKind::Multiclass => prediction.class,
    };

    let mut phi = Array1::<f64>::zeros(booster.num_features());
    for tree in booster.trees_for_output(output) {
        tree_shap(tree, features, &mut phi);
    }

    let feature_importance: BTreeMap<String, f64> = model
        .feature_set()
        .names()
        .iter()
        .cloned()
        .zip(phi.iter().copied())
        .collect();

    Ok(ExplanationRecord {
        feature_importance,
        base_value: prepared.base_values[output],
        prediction: booster.raw_scores(features)[output],
        predicted_label: prediction.label,
        probability: prediction.probability,
    })
}

fn tree_shap(tree: &Tree, features: ArrayView1<'_, f64>, phi: &mut Array1<f64>) {
    recurse(tree, features, phi, tree.root(), Vec::new(), 1.0, 1.0, None);
}

#[allow(clippy::too_many_arguments)]
fn recurse(
    tree: &Tree,
    features: ArrayView1<'_, f64>,
    phi: &mut Array1<f64>,
    node: NodeRef,
    mut path: Vec<PathElement>,
    zero_fraction: f64,
    one_fraction: f64,
    feature: Option<usize>,
) {
    extend_path(&mut path, zero_fraction, one_fraction, feature);

    let index = match node {
        NodeRef::Leaf(leaf) => {
            let unique_depth = path.len() - 1;
            let value = tree.leaf_output(leaf);
            for i in 1..=unique_depth {
                let weight = unwound_path_sum(&path, unique_depth, i);
                let element = path[i];
                if let Some(feature) = element.feature {
                    phi[feature] += weight * (element.one_fraction - element.zero_fraction) * value;
                }
            }
            return;
        }
        NodeRef::Internal(index) => index,
    };

    let split = tree.split_features[index];
    let left = NodeRef::decode(tree.left_child[index]);
    let right = NodeRef::decode(tree.right_child[index]);
    let (hot, cold) = if features.get(split).copied().unwrap_or(0.0) <= tree.thresholds[index] {
        (left, right)
    } else {
        (right, left)
    };

    let cover = tree.node_count(node);
    let hot_zero = tree.node_count(hot) / cover;
    let cold_zero = tree.node_count(cold) / cover;

    let mut incoming_zero = 1.0;
    let mut incoming_one = 1.0;
    if let Some(previous) = (1..path.len()).find(|&i| path[i].feature == Some(split)) {
        incoming_zero = path[previous].zero_fraction;
        incoming_one = path[previous].one_fraction;
        let unique_depth = path.len() - 1;
        unwind_path(&mut path, unique_depth, previous);
        path.truncate(unique_depth);
    }

    recurse(
        tree,
        features,
        phi,
        hot,
        path.clone(),
        hot_zero * incoming_zero,
        incoming_one,
        Some(split),
    );
    recurse(
        tree,
        features,
        phi,
        cold,
        path,
        cold_zero * incoming_zero,
        0.0,
        Some(split),
    );
}

fn extend_path(path: &mut Vec<PathElement>, zero_fraction: f64, one_fraction: f64, feature: Option<usize>) {
    let depth = path.len();
    path.push(PathElement {
        feature,
        zero_fraction,
        one_fraction,
        pweight: if depth == 0 { 1.0 } else { 0.0 },
    });
    for i in (0..depth).rev() {
        path[i + 1].pweight += one_fraction * path[i].pweight * (i + 1) as f64 / (depth + 1) as f64;
        path[i].pweight = zero_fraction * path[i].pweight * (depth - i) as f64 / (depth + 1) as f64;
    }
}

fn unwind_path(path: &mut [PathElement], unique_depth: usize, path_index: usize) {
    let one_fraction = path[path_index].one_fraction;
    let zero_fraction = path[path_index].zero_fraction;
    let mut next_one_portion = path[unique_depth].pweight;

    for i in (0..unique_depth).rev() {
        if one_fraction != 0.0 {
            let tmp = path[i].pweight;
            path[i].pweight =
                next_one_portion * (unique_depth + 1) as f64 / ((i + 1) as f64 * one_fraction);
            next_one_portion = tmp
                - path[i].pweight * zero_fraction * (unique_depth - i) as f64
                    / (unique_depth + 1) as f64;
        } else {
            path[i].pweight = path[i].pweight * (unique_depth + 1) as f64
                / (zero_fraction * (unique_depth - i) as f64);
        }
    }

    for i in path_index..unique_depth {
        path[i].feature = path[i + 1].feature;
        path[i].zero_fraction = path[i + 1].zero_fraction;
        path[i].one_fraction = path[i + 1].one_fraction;
    }
}

fn unwound_path_sum(path: &[PathElement], unique_depth: usize, path_index: usize) -> f64 {
    let one_fraction = path[path_index].one_fraction;
    let zero_fraction = path[path_index].zero_fraction;
    let mut next_one_portion = path[unique_depth].pweight;
    let mut total = 0.0;

    for i in (0..unique_depth).rev() {
        if one_fraction != 0.0 {
            let tmp = next_one_portion * (unique_depth + 1) as f64 / ((i + 1) as f64 * one_fraction);
            total += tmp;
            next_one_portion = path[i].pweight
                - tmp * zero_fraction * (unique_depth - i) as f64 / (unique_depth + 1) as f64;
        } else if zero_fraction != 0.0 {
            total += path[i].pweight / zero_fraction
                / ((unique_depth - i) as f64 / (unique_depth + 1) as f64);
        }
    }
    total
}
