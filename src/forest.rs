use crate::cart::{grow, GiniObjective, TreeParams};
use ndarray::{Array1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForestParams {
    pub n_trees: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

/// Bagged Gini trees kept only for their impurity-based importances.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportanceForest {
    importances: Array1<f64>,
}

impl ImportanceForest {
    /// Fits `n_trees` trees on bootstrap samples with `sqrt(p)` candidate
    /// features per split. Tree `i` draws from a generator seeded with
    /// `seed + i`, so the result does not depend on thread scheduling.
    pub fn fit(matrix: ArrayView2<'_, f64>, labels: &[usize], n_classes: usize, params: &ForestParams) -> Self {
        let (n_rows, n_features) = matrix.dim();
        if n_rows == 0 || n_features == 0 || params.n_trees == 0 {
            return Self {
                importances: Array1::zeros(n_features),
            };
        }

        let tree_params = TreeParams {
            max_depth: usize::MAX,
            min_samples_leaf: params.min_samples_leaf,
            max_features: Some(((n_features as f64).sqrt() as usize).max(1)),
            min_gain: 1e-12,
        };
        let objective = GiniObjective::new(labels, n_classes);

        let per_tree: Vec<Array1<f64>> = (0..params.n_trees)
            .into_par_iter()
            .map(|tree_index| {
                let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(tree_index as u64));
                let rows: Vec<usize> = (0..n_rows).map(|_| rng.gen_range(0..n_rows)).collect();
                let grown = grow(&objective, matrix, &rows, n_features, &tree_params, &mut rng);
                normalise(Array1::from(grown.importances))
            })
            .collect();

        let n_trees = per_tree.len() as f64;
        let importances = per_tree
            .iter()
            .fold(Array1::<f64>::zeros(n_features), |total, tree_importances| total + tree_importances)
            / n_trees;

        Self { importances }
    }

    pub fn importances(&self) -> &Array1<f64> {
        &self.importances
    }
}

fn normalise(importances: Array1<f64>) -> Array1<f64> {
    let total = importances.sum();
    if total > 0.0 {
        importances / total
    } else {
        importances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn informative_matrix() -> (Array2<f64>, Vec<usize>) {
        let labels: Vec<usize> = (0..40).map(|i| i % 2).collect();
        let matrix = Array2::from_shape_fn((40, 2), |(i, column)| match column {
            0 => ((i * 7) % 5) as f64,
            _ => labels[i] as f64 * 10.0 + (i % 3) as f64,
        });
        (matrix, labels)
    }

    #[test]
    fn informative_feature_dominates() {
        let (matrix, labels) = informative_matrix();
        let params = ForestParams {
            n_trees: 25,
            min_samples_leaf: 1,
            seed: 11,
        };
        let forest = ImportanceForest::fit(matrix.view(), &labels, 2, &params);
        let importances = forest.importances();
        assert!(importances[1] > importances[0]);
        assert!(importances.sum() <= 1.0 + 1e-9);
    }

    #[test]
    fn same_seed_gives_same_importances() {
        let (matrix, labels) = informative_matrix();
        let params = ForestParams {
            n_trees: 10,
            min_samples_leaf: 1,
            seed: 3,
        };
        let first = ImportanceForest::fit(matrix.view(), &labels, 2, &params);
        let second = ImportanceForest::fit(matrix.view(), &labels, 2, &params);
        assert_eq!(first, second);
    }
}
