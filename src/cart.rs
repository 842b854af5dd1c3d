//! Greedy depth-first tree grower shared by the importance forest and the
//! boosted ensemble. The split criterion is supplied by a [`SplitObjective`].

use crate::tree::{NodeRef, Tree};
use ndarray::ArrayView2;
use rand::seq::index::sample;
use rand::Rng;
use rayon::prelude::*;
use std::cmp::Ordering;

/// Node-level sufficient statistics and the score a split tries to raise.
///
/// The gain of a split is `score(left) + score(right) - score(parent)`.
pub trait SplitObjective: Sync {
    type Stats: Clone + Send + Sync;

    fn empty(&self) -> Self::Stats;
    fn add_row(&self, stats: &mut Self::Stats, row: usize);
    fn subtract(&self, total: &Self::Stats, part: &Self::Stats) -> Self::Stats;
    fn score(&self, stats: &Self::Stats) -> f64;
    fn leaf_value(&self, stats: &Self::Stats) -> f64;
}

/// Class-count statistics; the score is the Gini impurity decrease scaled by
/// node size.
pub struct GiniObjective<'a> {
    labels: &'a [usize],
    n_classes: usize,
}

impl<'a> GiniObjective<'a> {
    pub fn new(labels: &'a [usize], n_classes: usize) -> Self {
        Self { labels, n_classes }
    }
}

impl SplitObjective for GiniObjective<'_> {
    type Stats = Vec<f64>;

    fn empty(&self) -> Self::Stats {
        vec![0.0; self.n_classes]
    }

    fn add_row(&self, stats: &mut Self::Stats, row: usize) {
        stats[self.labels[row]] += 1.0;
    }

    fn subtract(&self, total: &Self::Stats, part: &Self::Stats) -> Self::Stats {
        total.iter().zip(part).map(|(t, p)| t - p).collect()
    }

    fn score(&self, stats: &Self::Stats) -> f64 {
        let n: f64 = stats.iter().sum();
        if n <= 0.0 {
            return 0.0;
        }
        stats.iter().map(|count| count * count).sum::<f64>() / n
    }

    fn leaf_value(&self, stats: &Self::Stats) -> f64 {
        let mut best = 0;
        for (class, count) in stats.iter().enumerate() {
            if *count > stats[best] {
                best = class;
            }
        }
        best as f64
    }
}

/// Second-order gradient statistics for boosting with L2 leaf regularisation.
pub struct NewtonObjective<'a> {
    gradients: &'a [f64],
    hessians: &'a [f64],
    lambda: f64,
}

impl<'a> NewtonObjective<'a> {
    pub fn new(gradients: &'a [f64], hessians: &'a [f64], lambda: f64) -> Self {
        Self {
            gradients,
            hessians,
            lambda,
        }
    }
}

impl SplitObjective for NewtonObjective<'_> {
    type Stats = (f64, f64);

    fn empty(&self) -> Self::Stats {
        (0.0, 0.0)
    }

    fn add_row(&self, stats: &mut Self::Stats, row: usize) {
        stats.0 += self.gradients[row];
        stats.1 += self.hessians[row];
    }

    fn subtract(&self, total: &Self::Stats, part: &Self::Stats) -> Self::Stats {
        (total.0 - part.0, total.1 - part.1)
    }

    fn score(&self, stats: &Self::Stats) -> f64 {
        stats.0 * stats.0 / (stats.1 + self.lambda)
    }

    fn leaf_value(&self, stats: &Self::Stats) -> f64 {
        -stats.0 / (stats.1 + self.lambda)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Features considered per split; `None` considers all of them.
    pub max_features: Option<usize>,
    pub min_gain: f64,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: 6,
            min_samples_leaf: 1,
            max_features: None,
            min_gain: 1e-12,
        }
    }
}

pub struct GrownTree {
    pub tree: Tree,
    /// Total split gain attributed to each feature.
    pub importances: Vec<f64>,
}

#[derive(Debug, Clone, Copy)]
struct Split {
    feature: usize,
    threshold: f64,
    gain: f64,
}

// Below this many row-feature cells the split search stays on the caller's
// thread.
const PARALLEL_SPLIT_CELLS: usize = 16_384;

/// Grows one tree over `rows` (row indices into `matrix`, duplicates allowed).
pub fn grow<O, R>(
    objective: &O,
    matrix: ArrayView2<'_, f64>,
    rows: &[usize],
    n_features: usize,
    params: &TreeParams,
    rng: &mut R,
) -> GrownTree
where
    O: SplitObjective,
    R: Rng,
{
    let mut grower = Grower {
        objective,
        matrix: matrix.view(),
        params,
        n_features,
        tree: Tree {
            shrinkage: 1.0,
            ..Default::default()
        },
        importances: vec![0.0; n_features],
    };
    grower.build(rows.to_vec(), 0, rng);
    GrownTree {
        tree: grower.tree,
        importances: grower.importances,
    }
}

struct Grower<'a, O: SplitObjective> {
    objective: &'a O,
    matrix: ArrayView2<'a, f64>,
    params: &'a TreeParams,
    n_features: usize,
    tree: Tree,
    importances: Vec<f64>,
}

impl<O: SplitObjective> Grower<'_, O> {
    fn build<R: Rng>(&mut self, rows: Vec<usize>, depth: usize, rng: &mut R) -> NodeRef {
        let mut stats = self.objective.empty();
        for &row in &rows {
            self.objective.add_row(&mut stats, row);
        }

        let splittable = depth < self.params.max_depth
            && rows.len() >= 2 * self.params.min_samples_leaf.max(1);
        let split = if splittable {
            let features = self.candidate_features(rng);
            self.best_split(&rows, &stats, &features)
        } else {
            None
        };

        let Some(split) = split.filter(|split| split.gain > self.params.min_gain) else {
            return self.push_leaf(&stats, rows.len());
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&row| self.matrix[[row, split.feature]] <= split.threshold);

        let index = self.tree.split_features.len();
        self.tree.split_features.push(split.feature);
        self.tree.thresholds.push(split.threshold);
        self.tree.left_child.push(0);
        self.tree.right_child.push(0);
        self.tree.internal_count.push(rows.len() as f64);
        self.importances[split.feature] += split.gain;

        let left = self.build(left_rows, depth + 1, rng);
        let right = self.build(right_rows, depth + 1, rng);
        self.tree.left_child[index] = left.encode();
        self.tree.right_child[index] = right.encode();
        NodeRef::Internal(index)
    }

    fn push_leaf(&mut self, stats: &O::Stats, count: usize) -> NodeRef {
        let leaf = self.tree.leaf_values.len();
        self.tree.leaf_values.push(self.objective.leaf_value(stats));
        self.tree.leaf_count.push(count as f64);
        NodeRef::Leaf(leaf)
    }

    fn candidate_features<R: Rng>(&self, rng: &mut R) -> Vec<usize> {
        match self.params.max_features {
            Some(limit) if limit < self.n_features => {
                let mut features = sample(rng, self.n_features, limit.max(1)).into_vec();
                features.sort_unstable();
                features
            }
            _ => (0..self.n_features).collect(),
        }
    }

    fn best_split(&self, rows: &[usize], total: &O::Stats, features: &[usize]) -> Option<Split> {
        let parent_score = self.objective.score(total);
        let search = |&feature: &usize| self.best_split_for(feature, rows, total, parent_score);

        let per_feature: Vec<Option<Split>> =
            if rows.len() * features.len() >= PARALLEL_SPLIT_CELLS {
                features.par_iter().map(search).collect()
            } else {
                features.iter().map(search).collect()
            };

        // Features arrive in ascending order, so equal gains keep the lower index.
        per_feature
            .into_iter()
            .flatten()
            .fold(None, |best: Option<Split>, candidate| match best {
                Some(current) if candidate.gain <= current.gain => Some(current),
                _ => Some(candidate),
            })
    }

    fn best_split_for(
        &self,
        feature: usize,
        rows: &[usize],
        total: &O::Stats,
        parent_score: f64,
    ) -> Option<Split> {
        let mut ordered: Vec<(f64, usize)> = rows
            .iter()
            .map(|&row| (self.matrix[[row, feature]], row))
            .collect();
        ordered.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal).then(a.1.cmp(&b.1)));

        let min_leaf = self.params.min_samples_leaf.max(1);
        let mut left = self.objective.empty();
        let mut best: Option<Split> = None;

        for position in 0..ordered.len().saturating_sub(1) {
            let (value, row) = ordered[position];
            self.objective.add_row(&mut left, row);

            let next_value = ordered[position + 1].0;
            if next_value <= value {
                continue;
            }
            let left_count = position + 1;
            if left_count < min_leaf || ordered.len() - left_count < min_leaf {
                continue;
            }

            let right = self.objective.subtract(total, &left);
            let gain = self.objective.score(&left) + self.objective.score(&right) - parent_score;
            if !gain.is_finite() {
                continue;
            }
            if best.map_or(true, |current| gain > current.gain) {
                let midpoint = value + (next_value - value) / 2.0;
                let threshold = if midpoint < next_value { midpoint } else { value };
                best = Some(Split {
                    feature,
                    threshold,
                    gain,
                });
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{aview1, array, Array2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn gini_split_separates_classes_on_informative_feature() {
        let matrix = array![[5.0, 0.0], [5.0, 1.0], [5.0, 2.0], [5.0, 3.0]];
        let labels = [0, 0, 1, 1];
        let objective = GiniObjective::new(&labels, 2);
        let mut rng = StdRng::seed_from_u64(1);
        let grown = grow(
            &objective,
            matrix.view(),
            &[0, 1, 2, 3],
            2,
            &TreeParams::default(),
            &mut rng,
        );

        assert_eq!(grown.tree.split_features, vec![1]);
        assert_eq!(grown.tree.thresholds, vec![1.5]);
        assert_eq!(grown.importances[0], 0.0);
        assert!(grown.importances[1] > 0.0);
        assert_eq!(grown.tree.predict(aview1(&[5.0, 0.5])), 0.0);
        assert_eq!(grown.tree.predict(aview1(&[5.0, 2.5])), 1.0);
        assert_eq!(grown.tree.internal_count, vec![4.0]);
        assert_eq!(grown.tree.leaf_count, vec![2.0, 2.0]);
    }

    #[test]
    fn pure_node_becomes_single_leaf() {
        let matrix = array![[1.0], [2.0]];
        let labels = [1, 1];
        let objective = GiniObjective::new(&labels, 2);
        let mut rng = StdRng::seed_from_u64(1);
        let grown = grow(&objective, matrix.view(), &[0, 1], 1, &TreeParams::default(), &mut rng);
        assert!(grown.tree.split_features.is_empty());
        assert_eq!(grown.tree.leaf_values, vec![1.0]);
        assert!(grown.tree.has_covers());
    }

    #[test]
    fn newton_leaves_are_regularised_means() {
        let matrix = array![[0.0], [0.0], [1.0], [1.0]];
        let gradients = [1.0, 1.0, -1.0, -1.0];
        let hessians = [1.0; 4];
        let objective = NewtonObjective::new(&gradients, &hessians, 1.0);
        let mut rng = StdRng::seed_from_u64(3);
        let grown = grow(&objective, matrix.view(), &[0, 1, 2, 3], 1, &TreeParams::default(), &mut rng);

        assert_eq!(grown.tree.thresholds, vec![0.5]);
        assert!((grown.tree.predict(aview1(&[0.0])) + 2.0 / 3.0).abs() < 1e-12);
        assert!((grown.tree.predict(aview1(&[1.0])) - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn depth_limit_is_respected() {
        let matrix = Array2::from_shape_fn((16, 1), |(i, _)| i as f64);
        let labels: Vec<usize> = (0..16).map(|i| i % 2).collect();
        let objective = GiniObjective::new(&labels, 2);
        let params = TreeParams {
            max_depth: 2,
            ..TreeParams::default()
        };
        let rows: Vec<usize> = (0..16).collect();
        let mut rng = StdRng::seed_from_u64(5);
        let grown = grow(&objective, matrix.view(), &rows, 1, &params, &mut rng);
        assert!(grown.tree.num_leaves() <= 4);
    }
}
