use crate::error::{PipelineError, Result};
use ndarray::ArrayView1;
use std::fmt::Write as _;
use std::iter::Peekable;
use std::str::{FromStr, Lines};

/// Child link of an internal node, decoded from the signed array encoding
/// where negative values address leaves as `-child - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    Internal(usize),
    Leaf(usize),
}

impl NodeRef {
    pub fn decode(child: i32) -> Self {
        if child < 0 {
            Self::Leaf((-child - 1) as usize)
        } else {
            Self::Internal(child as usize)
        }
    }

    pub fn encode(self) -> i32 {
        match self {
            Self::Internal(index) => index as i32,
            Self::Leaf(index) => -(index as i32) - 1,
        }
    }
}

/// Array-encoded binary regression tree.
///
/// Rows go left when `value <= threshold`. `internal_count` and `leaf_count`
/// hold the number of training rows that reached each node; they are optional
/// for prediction but required for attribution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tree {
    pub split_features: Vec<usize>,
    pub thresholds: Vec<f64>,
    pub left_child: Vec<i32>,
    pub right_child: Vec<i32>,
    pub internal_count: Vec<f64>,
    pub leaf_values: Vec<f64>,
    pub leaf_count: Vec<f64>,
    pub shrinkage: f64,
}

impl Tree {
    pub fn root(&self) -> NodeRef {
        if self.split_features.is_empty() {
            NodeRef::Leaf(0)
        } else {
            NodeRef::Internal(0)
        }
    }

    pub fn num_leaves(&self) -> usize {
        self.leaf_values.len()
    }

    /// Shrunk leaf output.
    pub fn leaf_output(&self, leaf: usize) -> f64 {
        self.leaf_values.get(leaf).copied().unwrap_or_default() * self.shrinkage
    }

    pub fn predict(&self, features: ArrayView1<'_, f64>) -> f64 {
        let mut node = self.root();
        loop {
            match node {
                NodeRef::Leaf(leaf) => return self.leaf_output(leaf),
                NodeRef::Internal(index) => {
                    let feature_idx = self.split_features[index];
                    let feature_value = features.get(feature_idx).copied().unwrap_or(0.0);
                    node = if feature_value <= self.thresholds[index] {
                        NodeRef::decode(self.left_child[index])
                    } else {
                        NodeRef::decode(self.right_child[index])
                    };
                }
            }
        }
    }

    pub fn has_covers(&self) -> bool {
        self.internal_count.len() == self.split_features.len()
            && self.leaf_count.len() == self.leaf_values.len()
            && self.node_count(self.root()) > 0.0
    }

    pub fn node_count(&self, node: NodeRef) -> f64 {
        match node {
            NodeRef::Internal(index) => self.internal_count.get(index).copied().unwrap_or(0.0),
            NodeRef::Leaf(index) => self.leaf_count.get(index).copied().unwrap_or(0.0),
        }
    }

    /// Mean shrunk output over the training rows, weighted by leaf counts.
    pub fn expected_value(&self) -> f64 {
        let total = self.node_count(self.root());
        if total <= 0.0 {
            return 0.0;
        }
        self.leaf_values
            .iter()
            .zip(&self.leaf_count)
            .map(|(value, count)| value * count)
            .sum::<f64>()
            * self.shrinkage
            / total
    }

    pub(crate) fn write_block(&self, index: usize, out: &mut String) {
        let _ = writeln!(out, "Tree={}", index);
        let _ = writeln!(out, "num_leaves={}", self.leaf_values.len());
        let _ = writeln!(out, "split_feature={}", join(&self.split_features));
        let _ = writeln!(out, "threshold={}", join(&self.thresholds));
        let _ = writeln!(out, "left_child={}", join(&self.left_child));
        let _ = writeln!(out, "right_child={}", join(&self.right_child));
        let _ = writeln!(out, "leaf_value={}", join(&self.leaf_values));
        let _ = writeln!(out, "leaf_count={}", join(&self.leaf_count));
        let _ = writeln!(out, "internal_count={}", join(&self.internal_count));
        let _ = writeln!(out, "shrinkage={}", self.shrinkage);
        out.push('\n');
    }

    /// Reads the body of a `Tree=` block, stopping before the next block.
    pub(crate) fn from_lines(lines: &mut Peekable<Lines<'_>>) -> Result<Self> {
        let mut num_leaves: Option<usize> = None;
        let mut tree = Tree {
            shrinkage: 1.0,
            ..Default::default()
        };

        while let Some(raw) =
            lines.next_if(|line| !line.starts_with("Tree=") && !line.starts_with("end of trees"))
        {
            let line = raw.trim();
            if line.starts_with("num_leaves=") {
                num_leaves = Some(parse_value(line, "num_leaves=")?);
            } else if line.starts_with("split_feature=") {
                tree.split_features = parse_array(line, "split_feature=")?;
            } else if line.starts_with("threshold=") {
                tree.thresholds = parse_array(line, "threshold=")?;
            } else if line.starts_with("left_child=") {
                tree.left_child = parse_array(line, "left_child=")?;
            } else if line.starts_with("right_child=") {
                tree.right_child = parse_array(line, "right_child=")?;
            } else if line.starts_with("leaf_value=") {
                tree.leaf_values = parse_array(line, "leaf_value=")?;
            } else if line.starts_with("leaf_count=") {
                tree.leaf_count = parse_array(line, "leaf_count=")?;
            } else if line.starts_with("internal_count=") {
                tree.internal_count = parse_array(line, "internal_count=")?;
            } else if line.starts_with("shrinkage=") {
                tree.shrinkage = parse_value(line, "shrinkage=")?;
            }
        }

        tree.validate(num_leaves)?;
        Ok(tree)
    }

    fn validate(&self, num_leaves: Option<usize>) -> Result<()> {
        let internal_nodes = self.split_features.len();
        if self.thresholds.len() != internal_nodes
            || self.left_child.len() != internal_nodes
            || self.right_child.len() != internal_nodes
        {
            return Err(PipelineError::ModelFormat(
                "tree definition invalid: split/child/threshold length mismatch".to_string(),
            ));
        }

        let declared_leaves = num_leaves.unwrap_or(self.leaf_values.len());
        if declared_leaves != self.leaf_values.len() || declared_leaves != internal_nodes + 1 {
            return Err(PipelineError::ModelFormat(format!(
                "tree leaf count mismatch: declared {declared_leaves}, found {} values for {internal_nodes} splits",
                self.leaf_values.len()
            )));
        }

        for &child in self.left_child.iter().chain(&self.right_child) {
            let in_range = match NodeRef::decode(child) {
                NodeRef::Internal(index) => index > 0 && index < internal_nodes,
                NodeRef::Leaf(index) => index < declared_leaves,
            };
            if !in_range {
                return Err(PipelineError::ModelFormat(format!(
                    "tree child reference {child} is out of range"
                )));
            }
        }
        Ok(())
    }
}

fn join<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn parse_value<T>(line: &str, prefix: &str) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let raw = line
        .strip_prefix(prefix)
        .ok_or_else(|| PipelineError::ModelFormat(format!("expected prefix {prefix}")))?;
    raw.trim().parse::<T>().map_err(|err| {
        PipelineError::ModelFormat(format!(
            "failed to parse value for {prefix} from \"{line}\": {err}"
        ))
    })
}

pub(crate) fn parse_array<T>(line: &str, prefix: &str) -> Result<Vec<T>>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let raw = line
        .strip_prefix(prefix)
        .ok_or_else(|| PipelineError::ModelFormat(format!("expected prefix {prefix}")))?;
    raw.split_whitespace()
        .map(|token| {
            token.parse::<T>().map_err(|err| {
                PipelineError::ModelFormat(format!("failed to parse value {token} for {prefix}: {err}"))
            })
        })
        .collect()
}
