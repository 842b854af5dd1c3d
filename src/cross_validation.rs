use crate::error::{PipelineError, Result};

/// Training and validation row indices for one fold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub index: usize,
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// Stratified k-fold split: rows are ordered by class, then by position, and
/// dealt round-robin so every fold sees each class in proportion.
pub fn stratified_folds(labels: &[usize], k: usize) -> Result<Vec<Fold>> {
    if k < 2 {
        return Err(PipelineError::InvalidConfiguration(format!(
            "cross-validation needs at least 2 folds (value: {})",
            k
        )));
    }
    if labels.len() < k {
        return Err(PipelineError::TrainingDataInsufficient(format!(
            "{} rows cannot fill {} folds",
            labels.len(),
            k
        )));
    }

    let mut ordered: Vec<usize> = (0..labels.len()).collect();
    ordered.sort_by_key(|&row| (labels[row], row));

    let mut assignment = vec![0usize; labels.len()];
    for (position, &row) in ordered.iter().enumerate() {
        assignment[row] = position % k;
    }

    Ok((0..k)
        .map(|index| {
            let (validation, train): (Vec<usize>, Vec<usize>) =
                (0..labels.len()).partition(|&row| assignment[row] == index);
            Fold {
                index,
                train,
                validation,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_partition_rows_and_balance_classes() {
        let labels = [0, 1, 0, 1, 0, 1, 0, 1, 0];
        let folds = stratified_folds(&labels, 3).expect("folds");
        assert_eq!(folds.len(), 3);

        let mut seen: Vec<usize> = folds.iter().flat_map(|f| f.validation.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..9).collect::<Vec<_>>());

        for fold in &folds {
            assert_eq!(fold.train.len() + fold.validation.len(), 9);
            assert!(fold.validation.iter().all(|row| !fold.train.contains(row)));
            let positives = fold.validation.iter().filter(|&&row| labels[row] == 1).count();
            assert!((1..=2).contains(&positives));
        }
    }

    #[test]
    fn too_few_rows_is_insufficient() {
        let err = stratified_folds(&[0, 1], 3).expect_err("two rows");
        assert!(matches!(err, PipelineError::TrainingDataInsufficient(_)));
    }
}
