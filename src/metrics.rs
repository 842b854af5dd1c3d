const PROBABILITY_FLOOR: f64 = 1e-15;

/// Fraction of predictions equal to their label. Empty input scores 0.
pub fn accuracy(predicted: &[usize], actual: &[usize]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let correct = predicted
        .iter()
        .zip(actual)
        .filter(|(p, a)| p == a)
        .count();
    correct as f64 / actual.len() as f64
}

/// Index of the largest entry; ties keep the lower index.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (index, value) in values.iter().enumerate() {
        if *value > values[best] {
            best = index;
        }
    }
    best
}

/// Mean negative log-likelihood of the true class.
pub fn log_loss(distributions: &[Vec<f64>], actual: &[usize]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let total: f64 = distributions
        .iter()
        .zip(actual)
        .map(|(distribution, &label)| {
            let p = distribution.get(label).copied().unwrap_or(0.0);
            -p.clamp(PROBABILITY_FLOOR, 1.0).ln()
        })
        .sum();
    total / actual.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accuracy_counts_matches() {
        assert_eq!(accuracy(&[0, 1, 1, 0], &[0, 1, 0, 0]), 0.75);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn argmax_prefers_lower_index_on_ties() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), 1);
        assert_eq!(argmax(&[]), 0);
    }

    #[test]
    fn log_loss_of_confident_correct_prediction_is_small() {
        let loss = log_loss(&[vec![0.01, 0.99], vec![0.9, 0.1]], &[1, 0]);
        assert!(loss < 0.06);
        assert!(log_loss(&[vec![1.0, 0.0]], &[1]) > 30.0);
    }
}
