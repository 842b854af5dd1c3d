use crate::config::WindowAlignment;

/// Returns the window of `len` values ending at `end` (exclusive), or `None`
/// when fewer than `len` values precede `end`.
fn rolling_slice(values: &[f64], end: usize, len: usize) -> Option<&[f64]> {
    if len == 0 || end > values.len() || end < len {
        return None;
    }
    Some(&values[end - len..end])
}

fn mean_of(window: &[f64]) -> Option<f64> {
    if window.iter().any(|value| !value.is_finite()) {
        return None;
    }
    Some(window.iter().sum::<f64>() / window.len() as f64)
}

/// Causal rolling mean of `values`, one entry per input position.
///
/// Positions whose window is incomplete, or whose window holds a missing
/// (non-finite) value, are `None`.
pub fn rolling_mean(values: &[f64], window: usize, alignment: WindowAlignment) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|index| {
            let end = match alignment {
                WindowAlignment::Inclusive => index + 1,
                WindowAlignment::Exclusive => index,
            };
            rolling_slice(values, end, window).and_then(mean_of)
        })
        .collect()
}

/// Length of the run of equal consecutive values ending at each position.
pub fn streak_lengths<T: PartialEq>(series: &[T]) -> Vec<u32> {
    let mut lengths = Vec::with_capacity(series.len());
    for (index, value) in series.iter().enumerate() {
        let length = match index.checked_sub(1) {
            Some(prev) if series[prev] == *value => lengths[prev] + 1,
            _ => 1,
        };
        lengths.push(length);
    }
    lengths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streak_resets_on_change() {
        let series = ["W", "W", "L", "W", "W", "W"];
        assert_eq!(streak_lengths(&series), vec![1, 2, 1, 1, 2, 3]);
    }

    #[test]
    fn streak_of_empty_series_is_empty() {
        let series: [f64; 0] = [];
        assert!(streak_lengths(&series).is_empty());
    }

    #[test]
    fn inclusive_window_covers_current_row() {
        let means = rolling_mean(&[1.0, 2.0, 3.0, 4.0], 3, WindowAlignment::Inclusive);
        assert_eq!(means, vec![None, None, Some(2.0), Some(3.0)]);
    }

    #[test]
    fn exclusive_window_stops_before_current_row() {
        let means = rolling_mean(&[1.0, 2.0, 3.0, 4.0], 3, WindowAlignment::Exclusive);
        assert_eq!(means, vec![None, None, None, Some(2.0)]);
    }

    #[test]
    fn missing_value_poisons_only_windows_containing_it() {
        let means = rolling_mean(&[1.0, f64::NAN, 3.0, 5.0, 7.0], 2, WindowAlignment::Inclusive);
        assert_eq!(means, vec![None, None, None, Some(4.0), Some(6.0)]);
    }
}
