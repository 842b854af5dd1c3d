//! Bounded hyperparameter space searched by the optimizer.
//!
//! Every dimension is mapped onto `[0, 1]` so the surrogate model works on a
//! unit cube regardless of the natural scale of each parameter.

use crate::error::{PipelineError, Result};
use crate::models::Hyperparameters;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Inclusive integer range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntRange {
    pub min: usize,
    pub max: usize,
}

/// Real range sampled uniformly in log space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub max_depth: IntRange,
    pub learning_rate: LogRange,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            max_depth: IntRange { min: 3, max: 10 },
            learning_rate: LogRange {
                min: 0.01,
                max: 0.3,
            },
        }
    }
}

impl SearchSpace {
    pub const DIMENSIONS: usize = 2;

    pub fn validate(&self) -> Result<()> {
        if self.max_depth.min == 0 || self.max_depth.max < self.max_depth.min {
            return Err(PipelineError::InvalidConfiguration(format!(
                "max depth range must satisfy 1 <= min <= max (min: {}, max: {})",
                self.max_depth.min, self.max_depth.max
            )));
        }
        let LogRange { min, max } = self.learning_rate;
        if !(min.is_finite() && max.is_finite()) || min <= 0.0 || max < min {
            return Err(PipelineError::InvalidConfiguration(format!(
                "learning rate range must satisfy 0 < min <= max (min: {}, max: {})",
                min, max
            )));
        }
        Ok(())
    }

    pub fn sample_unit<R: Rng>(&self, rng: &mut R) -> [f64; Self::DIMENSIONS] {
        [rng.gen::<f64>(), rng.gen::<f64>()]
    }

    /// Maps a unit-cube point to concrete hyperparameters. Coordinates outside
    /// `[0, 1]` are clamped.
    pub fn decode(&self, point: &[f64; Self::DIMENSIONS]) -> Hyperparameters {
        let depth_unit = clamp_unit(point[0]);
        let rate_unit = clamp_unit(point[1]);

        let depth_span = (self.max_depth.max - self.max_depth.min) as f64;
        let max_depth = (self.max_depth.min as f64 + depth_unit * depth_span).round() as usize;

        let log_min = self.learning_rate.min.ln();
        let log_max = self.learning_rate.max.ln();
        let learning_rate = (log_min + rate_unit * (log_max - log_min)).exp();

        Hyperparameters {
            max_depth: max_depth.clamp(self.max_depth.min, self.max_depth.max),
            learning_rate: learning_rate.clamp(self.learning_rate.min, self.learning_rate.max),
        }
    }

    pub fn encode(&self, params: &Hyperparameters) -> [f64; Self::DIMENSIONS] {
        let depth_span = (self.max_depth.max - self.max_depth.min) as f64;
        let depth_unit = if depth_span > 0.0 {
            (params.max_depth as f64 - self.max_depth.min as f64) / depth_span
        } else {
            0.5
        };

        let log_min = self.learning_rate.min.ln();
        let log_span = self.learning_rate.max.ln() - log_min;
        let rate_unit = if log_span > 0.0 {
            (params.learning_rate.ln() - log_min) / log_span
        } else {
            0.5
        };

        [clamp_unit(depth_unit), clamp_unit(rate_unit)]
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn decode_stays_within_bounds() {
        let space = SearchSpace::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let params = space.decode(&space.sample_unit(&mut rng));
            assert!((3..=10).contains(&params.max_depth));
            assert!(params.learning_rate >= 0.01 && params.learning_rate <= 0.3);
        }
    }

    #[test]
    fn decode_endpoints_hit_range_limits() {
        let space = SearchSpace::default();
        let low = space.decode(&[0.0, 0.0]);
        let high = space.decode(&[1.0, 1.0]);
        assert_eq!(low.max_depth, 3);
        assert_eq!(high.max_depth, 10);
        assert!((low.learning_rate - 0.01).abs() < 1e-12);
        assert!((high.learning_rate - 0.3).abs() < 1e-12);
    }

    #[test]
    fn encode_inverts_decode_on_grid_points() {
        let space = SearchSpace::default();
        let params = Hyperparameters {
            max_depth: 6,
            learning_rate: 0.05,
        };
        let decoded = space.decode(&space.encode(&params));
        assert_eq!(decoded.max_depth, 6);
        assert!((decoded.learning_rate - 0.05).abs() < 1e-9);
    }

    #[test]
    fn rejects_inverted_ranges() {
        let mut space = SearchSpace::default();
        space.learning_rate = LogRange { min: 0.3, max: 0.1 };
        assert!(matches!(
            space.validate(),
            Err(PipelineError::InvalidConfiguration(_))
        ));
    }
}
