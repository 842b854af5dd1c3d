//! Gaussian-process surrogate over the unit hypercube.
//!
//! Matérn 5/2 kernel, observations normalised to zero mean and unit variance,
//! exact inference through a Cholesky factor of `K + noise * I`.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

const DEFAULT_LENGTH_SCALE: f64 = 0.5;
const DEFAULT_NOISE: f64 = 1e-4;
const MAX_JITTER_ATTEMPTS: usize = 6;

#[derive(Debug, Clone)]
pub struct GaussianProcess {
    length_scale: f64,
    noise: f64,
    x_train: Option<Array2<f64>>,
    /// Lower Cholesky factor of `K + noise * I`.
    l_chol: Option<Array2<f64>>,
    alpha: Option<Array1<f64>>,
    y_mean: f64,
    y_std: f64,
}

impl Default for GaussianProcess {
    fn default() -> Self {
        Self::new(DEFAULT_LENGTH_SCALE, DEFAULT_NOISE)
    }
}

impl GaussianProcess {
    pub fn new(length_scale: f64, noise: f64) -> Self {
        Self {
            length_scale,
            noise: noise.max(1e-10),
            x_train: None,
            l_chol: None,
            alpha: None,
            y_mean: 0.0,
            y_std: 1.0,
        }
    }

    /// Fits the surrogate. Returns `false` when the kernel matrix stays
    /// indefinite even after adding jitter, leaving the model unfitted.
    pub fn fit(&mut self, x: Array2<f64>, y: Array1<f64>) -> bool {
        let n = y.len();
        if n == 0 || x.nrows() != n {
            return false;
        }

        self.y_mean = y.mean().unwrap_or(0.0);
        let std = y.std(0.0);
        self.y_std = if std < 1e-10 { 1.0 } else { std };
        let y_normalized = y.mapv(|v| (v - self.y_mean) / self.y_std);

        let kernel = self.kernel_matrix(x.view(), x.view());
        let mut jitter = self.noise;
        for _ in 0..MAX_JITTER_ATTEMPTS {
            let noisy = &kernel + &(Array2::<f64>::eye(n) * jitter);
            if let Some(l_chol) = cholesky(&noisy) {
                let z = forward_substitute(&l_chol, y_normalized.view());
                self.alpha = Some(backward_substitute(&l_chol, z.view()));
                self.l_chol = Some(l_chol);
                self.x_train = Some(x);
                return true;
            }
            jitter *= 10.0;
        }
        false
    }

    pub fn is_fitted(&self) -> bool {
        self.x_train.is_some()
    }

    /// Posterior mean and variance at `point`, in the original units.
    pub fn predict(&self, point: ArrayView1<'_, f64>) -> (f64, f64) {
        let (Some(x_train), Some(l_chol), Some(alpha)) = (&self.x_train, &self.l_chol, &self.alpha)
        else {
            return (self.y_mean, self.y_std * self.y_std);
        };

        let k_star: Array1<f64> = x_train
            .rows()
            .into_iter()
            .map(|train| self.kernel(train, point))
            .collect();
        let mean_normalized = k_star.dot(alpha);

        let v = forward_substitute(l_chol, k_star.view());
        let variance_normalized = (1.0 - v.dot(&v)).max(1e-12);

        (
            mean_normalized * self.y_std + self.y_mean,
            variance_normalized * self.y_std * self.y_std,
        )
    }

    fn kernel_matrix(&self, a: ArrayView2<'_, f64>, b: ArrayView2<'_, f64>) -> Array2<f64> {
        Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| self.kernel(a.row(i), b.row(j)))
    }

    fn kernel(&self, a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
        let diff = &a - &b;
        let dist = diff.dot(&diff).sqrt();
        let sqrt5 = 5.0_f64.sqrt();
        let r = dist / self.length_scale;
        (1.0 + sqrt5 * r + 5.0 / 3.0 * r * r) * (-sqrt5 * r).exp()
    }
}

fn cholesky(matrix: &Array2<f64>) -> Option<Array2<f64>> {
    let n = matrix.nrows();
    let mut lower = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| lower[[i, k]] * lower[[j, k]]).sum();
            if i == j {
                let diagonal = matrix[[i, i]] - sum;
                if diagonal <= 0.0 || !diagonal.is_finite() {
                    return None;
                }
                lower[[i, j]] = diagonal.sqrt();
            } else {
                lower[[i, j]] = (matrix[[i, j]] - sum) / lower[[j, j]];
            }
        }
    }
    Some(lower)
}

/// Solves `L z = b`.
fn forward_substitute(lower: &Array2<f64>, b: ArrayView1<'_, f64>) -> Array1<f64> {
    let n = b.len();
    let mut z = Array1::<f64>::zeros(n);
    for i in 0..n {
        let sum: f64 = (0..i).map(|k| lower[[i, k]] * z[k]).sum();
        z[i] = (b[i] - sum) / lower[[i, i]];
    }
    z
}

/// Solves `L^T x = z`.
fn backward_substitute(lower: &Array2<f64>, z: ArrayView1<'_, f64>) -> Array1<f64> {
    let n = z.len();
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let sum: f64 = (i + 1..n).map(|k| lower[[k, i]] * x[k]).sum();
        x[i] = (z[i] - sum) / lower[[i, i]];
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, aview1};

    #[test]
    fn interpolates_observations() {
        let x = array![[0.1, 0.2], [0.5, 0.5], [0.9, 0.1]];
        let y = array![0.6, 0.8, 0.7];
        let mut gp = GaussianProcess::default();
        assert!(gp.fit(x.clone(), y.clone()));

        for (point, expected) in x.rows().into_iter().zip(&y) {
            let (mean, variance) = gp.predict(point);
            assert!((mean - expected).abs() < 1e-2, "mean {mean} vs {expected}");
            assert!(variance < 1e-2);
        }
    }

    #[test]
    fn variance_grows_away_from_data() {
        let mut gp = GaussianProcess::default();
        assert!(gp.fit(array![[0.0, 0.0]], array![1.0]));
        let (_, near) = gp.predict(aview1(&[0.01, 0.0]));
        let (_, far) = gp.predict(aview1(&[1.0, 1.0]));
        assert!(far > near);
    }

    #[test]
    fn duplicate_points_still_factorise() {
        let mut gp = GaussianProcess::default();
        assert!(gp.fit(array![[0.3, 0.3], [0.3, 0.3]], array![0.5, 0.5]));
    }
}
