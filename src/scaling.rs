use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Per-column standardisation to zero mean and unit variance.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    means: Array1<f64>,
    scales: Array1<f64>,
}

impl StandardScaler {
    /// Fits column statistics. Columns with zero spread get a scale of 1 so
    /// they map to a constant zero instead of NaN.
    pub fn fit(matrix: ArrayView2<'_, f64>) -> Self {
        let columns = matrix.ncols();
        let means = matrix
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(columns));
        let scales = if matrix.nrows() == 0 {
            Array1::ones(columns)
        } else {
            matrix
                .std_axis(Axis(0), 0.0)
                .mapv(|std| if std > f64::EPSILON { std } else { 1.0 })
        };
        Self { means, scales }
    }

    pub fn transform(&self, matrix: ArrayView2<'_, f64>) -> Array2<f64> {
        (&matrix - &self.means) / &self.scales
    }

    pub fn fit_transform(matrix: ArrayView2<'_, f64>) -> Array2<f64> {
        Self::fit(matrix).transform(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn standardises_columns() {
        let scaled = StandardScaler::fit_transform(array![[1.0, 5.0], [3.0, 5.0]].view());
        assert_eq!(scaled, array![[-1.0, 0.0], [1.0, 0.0]]);
    }

    #[test]
    fn empty_matrix_keeps_its_width() {
        let scaler = StandardScaler::fit(Array2::<f64>::zeros((0, 3)).view());
        assert_eq!(scaler.transform(Array2::zeros((0, 3)).view()).dim(), (0, 3));
    }
}
