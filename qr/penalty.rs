use super::QrError;
use ndarray::{Array2, ArrayView1, ArrayView2, s};
use ndarray_linalg::{Eigh, UPLO};

/// Relative eigenvalue cutoff below which a penalty direction is treated as
/// unpenalized when building the square root.
const EIGEN_CUTOFF: f64 = 1e-12;

/// A quadratic penalty `βᵀ S β` over the design columns of a fit.
///
/// Blocks (e.g. a spline roughness matrix for the columns of one smooth term)
/// and ridge terms are accumulated into a single symmetric `S`. The solver
/// consumes it through [`Penalty::root`]: rows `E` with `EᵀE = S` are stacked
/// under the data factor, turning the penalized normal equations into an
/// ordinary least-squares problem.
#[derive(Debug, Clone, PartialEq)]
pub struct Penalty {
    matrix: Array2<f64>,
}

impl Penalty {
    /// A penalty that penalizes nothing.
    pub fn zeros(num_columns: usize) -> Self {
        Self {
            matrix: Array2::zeros((num_columns, num_columns)),
        }
    }

    /// `λ I` over all columns.
    pub fn ridge(num_columns: usize, lambda: f64) -> Result<Self, QrError> {
        Self::zeros(num_columns).add_ridge(lambda)
    }

    pub fn add_ridge(mut self, lambda: f64) -> Result<Self, QrError> {
        check_lambda(lambda)?;
        self.matrix.diag_mut().mapv_inplace(|d| d + lambda);
        Ok(self)
    }

    /// Adds `λ · block` to the square sub-matrix starting at `first_column`.
    pub fn add_block(
        mut self,
        block: ArrayView2<f64>,
        first_column: usize,
        lambda: f64,
    ) -> Result<Self, QrError> {
        check_lambda(lambda)?;
        if block.nrows() != block.ncols() {
            return Err(QrError::InvalidPenalty(format!(
                "penalty block must be square, got {}x{}",
                block.nrows(),
                block.ncols()
            )));
        }
        let end = first_column + block.nrows();
        if end > self.num_columns() {
            return Err(QrError::DimensionMismatch {
                expected: self.num_columns(),
                found: end,
            });
        }
        self.matrix
            .slice_mut(s![first_column..end, first_column..end])
            .scaled_add(lambda, &block);
        Ok(self)
    }

    pub fn num_columns(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn matrix(&self) -> ArrayView2<'_, f64> {
        self.matrix.view()
    }

    /// `βᵀ S β`.
    pub fn quadratic_form(&self, beta: ArrayView1<f64>) -> f64 {
        beta.dot(&self.matrix.dot(&beta))
    }

    /// Rows `E` (one per retained eigen-direction) such that `EᵀE = S`.
    pub fn root(&self) -> Result<Array2<f64>, QrError> {
        let p = self.num_columns();
        let largest = self.matrix.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        if p == 0 || largest == 0.0 {
            return Ok(Array2::zeros((0, p)));
        }

        let (values, vectors) = self.matrix.eigh(UPLO::Lower)?;
        let max_eigen = values.iter().fold(0.0_f64, |acc, v| acc.max(*v));
        let kept: Vec<usize> = (0..p)
            .filter(|&k| values[k] > EIGEN_CUTOFF * max_eigen)
            .collect();

        let mut root = Array2::zeros((kept.len(), p));
        for (row, &k) in kept.iter().enumerate() {
            let scale = values[k].sqrt();
            root.row_mut(row)
                .assign(&vectors.column(k).mapv(|v| v * scale));
        }
        log::trace!("Penalty root keeps {} of {} directions", kept.len(), p);
        Ok(root)
    }
}

fn check_lambda(lambda: f64) -> Result<(), QrError> {
    if lambda.is_finite() && lambda >= 0.0 {
        Ok(())
    } else {
        Err(QrError::InvalidPenalty(format!(
            "smoothing parameter must be finite and non-negative, got {lambda}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_root_reproduces_penalty() {
        let block = array![[1.0, -2.0, 1.0], [-2.0, 5.0, -4.0], [1.0, -4.0, 6.0]];
        let penalty = Penalty::zeros(5)
            .add_block(block.view(), 1, 0.5)
            .unwrap()
            .add_ridge(1e-3)
            .unwrap();
        let root = penalty.root().unwrap();
        let rebuilt = root.t().dot(&root);
        for (x, y) in rebuilt.iter().zip(penalty.matrix().iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_root_drops_null_space() {
        // Second-difference penalty on three columns has a two-dimensional null space.
        let block = array![[1.0, -2.0, 1.0], [-2.0, 4.0, -2.0], [1.0, -2.0, 1.0]];
        let penalty = Penalty::zeros(3).add_block(block.view(), 0, 2.0).unwrap();
        assert_eq!(penalty.root().unwrap().nrows(), 1);
        assert_eq!(Penalty::zeros(4).root().unwrap().shape(), &[0, 4]);
    }

    #[test]
    fn test_quadratic_form() {
        let penalty = Penalty::ridge(3, 2.0).unwrap();
        let beta = array![1.0, -2.0, 0.5];
        assert_abs_diff_eq!(penalty.quadratic_form(beta.view()), 2.0 * 5.25, epsilon = 1e-12);
    }

    #[test]
    fn test_error_conditions() {
        assert!(matches!(
            Penalty::ridge(2, -1.0).unwrap_err(),
            QrError::InvalidPenalty(_)
        ));
        assert!(matches!(
            Penalty::zeros(2).add_ridge(f64::NAN).unwrap_err(),
            QrError::InvalidPenalty(_)
        ));
        match Penalty::zeros(3)
            .add_block(Array2::<f64>::eye(2).view(), 2, 1.0)
            .unwrap_err()
        {
            QrError::DimensionMismatch { expected, found } => {
                assert_eq!(expected, 3);
                assert_eq!(found, 4);
            }
            other => panic!("Expected DimensionMismatch error, got {other:?}"),
        }
        assert!(matches!(
            Penalty::zeros(3)
                .add_block(Array2::<f64>::ones((2, 3)).view(), 0, 1.0)
                .unwrap_err(),
            QrError::InvalidPenalty(_)
        ));
    }
}
