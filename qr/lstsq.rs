use super::QrError;
use super::mapreduce::try_mapreduce_qr;
use super::penalty::Penalty;
use super::reduce::{QrAccumulator, merge, reduce};
use crate::config::FitConfig;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::{Diag, SolveTriangular, UPLO};
use rayon::prelude::*;
use std::borrow::Borrow;

/// Tracks which design columns, and the design row sum, hold one value over
/// every weighted row.
///
/// A constant nonzero column is an explicit intercept; a constant nonzero row
/// sum is an implicit one (a partition-of-unity basis such as B-splines). In
/// either case the column space holds the constant vector and R² is measured
/// around the mean.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantColumns {
    /// Design values of the first observed row followed by its row sum.
    reference: Option<Vec<f64>>,
    constant: Vec<bool>,
}

impl ConstantColumns {
    pub fn observe(&mut self, design: ArrayView1<f64>) {
        let values = design.iter().copied().chain(std::iter::once(design.sum()));
        match &self.reference {
            Some(reference) => {
                let flags = self.constant.iter_mut().zip(reference);
                for ((flag, &expected), value) in flags.zip(values) {
                    *flag = *flag && same_value(expected, value);
                }
            }
            None => {
                self.reference = Some(values.collect());
                self.constant = vec![true; design.len() + 1];
            }
        }
    }

    pub fn merge(self, other: Self) -> Self {
        match (self.reference, other.reference) {
            (None, reference) => Self {
                reference,
                constant: other.constant,
            },
            (reference, None) => Self {
                reference,
                constant: self.constant,
            },
            (Some(left), Some(right)) => {
                let constant = self
                    .constant
                    .iter()
                    .zip(&other.constant)
                    .zip(left.iter().zip(&right))
                    .map(|((&a, &b), (&l, &r))| a && b && same_value(l, r))
                    .collect();
                Self {
                    reference: Some(left),
                    constant,
                }
            }
        }
    }

    /// Whether some design column or the row sum is a nonzero constant.
    pub fn spans_constant(&self) -> bool {
        self.reference.as_ref().is_some_and(|reference| {
            reference
                .iter()
                .zip(&self.constant)
                .any(|(&value, &constant)| constant && value != 0.0)
        })
    }
}

fn same_value(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-10 * a.abs().max(b.abs()).max(1.0)
}

/// Weighted running moments of the response, kept next to the factor so the
/// total sum of squares is available for R².
///
/// Updates follow Welford, merges follow the pairwise update of Chan et al., so
/// partial moments from independent folds combine exactly like partial factors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMoments {
    /// Rows with strictly positive weight.
    pub count: usize,
    pub weight_sum: f64,
    pub mean: f64,
    /// Weighted sum of squared deviations from `mean`.
    pub m2: f64,
    /// Weighted uncentered sum of squares `Σ w·y²`.
    pub sum_of_squares: f64,
    pub design: ConstantColumns,
}

impl ResponseMoments {
    pub fn observe(&mut self, y: f64, weight: f64) {
        if weight <= 0.0 {
            return;
        }
        self.count += 1;
        self.weight_sum += weight;
        let delta = y - self.mean;
        self.mean += delta * weight / self.weight_sum;
        self.m2 += weight * delta * (y - self.mean);
        self.sum_of_squares += weight * y * y;
    }

    /// Records one raw (unweighted) row: its design values and response.
    pub fn observe_row(&mut self, design: ArrayView1<f64>, y: f64, weight: f64) {
        if weight <= 0.0 {
            return;
        }
        self.observe(y, weight);
        self.design.observe(design);
    }

    pub fn merge(self, other: Self) -> Self {
        let count = self.count + other.count;
        let sum_of_squares = self.sum_of_squares + other.sum_of_squares;
        let design = self.design.merge(other.design);
        if other.weight_sum <= 0.0 {
            return Self {
                count,
                sum_of_squares,
                design,
                ..self
            };
        }
        if self.weight_sum <= 0.0 {
            return Self {
                count,
                sum_of_squares,
                design,
                ..other
            };
        }
        let weight_sum = self.weight_sum + other.weight_sum;
        let delta = other.mean - self.mean;
        Self {
            count,
            weight_sum,
            mean: self.mean + delta * other.weight_sum / weight_sum,
            m2: self.m2 + other.m2 + delta * delta * self.weight_sum * other.weight_sum / weight_sum,
            sum_of_squares,
            design,
        }
    }

    /// Centered when the design spans a constant, uncentered `Σ w·y²` otherwise.
    pub fn total_sum_of_squares(&self) -> f64 {
        if self.design.spans_constant() {
            self.m2
        } else {
            self.sum_of_squares
        }
    }
}

/// Outcome of a streaming least-squares fit.
#[derive(Debug, Clone)]
pub struct RegressionResult {
    /// One coefficient per design column, in chunk column order.
    pub coefficients: Array1<f64>,
    /// `1 - RSS/TSS`; `NaN` when the response has zero variance. TSS is
    /// centered on the mean only when the design spans a constant.
    pub r_squared: f64,
    /// `(p+1) x (p+1)` factor the coefficients were solved from: design block,
    /// projected response column, residual norm in the corner. Includes the
    /// penalty rows for penalized fits.
    pub factor: Array2<f64>,
    /// Residual sum of squares of the data alone (penalty excluded).
    pub residual_sum_of_squares: f64,
    pub total_sum_of_squares: f64,
    pub num_observations: usize,
}

impl RegressionResult {
    pub fn num_coefficients(&self) -> usize {
        self.coefficients.len()
    }

    /// The upper-triangular design block `R_xx`.
    pub fn design_factor(&self) -> ArrayView2<'_, f64> {
        let p = self.num_coefficients();
        self.factor.slice(s![..p, ..p])
    }

    /// `RSS / (n - p)`; `NaN` without residual degrees of freedom.
    pub fn residual_variance(&self) -> f64 {
        let p = self.num_coefficients();
        if self.num_observations <= p {
            return f64::NAN;
        }
        self.residual_sum_of_squares / (self.num_observations - p) as f64
    }

    /// `σ² (R_xxᵀ R_xx)⁻¹`, computed as `σ² R⁻¹ R⁻ᵀ`. For penalized fits this
    /// is the covariance under the penalized information `XᵀX + S`.
    pub fn covariance(&self) -> Result<Array2<f64>, QrError> {
        let p = self.num_coefficients();
        let r_inv = self
            .design_factor()
            .to_owned()
            .solve_triangular(UPLO::Upper, Diag::NonUnit, &Array2::<f64>::eye(p))?;
        Ok(r_inv.dot(&r_inv.t()) * self.residual_variance())
    }

    pub fn standard_errors(&self) -> Result<Array1<f64>, QrError> {
        Ok(self.covariance()?.diag().mapv(f64::sqrt))
    }
}

/// Least-squares solver over a stream of chunks.
///
/// Each chunk holds the design columns plus a response column (and optionally
/// a weight column) at fixed positions. Chunks are rearranged to
/// `[design | response]`, scaled by `sqrt(weight)`, and folded through the
/// map-reduce driver; the coefficients are recovered by back-substitution.
#[derive(Debug, Clone)]
pub struct LeastSquaresSolver {
    response_column: usize,
    weight_column: Option<usize>,
    penalty: Option<(Penalty, Array2<f64>)>,
    threshold: usize,
    singular_tolerance: f64,
}

impl LeastSquaresSolver {
    pub fn new(response_column: usize, config: &FitConfig) -> Self {
        Self {
            response_column,
            weight_column: None,
            penalty: None,
            threshold: config.threshold,
            singular_tolerance: config.singular_tolerance,
        }
    }

    /// Treats `weight_column` as per-row prior weights.
    pub fn with_weights(mut self, weight_column: usize) -> Self {
        self.weight_column = Some(weight_column);
        self
    }

    /// Attaches a quadratic penalty over the design columns. Its square root is
    /// computed once here and reused by every solve.
    pub fn with_penalty(mut self, penalty: &Penalty) -> Result<Self, QrError> {
        let root = penalty.root()?;
        self.penalty = Some((penalty.clone(), root));
        Ok(self)
    }

    pub fn penalty(&self) -> Option<&Penalty> {
        self.penalty.as_ref().map(|(penalty, _)| penalty)
    }

    /// Rearranges one raw chunk into weighted `[design | response]` rows and
    /// records its response moments.
    pub fn prepare(
        &self,
        chunk: ArrayView2<f64>,
        moments: &mut ResponseMoments,
    ) -> Result<Array2<f64>, QrError> {
        let ncols = chunk.ncols();
        for column in std::iter::once(self.response_column).chain(self.weight_column) {
            if column >= ncols {
                return Err(QrError::ColumnOutOfRange { column, ncols });
            }
        }
        let design_columns: Vec<usize> = (0..ncols)
            .filter(|&c| c != self.response_column && Some(c) != self.weight_column)
            .collect();
        if design_columns.is_empty() {
            return Err(QrError::NoDesignColumns);
        }

        let p = design_columns.len();
        let mut prepared = Array2::zeros((chunk.nrows(), p + 1));
        prepared
            .slice_mut(s![.., ..p])
            .assign(&chunk.select(Axis(1), &design_columns));
        prepared.column_mut(p).assign(&chunk.column(self.response_column));

        match self.weight_column {
            Some(weight_column) => {
                for (row, (mut values, &weight)) in prepared
                    .axis_iter_mut(Axis(0))
                    .zip(chunk.column(weight_column).iter())
                    .enumerate()
                {
                    if !(weight.is_finite() && weight >= 0.0) {
                        return Err(QrError::InvalidWeight { row, value: weight });
                    }
                    moments.observe_row(values.slice(s![..p]), values[p], weight);
                    let scale = weight.sqrt();
                    values.mapv_inplace(|v| v * scale);
                }
            }
            None => {
                for values in prepared.axis_iter(Axis(0)) {
                    moments.observe_row(values.slice(s![..p]), values[p], 1.0);
                }
            }
        }
        Ok(prepared)
    }

    /// Streams `chunks` once and solves the (weighted, penalized) problem.
    pub fn solve<I, M>(&self, chunks: I) -> Result<RegressionResult, QrError>
    where
        I: IntoIterator<Item = M>,
        M: Borrow<Array2<f64>>,
    {
        let mut moments = ResponseMoments::default();
        let data = try_mapreduce_qr(
            chunks
                .into_iter()
                .map(|chunk| self.prepare(chunk.borrow().view(), &mut moments)),
            self.threshold,
        )?;
        self.finish(data, moments)
    }

    /// Same as [`solve`](Self::solve), with chunk preparation and folding
    /// spread over the rayon pool.
    pub fn solve_parallel<M>(&self, chunks: &[M]) -> Result<RegressionResult, QrError>
    where
        M: Borrow<Array2<f64>> + Sync,
    {
        if chunks.is_empty() {
            return Err(QrError::EmptyInput);
        }
        let threshold = self.threshold;
        let (data, moments) = chunks
            .par_iter()
            .try_fold(
                || (QrAccumulator::Empty, ResponseMoments::default()),
                |(acc, mut moments), chunk| {
                    let prepared = self.prepare(chunk.borrow().view(), &mut moments)?;
                    Ok::<_, QrError>((reduce(acc, prepared.view(), threshold)?, moments))
                },
            )
            .try_reduce(
                || (QrAccumulator::Empty, ResponseMoments::default()),
                |(left, left_moments), (right, right_moments)| {
                    Ok((merge(left, right, threshold)?, left_moments.merge(right_moments)))
                },
            )?;
        self.finish(data, moments)
    }

    /// Solves from an already-folded accumulator of prepared rows.
    pub fn finish(
        &self,
        data: QrAccumulator,
        moments: ResponseMoments,
    ) -> Result<RegressionResult, QrError> {
        let data_factor = data.into_factor()?;
        let p = data_factor
            .ncols()
            .checked_sub(1)
            .filter(|&p| p > 0)
            .ok_or(QrError::NoDesignColumns)?;

        let solve_factor = match &self.penalty {
            Some((penalty, root)) => {
                if penalty.num_columns() != p {
                    return Err(QrError::DimensionMismatch {
                        expected: p,
                        found: penalty.num_columns(),
                    });
                }
                let mut rows = Array2::zeros((root.nrows(), p + 1));
                rows.slice_mut(s![.., ..p]).assign(root);
                merge(
                    QrAccumulator::Factor(data_factor.clone()),
                    QrAccumulator::Rows(rows),
                    0,
                )?
                .into_factor()?
            }
            None => data_factor.clone(),
        };
        let solve_factor = square_up(solve_factor, p + 1);
        let data_factor = square_up(data_factor, p + 1);

        let coefficients = back_substitute(&solve_factor, p, self.singular_tolerance)?;

        // RSS(β) = ‖r_xy − R_xx β‖² + r_yy², valid for any β, so the penalty
        // rows never leak into the goodness of fit.
        let residual = &data_factor.slice(s![..p, p]) - &data_factor.slice(s![..p, ..p]).dot(&coefficients);
        let residual_sum_of_squares = residual.dot(&residual) + data_factor[[p, p]].powi(2);
        let total_sum_of_squares = moments.total_sum_of_squares();
        let r_squared = if moments.m2 > 0.0 && total_sum_of_squares > 0.0 {
            1.0 - residual_sum_of_squares / total_sum_of_squares
        } else {
            log::warn!("Response has zero variance; R² is undefined");
            f64::NAN
        };

        Ok(RegressionResult {
            coefficients,
            r_squared,
            factor: solve_factor,
            residual_sum_of_squares,
            total_sum_of_squares,
            num_observations: moments.count,
        })
    }
}

/// Fits the last column of every chunk on the remaining columns.
pub fn lm_solve_qr<I, M>(chunks: I, threshold: usize) -> Result<RegressionResult, QrError>
where
    I: IntoIterator<Item = M>,
    M: Borrow<Array2<f64>>,
{
    let mut chunks = chunks.into_iter().peekable();
    let ncols = chunks
        .peek()
        .map(|chunk| chunk.borrow().ncols())
        .ok_or(QrError::EmptyInput)?;
    let response_column = ncols.checked_sub(1).ok_or(QrError::NoDesignColumns)?;
    LeastSquaresSolver::new(response_column, &FitConfig::with_threshold(threshold)).solve(chunks)
}

/// Pads with zero rows (or trims) to an `n x n` factor. Factors that saw fewer
/// rows than columns are upper-trapezoidal; the missing rows carry no
/// information.
fn square_up(factor: Array2<f64>, n: usize) -> Array2<f64> {
    if factor.nrows() == n {
        return factor;
    }
    let mut square = Array2::zeros((n, factor.ncols()));
    let kept = factor.nrows().min(n);
    square
        .slice_mut(s![..kept, ..])
        .assign(&factor.slice(s![..kept, ..]));
    square
}

fn back_substitute(factor: &Array2<f64>, p: usize, tolerance: f64) -> Result<Array1<f64>, QrError> {
    let r_xx = factor.slice(s![..p, ..p]).to_owned();
    let max_pivot = r_xx.diag().iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    for (column, &pivot) in r_xx.diag().iter().enumerate() {
        if !(pivot.abs() > tolerance * max_pivot) {
            return Err(QrError::Singular { column, pivot });
        }
    }
    let rhs = factor.slice(s![..p, p]).to_owned();
    Ok(r_xx.solve_triangular(UPLO::Upper, Diag::NonUnit, &rhs)?)
}
