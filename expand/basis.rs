use super::quadrature::{gauss_legendre, rescale};
use ndarray::{Array, Array1, Array2, ArrayView1, Axis, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Defines the strategy for placing the internal knots of a spline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KnotStrategy {
    /// Place knots uniformly across the data range.
    Uniform,
    /// Place knots at the quantiles of the training data.
    Quantile,
}

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("The knot vector is empty.")]
    EmptyKnots,

    #[error("Knot vector must be finite and non-decreasing, but knot {index} is {value}.")]
    UnsortedKnots { index: usize, value: f64 },

    #[error("Basis index {index} is out of range for {num_basis} basis functions.")]
    BasisIndexOutOfRange { index: usize, num_basis: usize },

    #[error("Data range is invalid: start ({0}) must be less than or equal to end ({1}).")]
    InvalidRange(f64, f64),

    #[error("Quantile strategy requires a non-empty training data set for quantile calculation.")]
    QuantileDataMissing,

    #[error("Cannot compute {num_quantiles} quantiles from only {num_points} data points.")]
    InsufficientDataForQuantiles {
        num_quantiles: usize,
        num_points: usize,
    },

    #[error("Response has {found} values, but the expansion has {expected} rows.")]
    DimensionMismatch { expected: usize, found: usize },
}

/// Number of design columns produced for a knot vector: `len(knots) + 1`.
///
/// Column `j` holds basis function `j` over the knot sequence extended past its
/// right end by repeating the last knot. With `degree + 1` repeated boundary
/// knots the first `len(knots) - degree - 1` columns are the usual clamped
/// basis; the remaining columns have collapsed support and evaluate to zero.
pub fn num_basis_columns(knots: ArrayView1<f64>) -> usize {
    knots.len() + 1
}

/// Evaluates basis function `j` of the given degree at every `x`.
///
/// Uses the Cox-de Boor recursion: degree 0 is the indicator of the half-open
/// interval `[t_j, t_{j+1})`, higher degrees blend two neighbours of the degree
/// below, and a zero knot span contributes nothing.
pub fn bspline(
    x: ArrayView1<f64>,
    knots: ArrayView1<f64>,
    j: usize,
    degree: usize,
) -> Result<Array1<f64>, BasisError> {
    internal::validate_knots(knots)?;
    let num_basis = num_basis_columns(knots);
    if j >= num_basis {
        return Err(BasisError::BasisIndexOutOfRange {
            index: j,
            num_basis,
        });
    }
    Ok(x.mapv(|xi| internal::evaluate_splines_at_point(xi, knots, degree, 0)[j]))
}

/// Evaluates every basis function at every `x`, producing a design matrix of
/// shape `[x.len(), len(knots) + 1]`.
pub fn bs_expand(
    x: ArrayView1<f64>,
    knots: ArrayView1<f64>,
    degree: usize,
) -> Result<Array2<f64>, BasisError> {
    internal::validate_knots(knots)?;
    let mut basis_matrix = Array2::zeros((x.len(), num_basis_columns(knots)));
    for (mut row, &xi) in basis_matrix.axis_iter_mut(Axis(0)).zip(x.iter()) {
        row.assign(&internal::evaluate_splines_at_point(xi, knots, degree, 0));
    }
    Ok(basis_matrix)
}

/// [`bs_expand`] with the response appended as the last column, ready to be
/// streamed into the least-squares solver.
pub fn bs_design(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    knots: ArrayView1<f64>,
    degree: usize,
) -> Result<Array2<f64>, BasisError> {
    if x.len() != y.len() {
        return Err(BasisError::DimensionMismatch {
            expected: x.len(),
            found: y.len(),
        });
    }
    let basis = bs_expand(x, knots, degree)?;
    let k = basis.ncols();
    let mut design = Array2::zeros((x.len(), k + 1));
    design.slice_mut(s![.., ..k]).assign(&basis);
    design.column_mut(k).assign(&y);
    Ok(design)
}

/// Roughness penalty `P[i, j] ≈ ∫ B_i''(x) B_j''(x) dx` over the knot range.
///
/// Each non-empty knot interval is integrated with a `degree`-point
/// Gauss-Legendre rule, which is exact for the piecewise polynomial integrand.
/// Basis functions more than `degree` apart share no interval, so only the band
/// `|i - j| <= degree` is ever filled and every entry outside it is exactly zero.
/// Degrees below 2 have no curvature and yield the zero matrix.
pub fn bs_penalty(knots: ArrayView1<f64>, degree: usize) -> Result<Array2<f64>, BasisError> {
    internal::validate_knots(knots)?;
    let num_basis = num_basis_columns(knots);
    let mut penalty = Array2::<f64>::zeros((num_basis, num_basis));
    if degree < 2 {
        return Ok(penalty);
    }

    let (nodes, weights) = gauss_legendre(degree);
    for k in 0..knots.len() - 1 {
        let (a, b) = (knots[k], knots[k + 1]);
        if b <= a {
            continue;
        }
        // Only B_{k-degree}..B_k are non-zero on [t_k, t_{k+1}).
        let support = k.saturating_sub(degree)..=k;
        for (x, weight) in rescale(&nodes, &weights, a, b) {
            let curvature = internal::evaluate_splines_at_point(x, knots, degree, 2);
            for i in support.clone() {
                for j in i..=k {
                    penalty[[i, j]] += weight * curvature[i] * curvature[j];
                }
            }
        }
    }

    for i in 0..num_basis {
        for j in (i + 1)..num_basis {
            penalty[[j, i]] = penalty[[i, j]];
        }
    }
    Ok(penalty)
}

/// Builds a full knot vector with `degree + 1` repeated boundary knots at each
/// end of `data_range` and `num_internal_knots` knots in between.
///
/// `Quantile` places the internal knots at quantiles of `training_data`, which
/// is required for that strategy and ignored for `Uniform`.
pub fn knot_vector(
    data_range: (f64, f64),
    num_internal_knots: usize,
    degree: usize,
    strategy: KnotStrategy,
    training_data: Option<ArrayView1<f64>>,
) -> Result<Array1<f64>, BasisError> {
    let (min_val, max_val) = data_range;
    if !(min_val <= max_val) {
        return Err(BasisError::InvalidRange(min_val, max_val));
    }

    let internal_knots = match strategy {
        KnotStrategy::Quantile => {
            let data = training_data.ok_or(BasisError::QuantileDataMissing)?;
            if data.is_empty() {
                return Err(BasisError::QuantileDataMissing);
            }
            if data.len() < num_internal_knots {
                return Err(BasisError::InsufficientDataForQuantiles {
                    num_quantiles: num_internal_knots,
                    num_points: data.len(),
                });
            }
            internal::quantiles(data, num_internal_knots)
        }
        KnotStrategy::Uniform => {
            let h = (max_val - min_val) / (num_internal_knots as f64 + 1.0);
            Array::from_iter((1..=num_internal_knots).map(|i| min_val + i as f64 * h))
        }
    };

    let mut knots = Vec::with_capacity(internal_knots.len() + 2 * (degree + 1));
    knots.extend(std::iter::repeat_n(min_val, degree + 1));
    knots.extend(internal_knots.iter().copied());
    knots.extend(std::iter::repeat_n(max_val, degree + 1));
    Ok(Array1::from_vec(knots))
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    pub(super) fn validate_knots(knots: ArrayView1<f64>) -> Result<(), BasisError> {
        if knots.is_empty() {
            return Err(BasisError::EmptyKnots);
        }
        for (index, &value) in knots.iter().enumerate() {
            let ordered = index == 0 || knots[index - 1] <= value;
            if !value.is_finite() || !ordered {
                return Err(BasisError::UnsortedKnots { index, value });
            }
        }
        Ok(())
    }

    /// Knot `i` of the sequence extended to the right by repeating the last knot.
    #[inline]
    fn knot(knots: ArrayView1<f64>, i: usize) -> f64 {
        knots[i.min(knots.len() - 1)]
    }

    /// `numerator / span`, with a zero span contributing nothing.
    #[inline]
    fn over_span(numerator: f64, span: f64) -> f64 {
        if span > 0.0 { numerator / span } else { 0.0 }
    }

    /// Values (or derivatives of order `derivative_order`) of all
    /// `len(knots) + 1` basis functions of `degree` at a single point.
    ///
    /// Starts from the degree-0 indicators, raises them to
    /// `degree - derivative_order` with the Cox-de Boor recurrence, then applies
    /// `B'_{i,k} = k (B_{i,k-1} / (t_{i+k} - t_i) - B_{i+1,k-1} / (t_{i+k+1} - t_{i+1}))`
    /// once per derivative order. Every pass shortens the table by one entry.
    pub(super) fn evaluate_splines_at_point(
        x: f64,
        knots: ArrayView1<f64>,
        degree: usize,
        derivative_order: usize,
    ) -> Array1<f64> {
        let num_basis = num_basis_columns(knots);
        if derivative_order > degree {
            return Array1::zeros(num_basis);
        }
        let t = |i: usize| knot(knots, i);
        let base_degree = degree - derivative_order;

        let mut values: Vec<f64> = (0..num_basis + degree)
            .map(|i| if t(i) <= x && x < t(i + 1) { 1.0 } else { 0.0 })
            .collect();

        for k in 1..=base_degree {
            values = (0..values.len() - 1)
                .map(|i| {
                    over_span(x - t(i), t(i + k) - t(i)) * values[i]
                        + over_span(t(i + k + 1) - x, t(i + k + 1) - t(i + 1)) * values[i + 1]
                })
                .collect();
        }

        for k in (base_degree + 1)..=degree {
            values = (0..values.len() - 1)
                .map(|i| {
                    k as f64
                        * (over_span(values[i], t(i + k) - t(i))
                            - over_span(values[i + 1], t(i + k + 1) - t(i + 1)))
                })
                .collect();
        }

        Array1::from_vec(values)
    }

    /// Calculates quantiles from a data vector using linear interpolation (Type 7 in R).
    pub(super) fn quantiles(data: ArrayView1<f64>, num_quantiles: usize) -> Array1<f64> {
        let mut sorted_data = data.to_vec();
        sorted_data.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let n = sorted_data.len();
        (1..=num_quantiles)
            .map(|k| {
                let p = k as f64 / (num_quantiles as f64 + 1.0);
                let float_idx = (n as f64 - 1.0) * p;
                let lower_idx = float_idx.floor() as usize;
                let upper_idx = float_idx.ceil() as usize;
                let fraction = float_idx - lower_idx as f64;
                sorted_data[lower_idx] * (1.0 - fraction) + sorted_data[upper_idx] * fraction
            })
            .collect()
    }
}
