use super::QrError;
use ndarray::{Array2, ArrayView2, Axis, concatenate};
use ndarray_linalg::QR;

/// The running state of a streaming QR fold.
///
/// Both non-empty variants are interpreted as rows: a retained `Rows` stack is
/// the raw data seen so far, a `Factor` is an R factor whose Gram matrix equals
/// the Gram matrix of everything it absorbed. Stacking either on top of new rows
/// and re-factoring yields the R factor of the union, which makes [`merge`]
/// associative and commutative up to the sign of each factor row.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum QrAccumulator {
    #[default]
    Empty,
    /// Raw rows retained while the stack is at most `threshold` rows tall.
    Rows(Array2<f64>),
    /// Upper-triangular (upper-trapezoidal when it saw fewer rows than columns)
    /// factor with a non-negative diagonal.
    Factor(Array2<f64>),
}

impl QrAccumulator {
    /// Number of columns, or `None` for an empty accumulator.
    pub fn ncols(&self) -> Option<usize> {
        self.view().map(|m| m.ncols())
    }

    /// Rows currently held in memory.
    pub fn nrows(&self) -> usize {
        self.view().map_or(0, |m| m.nrows())
    }

    pub fn is_factor(&self) -> bool {
        matches!(self, Self::Factor(_))
    }

    pub fn view(&self) -> Option<ArrayView2<'_, f64>> {
        match self {
            Self::Empty => None,
            Self::Rows(m) | Self::Factor(m) => Some(m.view()),
        }
    }

    pub fn into_matrix(self) -> Option<Array2<f64>> {
        match self {
            Self::Empty => None,
            Self::Rows(m) | Self::Factor(m) => Some(m),
        }
    }

    /// Finalizes the accumulator into an R factor, triangularizing any rows
    /// that were still being retained.
    pub fn into_factor(self) -> Result<Array2<f64>, QrError> {
        match self {
            Self::Empty => Err(QrError::EmptyInput),
            Self::Rows(m) => triangularize(m),
            Self::Factor(r) => Ok(r),
        }
    }
}

/// Folds one incoming chunk into the accumulated state.
///
/// The accumulated rows (raw or factor) are stacked on top of `incoming`. A
/// stack of at most `threshold` rows is returned unchanged; a taller stack is
/// QR-factored and only its R factor is kept.
pub fn reduce(
    accumulated: QrAccumulator,
    incoming: ArrayView2<f64>,
    threshold: usize,
) -> Result<QrAccumulator, QrError> {
    let stack = match accumulated {
        QrAccumulator::Empty => incoming.to_owned(),
        QrAccumulator::Rows(top) | QrAccumulator::Factor(top) => stack_rows(top.view(), incoming)?,
    };
    collapse(stack, threshold)
}

/// Combines two partial results, e.g. the outputs of two independent folds.
/// `Empty` is the identity on either side.
pub fn merge(
    left: QrAccumulator,
    right: QrAccumulator,
    threshold: usize,
) -> Result<QrAccumulator, QrError> {
    match (left, right) {
        (QrAccumulator::Empty, other) | (other, QrAccumulator::Empty) => match other {
            QrAccumulator::Rows(m) => collapse(m, threshold),
            settled => Ok(settled),
        },
        (left, right) => match (left.view(), right.view()) {
            (Some(top), Some(bottom)) => collapse(stack_rows(top, bottom)?, threshold),
            _ => Err(QrError::EmptyInput),
        },
    }
}

/// The map step: a single chunk reduced against an empty accumulator.
pub fn qr_mapped(chunk: ArrayView2<f64>, threshold: usize) -> Result<QrAccumulator, QrError> {
    reduce(QrAccumulator::Empty, chunk, threshold)
}

fn stack_rows(top: ArrayView2<f64>, bottom: ArrayView2<f64>) -> Result<Array2<f64>, QrError> {
    if top.ncols() != bottom.ncols() {
        return Err(QrError::DimensionMismatch {
            expected: top.ncols(),
            found: bottom.ncols(),
        });
    }
    concatenate(Axis(0), &[top.view(), bottom.view()]).map_err(|_| QrError::DimensionMismatch {
        expected: top.ncols(),
        found: bottom.ncols(),
    })
}

fn collapse(stack: Array2<f64>, threshold: usize) -> Result<QrAccumulator, QrError> {
    if stack.nrows() <= threshold {
        return Ok(QrAccumulator::Rows(stack));
    }
    let rows = stack.nrows();
    let factor = triangularize(stack)?;
    log::trace!(
        "Collapsed {} rows into a {}x{} factor",
        rows,
        factor.nrows(),
        factor.ncols()
    );
    Ok(QrAccumulator::Factor(factor))
}

/// R factor of `m` with its diagonal made non-negative. Flipping a row of R
/// is the same as flipping a column of the discarded Q, so the factor stays
/// valid and becomes unique for full-rank input.
pub(crate) fn triangularize(m: Array2<f64>) -> Result<Array2<f64>, QrError> {
    if m.nrows() == 0 || m.ncols() == 0 {
        return Ok(m);
    }
    let (_, mut r) = m.qr()?;
    for (i, mut row) in r.axis_iter_mut(Axis(0)).enumerate() {
        if row[i] < 0.0 {
            row.mapv_inplace(|v| -v);
        }
    }
    Ok(r)
}
