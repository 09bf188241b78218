//! Streaming QR factorization and the least-squares solver built on it.
//!
//! The reducer folds matrix chunks into an upper-triangular factor, the driver
//! applies it over an iterator (or a rayon reduction tree), and the solver
//! recovers coefficients and fit statistics from the final factor alone.

use thiserror::Error;

pub mod lstsq;
pub mod mapreduce;
pub mod penalty;
pub mod reduce;

pub use lstsq::{ConstantColumns, LeastSquaresSolver, RegressionResult, ResponseMoments, lm_solve_qr};
pub use mapreduce::{mapreduce_qr, mapreduce_qr_parallel, try_mapreduce_qr};
pub use penalty::Penalty;
pub use reduce::{QrAccumulator, merge, qr_mapped, reduce};

/// Errors raised by the reducer, the map-reduce driver and the solver.
#[derive(Error, Debug)]
pub enum QrError {
    #[error("Chunk has {found} columns, but earlier chunks had {expected}.")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("The chunk sequence was empty; no factor can be produced.")]
    EmptyInput,

    #[error(
        "Design is rank deficient: pivot {pivot:.3e} at column {column} is numerically zero. \
         Regularize the fit and retry."
    )]
    Singular { column: usize, pivot: f64 },

    #[error("Column {column} was requested, but the chunk only has {ncols} columns.")]
    ColumnOutOfRange { column: usize, ncols: usize },

    #[error("The chunk carries no design columns besides the response and weight.")]
    NoDesignColumns,

    #[error("Row {row} has weight {value}; weights must be finite and non-negative.")]
    InvalidWeight { row: usize, value: f64 },

    #[error("Invalid penalty: {0}")]
    InvalidPenalty(String),

    #[error("LAPACK routine failed: {0}")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),
}
