use super::family::{FamilyError, LinkFamily};
use crate::config::FitConfig;
use crate::qr::{LeastSquaresSolver, Penalty, QrAccumulator, QrError, ResponseMoments, reduce};
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use ndarray_linalg::{Diag, SolveTriangular, UPLO};
use std::borrow::Borrow;
use thiserror::Error;

/// A comprehensive error type for the IRLS driver.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Streaming least-squares step failed: {0}")]
    QrError(#[from] QrError),

    #[error("Family evaluation failed: {0}")]
    FamilyError(#[from] FamilyError),

    #[error(
        "Penalized deviance became non-finite ({deviance}) at iteration {iteration}. \
         The fit is likely diverging; consider adding a penalty."
    )]
    NonFiniteDeviance { iteration: usize, deviance: f64 },
}

/// The status of IRLS convergence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrlsStatus {
    /// The relative change in penalized deviance fell below the tolerance.
    Converged,
    /// Ran out of iterations; the last evaluated coefficients are returned.
    MaxIterationsReached,
}

/// Result of a streaming GLM fit.
#[derive(Debug, Clone)]
pub struct GlmFit {
    /// One coefficient per design column, in chunk column order (response removed).
    pub coefficients: Array1<f64>,
    /// Unpenalized deviance at `coefficients`.
    pub deviance: f64,
    /// `βᵀ S β` at `coefficients`; zero without a penalty.
    pub penalty_term: f64,
    /// Passes over the data after the initializing pass.
    pub iterations: usize,
    pub status: IrlsStatus,
    /// Factor of the working least-squares problem at `coefficients`, laid out
    /// like [`RegressionResult::factor`](crate::qr::RegressionResult::factor).
    pub factor: Array2<f64>,
}

impl GlmFit {
    /// Square roots of the diagonal of `(XᵀWX + S)⁻¹`, i.e. standard errors
    /// under unit dispersion.
    pub fn standard_errors(&self) -> Result<Array1<f64>, QrError> {
        let p = self.coefficients.len();
        let r_inv = self
            .factor
            .slice(s![..p, ..p])
            .to_owned()
            .solve_triangular(UPLO::Upper, Diag::NonUnit, &Array2::<f64>::eye(p))?;
        Ok(r_inv.map_axis(Axis(1), |row| row.dot(&row).sqrt()))
    }
}

/// Fits a generalized linear model by iteratively reweighted least squares,
/// streaming the data once per iteration.
///
/// `source` is called once per pass and must yield the same chunks each time.
/// Every chunk holds the design columns plus the response at
/// `response_column`. The first pass starts from the family's initial mean;
/// each later pass evaluates the penalized deviance at the current
/// coefficients and solves the weighted (and optionally penalized) working
/// problem with the streaming QR solver for the next ones.
pub fn fit_glm<F, I, M>(
    mut source: F,
    family: LinkFamily,
    response_column: usize,
    penalty: Option<&Penalty>,
    config: &FitConfig,
) -> Result<GlmFit, EstimationError>
where
    F: FnMut() -> I,
    I: IntoIterator<Item = M>,
    M: Borrow<Array2<f64>>,
{
    let irls = &config.irls;
    // Working chunks are laid out as [z | w | design].
    let mut solver = LeastSquaresSolver::new(0, config).with_weights(1);
    if let Some(penalty) = penalty {
        solver = solver.with_penalty(penalty)?;
    }

    log::info!(
        "Starting IRLS for {:?} (max {} iterations, tolerance {:.1e})",
        family,
        irls.max_iterations,
        irls.tolerance
    );

    let initial = run_pass(&mut source, &solver, family, response_column, None, config)?;
    let mut previous_deviance = initial.deviance;
    let mut beta = initial.next_coefficients;
    log::debug!("Initial deviance from starting mean: {:.6}", previous_deviance);

    let mut iteration = 0;
    loop {
        iteration += 1;
        let pass = run_pass(&mut source, &solver, family, response_column, Some(&beta), config)?;
        let penalty_term = penalty.map_or(0.0, |p| p.quadratic_form(beta.view()));
        let penalized = pass.deviance + penalty_term;
        if !penalized.is_finite() {
            return Err(EstimationError::NonFiniteDeviance {
                iteration,
                deviance: penalized,
            });
        }

        let change = (penalized - previous_deviance).abs() / (penalized.abs() + 0.1);
        log::info!(
            "IRLS iteration {}: deviance {:.6}, penalized {:.6}, relative change {:.3e}",
            iteration,
            pass.deviance,
            penalized,
            change
        );

        let status = if change < irls.tolerance {
            Some(IrlsStatus::Converged)
        } else if iteration >= irls.max_iterations {
            log::warn!(
                "IRLS did not converge after {} iterations (relative change {:.3e})",
                iteration,
                change
            );
            Some(IrlsStatus::MaxIterationsReached)
        } else {
            None
        };

        if let Some(status) = status {
            return Ok(GlmFit {
                coefficients: beta,
                deviance: pass.deviance,
                penalty_term,
                iterations: iteration,
                status,
                factor: pass.factor,
            });
        }

        previous_deviance = penalized;
        beta = pass.next_coefficients;
    }
}

struct Pass {
    /// Deviance of the mean the pass was evaluated at.
    deviance: f64,
    next_coefficients: Array1<f64>,
    factor: Array2<f64>,
}

fn run_pass<F, I, M>(
    source: &mut F,
    solver: &LeastSquaresSolver,
    family: LinkFamily,
    response_column: usize,
    beta: Option<&Array1<f64>>,
    config: &FitConfig,
) -> Result<Pass, EstimationError>
where
    F: FnMut() -> I,
    I: IntoIterator<Item = M>,
    M: Borrow<Array2<f64>>,
{
    let mut state = QrAccumulator::Empty;
    let mut moments = ResponseMoments::default();
    let mut deviance = 0.0;

    for chunk in source() {
        let (working, chunk_deviance) =
            working_chunk(chunk.borrow().view(), family, response_column, beta, config)?;
        deviance += chunk_deviance;
        let prepared = solver.prepare(working.view(), &mut moments)?;
        state = reduce(state, prepared.view(), config.threshold)?;
    }

    let fit = solver.finish(state, moments)?;
    Ok(Pass {
        deviance,
        next_coefficients: fit.coefficients,
        factor: fit.factor,
    })
}

/// Builds `[z | w | design]` for one chunk and returns its deviance contribution.
fn working_chunk(
    chunk: ArrayView2<f64>,
    family: LinkFamily,
    response_column: usize,
    beta: Option<&Array1<f64>>,
    config: &FitConfig,
) -> Result<(Array2<f64>, f64), EstimationError> {
    let ncols = chunk.ncols();
    if response_column >= ncols {
        return Err(QrError::ColumnOutOfRange {
            column: response_column,
            ncols,
        }
        .into());
    }
    let design_columns: Vec<usize> = (0..ncols).filter(|&c| c != response_column).collect();
    let design = chunk.select(Axis(1), &design_columns);
    let y = chunk.column(response_column);

    let eta = match beta {
        Some(beta) => {
            if beta.len() != design.ncols() {
                return Err(QrError::DimensionMismatch {
                    expected: beta.len(),
                    found: design.ncols(),
                }
                .into());
            }
            design.dot(beta)
        }
        None => y.mapv(|v| family.link(family.initial_mu(v))),
    };

    let info = family.info(eta.view(), y)?;
    let deviance = family.deviance(y, info.mu.view())?;

    let p = design.ncols();
    let mut working = Array2::zeros((chunk.nrows(), p + 2));
    working.slice_mut(s![.., 2..]).assign(&design);
    for (i, mut row) in working.axis_iter_mut(Axis(0)).enumerate() {
        let z = eta[i] + (info.y[i] - info.mu[i]) * info.detadmu[i];
        let w = info.dmudeta[i] * info.dmudeta[i] / info.vary[i];
        // A saturated mean carries no curvature; keep its row but hold it in place.
        let (z, w) = if z.is_finite() && w.is_finite() {
            (z, w.max(config.irls.min_weight))
        } else {
            (eta[i], config.irls.min_weight)
        };
        row[0] = z;
        row[1] = w;
    }
    Ok((working, deviance))
}
