use ndarray::{Array1, ArrayView1, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FamilyError {
    #[error("Linear predictor has {expected} values, but the response has {found}.")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Response value {value} at index {index} is outside the support of the {family:?} family.")]
    InvalidResponse {
        family: LinkFamily,
        index: usize,
        value: f64,
    },

    #[error(
        "dη/dμ ({detadmu}) is not the reciprocal of dμ/dη ({dmudeta}) at index {index}; \
         relative error {relative_error:.3e}."
    )]
    ReciprocalMismatch {
        index: usize,
        dmudeta: f64,
        detadmu: f64,
        relative_error: f64,
    },
}

/// An exponential-family distribution paired with its link function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFamily {
    /// Gaussian response, `μ = η`.
    NormalIdentity,
    /// Bernoulli/binomial proportion, `μ = 1 / (1 + exp(-η))`.
    BinomialLogistic,
    /// Poisson count, `μ = exp(η)`.
    PoissonLog,
    /// Poisson count, `μ = log(1 + exp(η))`. Grows linearly instead of
    /// exponentially for large `η`.
    PoissonSoftRelu,
}

/// Per-observation quantities IRLS needs at the current linear predictor.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyInfo {
    pub y: Array1<f64>,
    pub mu: Array1<f64>,
    pub dmudeta: Array1<f64>,
    pub detadmu: Array1<f64>,
    pub vary: Array1<f64>,
}

impl FamilyInfo {
    /// Checks `dη/dμ · dμ/dη = 1` for every observation, within `rel_tol`.
    pub fn verify_reciprocal(&self, rel_tol: f64) -> Result<(), FamilyError> {
        for (index, (&dmudeta, &detadmu)) in self.dmudeta.iter().zip(self.detadmu.iter()).enumerate() {
            let relative_error = (dmudeta * detadmu - 1.0).abs();
            if !(relative_error <= rel_tol) {
                return Err(FamilyError::ReciprocalMismatch {
                    index,
                    dmudeta,
                    detadmu,
                    relative_error,
                });
            }
        }
        Ok(())
    }
}

impl LinkFamily {
    /// Evaluates the family at every `(η, y)` pair. `y` is carried through
    /// untouched.
    pub fn info(self, eta: ArrayView1<f64>, y: ArrayView1<f64>) -> Result<FamilyInfo, FamilyError> {
        if eta.len() != y.len() {
            return Err(FamilyError::DimensionMismatch {
                expected: eta.len(),
                found: y.len(),
            });
        }
        let mu = eta.mapv(|e| self.inverse_link(e));
        let dmudeta = eta.mapv(|e| self.dmudeta(e));
        let detadmu = eta.mapv(|e| self.detadmu(e));
        let vary = mu.mapv(|m| self.variance(m));
        Ok(FamilyInfo {
            y: y.to_owned(),
            mu,
            dmudeta,
            detadmu,
            vary,
        })
    }

    /// `μ = g⁻¹(η)`.
    pub fn inverse_link(self, eta: f64) -> f64 {
        match self {
            LinkFamily::NormalIdentity => eta,
            LinkFamily::BinomialLogistic => 1.0 / (1.0 + (-eta).exp()),
            LinkFamily::PoissonLog => eta.exp(),
            LinkFamily::PoissonSoftRelu => softplus(eta),
        }
    }

    /// `η = g(μ)`.
    pub fn link(self, mu: f64) -> f64 {
        match self {
            LinkFamily::NormalIdentity => mu,
            LinkFamily::BinomialLogistic => (mu / (1.0 - mu)).ln(),
            LinkFamily::PoissonLog => mu.ln(),
            // log(exp(μ) - 1) without overflowing for large μ.
            LinkFamily::PoissonSoftRelu => mu + (-(-mu).exp_m1()).ln(),
        }
    }

    pub fn dmudeta(self, eta: f64) -> f64 {
        match self {
            LinkFamily::NormalIdentity => 1.0,
            LinkFamily::BinomialLogistic => {
                let e = (-eta.abs()).exp();
                e / ((1.0 + e) * (1.0 + e))
            }
            LinkFamily::PoissonLog => eta.exp(),
            LinkFamily::PoissonSoftRelu => 1.0 / (1.0 + (-eta).exp()),
        }
    }

    /// `dη/dμ` as a function of `η`, the reciprocal of [`dmudeta`](Self::dmudeta).
    pub fn detadmu(self, eta: f64) -> f64 {
        match self {
            LinkFamily::NormalIdentity => 1.0,
            LinkFamily::BinomialLogistic => {
                let e = (-eta.abs()).exp();
                2.0 + e + 1.0 / e
            }
            LinkFamily::PoissonLog => (-eta).exp(),
            LinkFamily::PoissonSoftRelu => 1.0 + (-eta).exp(),
        }
    }

    /// The variance function `V(μ)`.
    pub fn variance(self, mu: f64) -> f64 {
        match self {
            LinkFamily::NormalIdentity => 1.0,
            LinkFamily::BinomialLogistic => mu * (1.0 - mu),
            LinkFamily::PoissonLog | LinkFamily::PoissonSoftRelu => mu,
        }
    }

    /// Starting mean for the first IRLS pass, strictly inside the family's
    /// mean domain for any valid response.
    pub fn initial_mu(self, y: f64) -> f64 {
        match self {
            LinkFamily::NormalIdentity => y,
            LinkFamily::BinomialLogistic => (y + 0.5) / 2.0,
            LinkFamily::PoissonLog | LinkFamily::PoissonSoftRelu => y + 0.1,
        }
    }

    pub fn is_valid_response(self, y: f64) -> bool {
        match self {
            LinkFamily::NormalIdentity => y.is_finite(),
            LinkFamily::BinomialLogistic => (0.0..=1.0).contains(&y),
            LinkFamily::PoissonLog | LinkFamily::PoissonSoftRelu => y.is_finite() && y >= 0.0,
        }
    }

    /// Contribution of one observation to the deviance.
    pub fn unit_deviance(self, y: f64, mu: f64) -> f64 {
        match self {
            LinkFamily::NormalIdentity => (y - mu) * (y - mu),
            LinkFamily::BinomialLogistic => {
                2.0 * (xlogy(y, y / mu) + xlogy(1.0 - y, (1.0 - y) / (1.0 - mu)))
            }
            LinkFamily::PoissonLog | LinkFamily::PoissonSoftRelu => {
                2.0 * (xlogy(y, y / mu) - (y - mu))
            }
        }
    }

    /// Total deviance `Σ d(y_i, μ_i)`.
    pub fn deviance(self, y: ArrayView1<f64>, mu: ArrayView1<f64>) -> Result<f64, FamilyError> {
        if y.len() != mu.len() {
            return Err(FamilyError::DimensionMismatch {
                expected: mu.len(),
                found: y.len(),
            });
        }
        if let Some((index, &value)) = y.iter().enumerate().find(|&(_, &v)| !self.is_valid_response(v)) {
            return Err(FamilyError::InvalidResponse {
                family: self,
                index,
                value,
            });
        }
        Ok(Zip::from(y)
            .and(mu)
            .fold(0.0, |acc, &yi, &mui| acc + self.unit_deviance(yi, mui)))
    }
}

/// `log(1 + exp(x))` without overflow.
fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// `x · ln(r)` with the convention `0 · ln(anything) = 0`.
fn xlogy(x: f64, r: f64) -> f64 {
    if x == 0.0 { 0.0 } else { x * r.ln() }
}

pub fn normal_identity_family(eta: ArrayView1<f64>, y: ArrayView1<f64>) -> Result<FamilyInfo, FamilyError> {
    LinkFamily::NormalIdentity.info(eta, y)
}

pub fn binomial_logistic_family(eta: ArrayView1<f64>, y: ArrayView1<f64>) -> Result<FamilyInfo, FamilyError> {
    LinkFamily::BinomialLogistic.info(eta, y)
}

pub fn poisson_log_family(eta: ArrayView1<f64>, y: ArrayView1<f64>) -> Result<FamilyInfo, FamilyError> {
    LinkFamily::PoissonLog.info(eta, y)
}

pub fn poisson_softrelu_family(eta: ArrayView1<f64>, y: ArrayView1<f64>) -> Result<FamilyInfo, FamilyError> {
    LinkFamily::PoissonSoftRelu.info(eta, y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn logistic(x: f64) -> f64 {
        1.0 / (1.0 + (-x).exp())
    }

    fn ilogistic(y: f64) -> f64 {
        (y / (1.0 - y)).ln()
    }

    fn softrelu(x: f64) -> f64 {
        x.exp().ln_1p()
    }

    fn isoftrelu(y: f64) -> f64 {
        (y.exp() - 1.0).ln()
    }

    /// Forward difference, matching how the derivative identities are
    /// checked against a numerically differentiated link.
    fn numerical_derivative(f: impl Fn(f64) -> f64, x: &Array1<f64>) -> Array1<f64> {
        let h = 1e-5;
        x.mapv(|v| (f(v + h) - f(v)) / h)
    }

    fn eta() -> Array1<f64> {
        array![-1.0, 0.0, 1.0]
    }

    fn assert_arrays_close(actual: &Array1<f64>, expected: &Array1<f64>, epsilon: f64) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *e, epsilon = epsilon);
        }
    }

    fn check_info(
        info: &FamilyInfo,
        y: &Array1<f64>,
        mu: &Array1<f64>,
        dmudeta: &Array1<f64>,
        detadmu: &Array1<f64>,
        vary: &Array1<f64>,
    ) {
        assert_eq!(&info.y, y);
        assert_arrays_close(&info.mu, mu, 1e-12);
        assert_arrays_close(&info.dmudeta, dmudeta, 1e-4);
        assert_arrays_close(&info.detadmu, detadmu, 1e-4);
        assert_arrays_close(&info.vary, vary, 1e-7);
        info.verify_reciprocal(1e-4).unwrap();
    }

    #[test]
    fn test_normal_identity_family() {
        let eta = eta();
        let y = Array1::zeros(3);
        let info = normal_identity_family(eta.view(), y.view()).unwrap();
        let ones = Array1::ones(3);
        assert_eq!(info.mu, eta);
        check_info(&info, &y, &eta, &ones, &ones, &ones);
    }

    #[test]
    fn test_binomial_logistic_family() {
        let eta = eta();
        let y = array![0.0, 1.0, 0.0];
        let info = binomial_logistic_family(eta.view(), y.view()).unwrap();
        let mu = eta.mapv(logistic);
        let dmudeta = numerical_derivative(logistic, &eta);
        let detadmu = numerical_derivative(ilogistic, &mu);
        let vary = mu.mapv(|m| m * (1.0 - m));
        check_info(&info, &y, &mu, &dmudeta, &detadmu, &vary);
    }

    #[test]
    fn test_poisson_log_family() {
        let eta = eta();
        let y = Array1::zeros(3);
        let info = poisson_log_family(eta.view(), y.view()).unwrap();
        let mu = eta.mapv(f64::exp);
        let dmudeta = numerical_derivative(f64::exp, &eta);
        let detadmu = numerical_derivative(f64::ln, &mu);
        check_info(&info, &y, &mu, &dmudeta, &detadmu, &mu);
    }

    #[test]
    fn test_poisson_softrelu_family() {
        let eta = eta();
        let y = Array1::zeros(3);
        let info = poisson_softrelu_family(eta.view(), y.view()).unwrap();
        let mu = eta.mapv(softrelu);
        let dmudeta = numerical_derivative(softrelu, &eta);
        let detadmu = numerical_derivative(isoftrelu, &mu);
        check_info(&info, &y, &mu, &dmudeta, &detadmu, &mu);
        assert_arrays_close(&mu.mapv(isoftrelu), &eta, 1e-12);
    }

    #[test]
    fn test_link_inverts_inverse_link() {
        let families = [
            LinkFamily::NormalIdentity,
            LinkFamily::BinomialLogistic,
            LinkFamily::PoissonLog,
            LinkFamily::PoissonSoftRelu,
        ];
        for family in families {
            for eta in [-8.0, -1.5, 0.0, 0.3, 4.0, 12.0] {
                let mu = family.inverse_link(eta);
                assert_abs_diff_eq!(family.link(mu), eta, epsilon = 1e-6);
            }
        }
        // Far in the tails the stable forms keep finite, exact-to-rounding values.
        assert_abs_diff_eq!(LinkFamily::PoissonSoftRelu.inverse_link(800.0), 800.0);
        assert!(LinkFamily::BinomialLogistic.dmudeta(-800.0) >= 0.0);
    }

    #[test]
    fn test_deviance_values() {
        let y = array![0.0, 1.0, 3.0];
        let mu = array![0.5, 1.0, 2.0];
        let poisson = LinkFamily::PoissonLog.deviance(y.view(), mu.view()).unwrap();
        // 2 * [0.5 + 0 + (3 ln 1.5 - 1)]
        assert_abs_diff_eq!(poisson, 2.0 * (0.5 + 3.0 * 1.5f64.ln() - 1.0), epsilon = 1e-12);

        let y = array![0.0, 1.0];
        let mu = array![0.2, 0.8];
        let binomial = LinkFamily::BinomialLogistic.deviance(y.view(), mu.view()).unwrap();
        assert_abs_diff_eq!(binomial, -4.0 * 0.8f64.ln(), epsilon = 1e-12);

        let normal = LinkFamily::NormalIdentity.deviance(y.view(), mu.view()).unwrap();
        assert_abs_diff_eq!(normal, 0.08, epsilon = 1e-12);

        let counts = array![2.0, 5.0];
        let perfect = LinkFamily::PoissonSoftRelu.deviance(counts.view(), counts.view()).unwrap();
        assert_eq!(perfect, 0.0);
    }

    #[test]
    fn test_initial_mu_is_inside_the_domain() {
        for y in [0.0, 1.0] {
            let mu = LinkFamily::BinomialLogistic.initial_mu(y);
            assert!(mu > 0.0 && mu < 1.0);
            assert!(LinkFamily::BinomialLogistic.link(mu).is_finite());
        }
        for family in [LinkFamily::PoissonLog, LinkFamily::PoissonSoftRelu] {
            assert!(family.link(family.initial_mu(0.0)).is_finite());
        }
    }

    #[test]
    fn test_error_conditions() {
        let eta = eta();
        match poisson_log_family(eta.view(), array![1.0].view()).unwrap_err() {
            FamilyError::DimensionMismatch { expected, found } => {
                assert_eq!(expected, 3);
                assert_eq!(found, 1);
            }
            other => panic!("Expected DimensionMismatch error, got {other:?}"),
        }

        match LinkFamily::BinomialLogistic
            .deviance(array![0.0, 2.0].view(), array![0.5, 0.5].view())
            .unwrap_err()
        {
            FamilyError::InvalidResponse { index, value, .. } => {
                assert_eq!(index, 1);
                assert_eq!(value, 2.0);
            }
            other => panic!("Expected InvalidResponse error, got {other:?}"),
        }

        let mut info = binomial_logistic_family(eta.view(), array![0.0, 1.0, 0.0].view()).unwrap();
        info.detadmu[2] *= 1.01;
        assert!(matches!(
            info.verify_reciprocal(1e-4).unwrap_err(),
            FamilyError::ReciprocalMismatch { index: 2, .. }
        ));
    }
}
