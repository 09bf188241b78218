//! GLM link families and the streaming IRLS driver.

pub mod family;
pub mod irls;

pub use family::{
    FamilyError, FamilyInfo, LinkFamily, binomial_logistic_family, normal_identity_family,
    poisson_log_family, poisson_softrelu_family,
};
pub use irls::{EstimationError, GlmFit, IrlsStatus, fit_glm};
