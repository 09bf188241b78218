//! B-spline basis expansion and roughness penalties.

pub mod basis;
pub mod quadrature;

pub use basis::{
    BasisError, KnotStrategy, bs_design, bs_expand, bs_penalty, bspline, knot_vector,
    num_basis_columns,
};
pub use quadrature::gauss_legendre;
