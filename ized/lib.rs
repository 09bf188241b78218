#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! Out-of-core fitting of (penalized, weighted) linear and generalized linear
//! models.
//!
//! Rows arrive as a stream of matrix chunks. [`qr`] folds them into a single
//! upper-triangular factor without ever holding the stacked matrix, solves the
//! least-squares problem from that factor, and reports goodness of fit.
//! [`expand`] builds B-spline design matrices and their roughness penalties,
//! and [`glm`] supplies link families plus an IRLS driver that reuses the
//! streaming solver once per iteration.

pub mod config;

#[path = "../qr/mod.rs"]
pub mod qr;

#[path = "../expand/mod.rs"]
pub mod expand;

#[path = "../glm/mod.rs"]
pub mod glm;

pub use config::{ConfigError, FitConfig, IrlsConfig};
