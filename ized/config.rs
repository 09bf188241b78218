use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rows retained verbatim before the reducer collapses them into a fresh factor.
pub const DEFAULT_THRESHOLD: usize = 4096;

/// Errors raised while parsing or validating a [`FitConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Settings for the iteratively reweighted least squares driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrlsConfig {
    /// Maximum number of passes over the chunk source.
    pub max_iterations: usize,
    /// Relative change in penalized deviance below which the fit has converged.
    pub tolerance: f64,
    /// Floor applied to working weights so near-degenerate rows keep a footprint.
    pub min_weight: f64,
}

impl Default for IrlsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            tolerance: 1e-8,
            min_weight: 1e-10,
        }
    }
}

/// The complete set of tunables for streaming fits.
///
/// Serializes to a small TOML document:
///
/// ```toml
/// threshold = 4096
/// singular_tolerance = 1e-10
///
/// [irls]
/// max_iterations = 25
/// tolerance = 1e-8
/// min_weight = 1e-10
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Row count above which accumulated rows are re-triangularized.
    /// Larger values trade peak memory for fewer factorizations.
    pub threshold: usize,
    /// A pivot `|R_ii|` at or below `singular_tolerance * max_j |R_jj|` marks
    /// the design as rank deficient.
    pub singular_tolerance: f64,
    pub irls: IrlsConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            singular_tolerance: 1e-10,
            irls: IrlsConfig::default(),
        }
    }
}

impl FitConfig {
    /// Convenience constructor overriding only the reduction threshold.
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    /// Parses and validates a configuration from TOML text. Missing keys fall
    /// back to their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_tolerance("singular_tolerance", self.singular_tolerance)?;
        check_tolerance("irls.tolerance", self.irls.tolerance)?;
        if !(self.irls.min_weight.is_finite() && self.irls.min_weight >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "irls.min_weight",
                reason: format!("must be finite and non-negative, got {}", self.irls.min_weight),
            });
        }
        if self.irls.max_iterations == 0 {
            return Err(ConfigError::Invalid {
                field: "irls.max_iterations",
                reason: "at least one iteration is required".to_string(),
            });
        }
        Ok(())
    }
}

fn check_tolerance(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("must be finite and positive, got {value}"),
        })
    }
}
