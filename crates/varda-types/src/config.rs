// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Assimilation Configuration
// ─────────────────────────────────────────────────────────────────────

use std::fmt;
use std::str::FromStr;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{VardaError, VardaResult};

/// How the full state space is compressed into the latent space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionMethod {
    /// Truncated SVD of the snapshot matrix.
    #[serde(alias = "SVD")]
    Linear,
    /// Encoder/decoder pair supplied by the caller.
    #[serde(alias = "AE")]
    Nonlinear,
}

impl FromStr for CompressionMethod {
    type Err = VardaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LINEAR" | "SVD" => Ok(CompressionMethod::Linear),
            "NONLINEAR" | "AE" => Ok(CompressionMethod::Nonlinear),
            other => Err(VardaError::InvalidConfiguration(format!(
                "compression must be one of {{LINEAR, NONLINEAR}}, got {other:?}"
            ))),
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionMethod::Linear => f.write_str("LINEAR"),
            CompressionMethod::Nonlinear => f.write_str("NONLINEAR"),
        }
    }
}

/// Where the decoder Jacobian comes from. Decided once, when the
/// reduction operator is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JacobianMode {
    /// Closed-form Jacobian from the model; missing one is an error.
    Explicit,
    /// Central differences over `decode` (k+1 decodes per column pair).
    NumericalFallback,
    /// Explicit when the model has one, numerical fallback otherwise.
    Auto,
}

impl FromStr for JacobianMode {
    type Err = VardaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EXPLICIT" => Ok(JacobianMode::Explicit),
            "NUMERICAL_FALLBACK" | "NUMERICAL" => Ok(JacobianMode::NumericalFallback),
            "AUTO" => Ok(JacobianMode::Auto),
            other => Err(VardaError::InvalidConfiguration(format!(
                "jacobian must be one of {{EXPLICIT, NUMERICAL_FALLBACK, AUTO}}, got {other:?}"
            ))),
        }
    }
}

/// Cold-start policy for the reduced state w₀.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitialGuess {
    /// Linear: V⁺_trunc·(u₀ − baseline). Nonlinear: encode(u₀).
    Projection,
    /// w₀ = 0, the minimiser of the background term.
    Zero,
}

impl FromStr for InitialGuess {
    type Err = VardaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PROJECTION" => Ok(InitialGuess::Projection),
            "ZERO" => Ok(InitialGuess::Zero),
            other => Err(VardaError::InvalidConfiguration(format!(
                "initial_guess must be one of {{PROJECTION, ZERO}}, got {other:?}"
            ))),
        }
    }
}

/// Observation-error specification, validated into exactly one form.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservationNoise {
    /// R = σ²·I.
    IsotropicVariance(f64),
    /// Explicit symmetric R⁻¹ (m×m).
    InverseCovariance(Array2<f64>),
}

impl ObservationNoise {
    /// Build from the two optional configuration fields.
    ///
    /// Exactly one of `variance` and `inverse_covariance` must be set.
    pub fn from_parts(
        variance: Option<f64>,
        inverse_covariance: Option<&Array2<f64>>,
    ) -> VardaResult<Self> {
        match (variance, inverse_covariance) {
            (Some(_), Some(_)) => Err(VardaError::InvalidConfiguration(
                "obs_variance and obs_inverse_covariance are mutually exclusive, both were set"
                    .to_string(),
            )),
            (None, None) => Err(VardaError::InvalidConfiguration(
                "one of obs_variance or obs_inverse_covariance must be set".to_string(),
            )),
            (Some(var), None) => {
                if !var.is_finite() || var <= 0.0 {
                    return Err(VardaError::InvalidConfiguration(format!(
                        "obs_variance must be finite and > 0, got {var}"
                    )));
                }
                Ok(ObservationNoise::IsotropicVariance(var))
            }
            (None, Some(r_inv)) => {
                let (rows, cols) = r_inv.dim();
                if rows != cols || rows == 0 {
                    return Err(VardaError::InvalidConfiguration(format!(
                        "obs_inverse_covariance must be square and non-empty, got {rows}x{cols}"
                    )));
                }
                if r_inv.iter().any(|v| !v.is_finite()) {
                    return Err(VardaError::InvalidConfiguration(
                        "obs_inverse_covariance contains non-finite entries".to_string(),
                    ));
                }
                let scale = r_inv.iter().fold(0.0f64, |m, v| m.max(v.abs())).max(1.0);
                for i in 0..rows {
                    for j in (i + 1)..rows {
                        if (r_inv[[i, j]] - r_inv[[j, i]]).abs() > 1e-10 * scale {
                            return Err(VardaError::InvalidConfiguration(format!(
                                "obs_inverse_covariance must be symmetric, entry ({i},{j}) differs from ({j},{i})"
                            )));
                        }
                    }
                }
                Ok(ObservationNoise::InverseCovariance(r_inv.clone()))
            }
        }
    }

    /// Number of observations implied, if the form carries one.
    pub fn n_obs(&self) -> Option<usize> {
        match self {
            ObservationNoise::IsotropicVariance(_) => None,
            ObservationNoise::InverseCovariance(r_inv) => Some(r_inv.nrows()),
        }
    }
}

/// Runtime configuration for one assimilation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssimilationConfig {
    /// Reduction strategy.
    pub compression: CompressionMethod,

    /// Explicit truncation rank. `None` selects the adaptive √s₁ rule.
    pub n_modes: Option<usize>,

    /// Isotropic observation variance σ². Absent from JSON means unset;
    /// `from_json` falls back to σ² = 1 only when R⁻¹ is absent too.
    #[serde(default)]
    pub obs_variance: Option<f64>,

    /// Explicit inverse observation covariance R⁻¹ (m×m).
    pub obs_inverse_covariance: Option<Array2<f64>>,

    /// Background weight α on 0.5·w·w.
    pub alpha: f64,

    /// Optimizer tolerance ε on gradient norm and relative cost decrease.
    pub tol: f64,

    /// Optimizer iteration cap.
    pub max_iters: usize,

    /// Number of L-BFGS correction pairs kept.
    pub lbfgs_memory: usize,

    /// Jacobian source for the nonlinear reduction.
    pub jacobian: JacobianMode,

    /// Central-difference step for the numerical Jacobian.
    pub fd_eps: f64,

    /// Reduced-state cold start.
    pub initial_guess: InitialGuess,

    /// Undo normalization on u₀, u_c and u_DA before computing errors.
    pub undo_normalize: bool,

    /// Check the generalized-inverse identities after truncation.
    pub verify_factorization: bool,

    /// Verbose diagnostics at debug level.
    pub debug: bool,
}

impl Default for AssimilationConfig {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::Linear,
            n_modes: None,
            obs_variance: Some(1.0),
            obs_inverse_covariance: None,
            alpha: 1.0,
            tol: 1e-6,
            max_iters: 1000,
            lbfgs_memory: 10,
            jacobian: JacobianMode::Auto,
            fd_eps: 1e-5,
            initial_guess: InitialGuess::Projection,
            undo_normalize: true,
            verify_factorization: false,
            debug: false,
        }
    }
}

impl AssimilationConfig {
    /// Switch to isotropic noise σ², clearing any explicit R⁻¹.
    pub fn with_obs_variance(mut self, variance: f64) -> Self {
        self.obs_variance = Some(variance);
        self.obs_inverse_covariance = None;
        self
    }

    /// Switch to an explicit R⁻¹, clearing σ².
    pub fn with_inverse_covariance(mut self, r_inv: Array2<f64>) -> Self {
        self.obs_inverse_covariance = Some(r_inv);
        self.obs_variance = None;
        self
    }

    /// The validated noise specification.
    pub fn noise(&self) -> VardaResult<ObservationNoise> {
        ObservationNoise::from_parts(self.obs_variance, self.obs_inverse_covariance.as_ref())
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> VardaResult<()> {
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(VardaError::InvalidConfiguration(format!(
                "alpha must be finite and >= 0, got {}",
                self.alpha
            )));
        }
        if !self.tol.is_finite() || self.tol <= 0.0 {
            return Err(VardaError::InvalidConfiguration(format!(
                "tol must be finite and > 0, got {}",
                self.tol
            )));
        }
        if self.max_iters == 0 {
            return Err(VardaError::InvalidConfiguration(
                "max_iters must be >= 1".to_string(),
            ));
        }
        if self.lbfgs_memory == 0 {
            return Err(VardaError::InvalidConfiguration(
                "lbfgs_memory must be >= 1".to_string(),
            ));
        }
        if !self.fd_eps.is_finite() || self.fd_eps <= 0.0 {
            return Err(VardaError::InvalidConfiguration(format!(
                "fd_eps must be finite and > 0, got {}",
                self.fd_eps
            )));
        }
        self.noise()?;
        Ok(())
    }

    /// Load from JSON string.
    pub fn from_json(json: &str) -> VardaResult<Self> {
        let mut config: Self = serde_json::from_str(json)
            .map_err(|e| VardaError::InvalidConfiguration(format!("JSON parse error: {e}")))?;
        if config.obs_variance.is_none() && config.obs_inverse_covariance.is_none() {
            config.obs_variance = Self::default().obs_variance;
        }
        Ok(config)
    }

    pub fn to_json(&self) -> VardaResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| VardaError::InvalidConfiguration(format!("JSON encode error: {e}")))
    }
}
