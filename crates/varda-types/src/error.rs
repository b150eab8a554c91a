// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Error Hierarchy
// ─────────────────────────────────────────────────────────────────────

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of one assimilation run.
///
/// INIT → REDUCE_BUILT → OPTIMIZED → RECONSTRUCTED → EVALUATED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Init,
    ReduceBuilt,
    Optimized,
    Reconstructed,
    Evaluated,
}

impl Stage {
    /// The state reached by the next transition, `None` once terminal.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Init => Some(Stage::ReduceBuilt),
            Stage::ReduceBuilt => Some(Stage::Optimized),
            Stage::Optimized => Some(Stage::Reconstructed),
            Stage::Reconstructed => Some(Stage::Evaluated),
            Stage::Evaluated => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "INIT",
            Stage::ReduceBuilt => "REDUCE_BUILT",
            Stage::Optimized => "OPTIMIZED",
            Stage::Reconstructed => "RECONSTRUCTED",
            Stage::Evaluated => "EVALUATED",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root error type for all assimilation failures.
#[derive(Error, Debug)]
pub enum VardaError {
    /// Unsupported compression method, bad noise specification,
    /// malformed or out-of-range configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A call-site argument is out of its domain (e.g. zero truncation rank).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No usable Jacobian path for a nonlinear reduction.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// Device or accelerator placement failed. Not retryable.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Shape mismatch, out-of-order stage transition or failed verification.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Non-finite value produced by a numerical kernel.
    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    /// Any of the above, tagged with the run stage in which it occurred.
    #[error("stage {stage}: {source}")]
    AtStage {
        stage: Stage,
        #[source]
        source: Box<VardaError>,
    },
}

impl VardaError {
    /// Attach the run stage. Errors that already carry one keep it.
    pub fn at(self, stage: Stage) -> Self {
        match self {
            tagged @ VardaError::AtStage { .. } => tagged,
            other => VardaError::AtStage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Innermost error, with any stage tag stripped.
    pub fn root(&self) -> &VardaError {
        match self {
            VardaError::AtStage { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            VardaError::AtStage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self.root(), VardaError::InvalidConfiguration(_))
    }

    /// Shape check shared by every kernel that consumes vectors.
    pub fn check_len(what: &str, got: usize, expected: usize) -> VardaResult<()> {
        if got != expected {
            return Err(VardaError::InvalidState(format!(
                "{what} has length {got}, expected {expected}"
            )));
        }
        Ok(())
    }
}

pub type VardaResult<T> = Result<T, VardaError>;
