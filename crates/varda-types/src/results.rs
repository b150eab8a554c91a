// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Result Records and Warnings
// ─────────────────────────────────────────────────────────────────────

use std::fmt;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::Stage;

/// Non-fatal condition corrected locally so the run can complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssimilationWarning {
    /// No singular value exceeded √s₁; rank forced to 1.
    DegenerateRank { largest_singular_value: f64 },
    /// Requested rank exceeded the numerical rank of the snapshot matrix.
    RankClamped { requested: usize, used: usize },
    /// Decoder Jacobian is approximated by finite differences.
    SlowJacobian { decodes_per_gradient: usize },
    /// Iteration budget exhausted; best iterate returned.
    NonConvergence { iterations: usize, grad_norm: f64 },
    /// Reference error is zero, percentage improvement is undefined.
    ZeroReferenceError,
}

impl AssimilationWarning {
    /// Stage during which the condition is detected.
    pub fn stage(&self) -> Stage {
        match self {
            AssimilationWarning::DegenerateRank { .. }
            | AssimilationWarning::RankClamped { .. }
            | AssimilationWarning::SlowJacobian { .. } => Stage::Init,
            AssimilationWarning::NonConvergence { .. } => Stage::ReduceBuilt,
            AssimilationWarning::ZeroReferenceError => Stage::Reconstructed,
        }
    }

    /// Emit on the log surface and hand the value back for collection.
    pub fn emit(self) -> Self {
        log::warn!("[{}] {}", self.stage(), self);
        self
    }
}

impl fmt::Display for AssimilationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssimilationWarning::DegenerateRank {
                largest_singular_value,
            } => write!(
                f,
                "no singular value above sqrt(s1) = {:.4e}; truncation rank forced to 1",
                largest_singular_value.sqrt()
            ),
            AssimilationWarning::RankClamped { requested, used } => write!(
                f,
                "n_modes = {requested} exceeds the numerical rank; using {used} modes"
            ),
            AssimilationWarning::SlowJacobian {
                decodes_per_gradient,
            } => write!(
                f,
                "using the numerical Jacobian fallback ({decodes_per_gradient} decodes per gradient); \
                 this is very slow for large latent spaces"
            ),
            AssimilationWarning::NonConvergence {
                iterations,
                grad_norm,
            } => write!(
                f,
                "optimizer did not converge in {iterations} iterations (|grad| = {grad_norm:.4e}); \
                 returning best iterate"
            ),
            AssimilationWarning::ZeroReferenceError => {
                f.write_str("ref_MAE_mean is 0; percentage improvement reported as 0")
            }
        }
    }
}

/// Split of the cost at one reduced state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    /// Background term 0.5·α·w·w.
    pub j_b: f64,
    /// Observation term.
    pub j_o: f64,
    pub total: f64,
}

impl CostBreakdown {
    pub fn new(j_b: f64, j_o: f64) -> Self {
        Self {
            j_b,
            j_o,
            total: j_b + j_o,
        }
    }
}

/// Error statistics of the background and the analysis against the truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    /// |u₀ − u_c| per element.
    pub ref_mae: Array1<f64>,
    /// |u_DA − u_c| per element.
    pub da_mae: Array1<f64>,
    pub ref_mae_mean: f64,
    pub da_mae_mean: f64,
    /// Elements where ref_MAE > da_MAE.
    pub improved_count: usize,
    pub improved_fraction: f64,
    /// 100·(ref_MAE_mean − da_MAE_mean)/ref_MAE_mean.
    pub percent_improvement: f64,
}

/// Terminal record of one assimilation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssimilationResults {
    /// Optimal reduced state.
    pub w_opt: Array1<f64>,
    /// Analysis state u₀ + reduce_to_full(w_opt), denormalized if requested.
    pub u_da: Array1<f64>,
    pub stats: ErrorStatistics,
    /// Truncation rank (linear) or latent dimension (nonlinear).
    pub n_modes: usize,
    pub iterations: usize,
    pub converged: bool,
    pub cost_initial: CostBreakdown,
    pub cost_final: CostBreakdown,
    pub warnings: Vec<AssimilationWarning>,
}

impl AssimilationResults {
    pub fn ref_mae_mean(&self) -> f64 {
        self.stats.ref_mae_mean
    }

    pub fn da_mae_mean(&self) -> f64 {
        self.stats.da_mae_mean
    }

    pub fn percent_improvement(&self) -> f64 {
        self.stats.percent_improvement
    }

    /// Whether assimilation lowered the mean absolute error.
    pub fn improved(&self) -> bool {
        self.stats.da_mae_mean < self.stats.ref_mae_mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample_stats() -> ErrorStatistics {
        ErrorStatistics {
            ref_mae: array![0.4, 0.2],
            da_mae: array![0.1, 0.3],
            ref_mae_mean: 0.3,
            da_mae_mean: 0.2,
            improved_count: 1,
            improved_fraction: 0.5,
            percent_improvement: 100.0 / 3.0,
        }
    }

    #[test]
    fn test_cost_breakdown_total() {
        let c = CostBreakdown::new(0.5, 1.25);
        assert!((c.total - 1.75).abs() < 1e-15);
    }

    #[test]
    fn test_warning_stage() {
        let w = AssimilationWarning::NonConvergence {
            iterations: 10,
            grad_norm: 1e-2,
        };
        assert_eq!(w.stage(), Stage::ReduceBuilt);
        assert!(w.to_string().contains("10 iterations"));
    }

    #[test]
    fn test_results_accessors() {
        let res = AssimilationResults {
            w_opt: array![1.0],
            u_da: array![0.0, 0.0],
            stats: sample_stats(),
            n_modes: 1,
            iterations: 3,
            converged: true,
            cost_initial: CostBreakdown::default(),
            cost_final: CostBreakdown::default(),
            warnings: Vec::new(),
        };
        assert!(res.improved());
        assert!((res.percent_improvement() - 33.333333).abs() < 1e-4);
    }

    #[test]
    fn test_results_serialize() {
        let res = AssimilationResults {
            w_opt: array![1.0, -2.0],
            u_da: array![0.5, 0.25],
            stats: sample_stats(),
            n_modes: 2,
            iterations: 7,
            converged: false,
            cost_initial: CostBreakdown::new(1.0, 2.0),
            cost_final: CostBreakdown::new(0.1, 0.2),
            warnings: vec![AssimilationWarning::ZeroReferenceError],
        };
        let json = serde_json::to_string(&res).unwrap();
        assert!(json.contains("ZeroReferenceError"));
        let back: AssimilationResults = serde_json::from_str(&json).unwrap();
        assert_eq!(back.iterations, 7);
        assert_eq!(back.warnings.len(), 1);
    }
}
