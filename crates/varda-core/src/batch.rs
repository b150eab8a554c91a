// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Batch Assimilation over Control States
// ─────────────────────────────────────────────────────────────────────
//! One reduction, many runs. The operator is built once and shared
//! read-only; each control state (a column of the control matrix) gets
//! its own runner on the rayon pool.

use std::sync::Arc;

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use varda_types::{AssimilationConfig, AssimilationWarning, Stage, VardaError, VardaResult};

use crate::runner::{build_reduction, AssimilationData, AssimilationRunner};

/// Summary of one control state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub index: usize,
    pub ref_mae_mean: f64,
    pub da_mae_mean: f64,
    pub percent_improvement: f64,
    pub iterations: usize,
    pub converged: bool,
    pub warnings: Vec<AssimilationWarning>,
}

/// Per-state records and their aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub records: Vec<BatchRecord>,
    pub n_modes: usize,
    pub mean_ref_mae: f64,
    pub mean_da_mae: f64,
    pub mean_percent_improvement: f64,
    /// States where da_MAE_mean < ref_MAE_mean.
    pub n_improved: usize,
    /// Raised once while building the shared reduction.
    pub build_warnings: Vec<AssimilationWarning>,
}

/// Assimilate perfect observations of every column of `control_states`
/// (n×N) against the background in `template`.
///
/// `template.u_c` and `template.d` are ignored. A failing state aborts
/// the batch with that state's error.
pub fn run_batch(
    config: &AssimilationConfig,
    template: &AssimilationData,
    control_states: &Array2<f64>,
) -> VardaResult<BatchReport> {
    // Validates config and template shapes before any work.
    AssimilationRunner::new(config, template)?;
    VardaError::check_len("control state rows", control_states.nrows(), template.full_dim())
        .map_err(|e| e.at(Stage::Init))?;
    if control_states.ncols() == 0 {
        return Err(VardaError::InvalidArgument("no control states given".to_string()).at(Stage::Init));
    }

    let reduction = Arc::new(build_reduction(config, template).map_err(|e| e.at(Stage::Init))?);
    let build_warnings = reduction.warnings().to_vec();
    log::info!(
        "Batch DA: {} control states, {} modes",
        control_states.ncols(),
        reduction.n_modes()
    );

    let records = (0..control_states.ncols())
        .into_par_iter()
        .map(|index| {
            let outcome = AssimilationData {
                v: None,
                model: None,
                u_c: control_states.column(index).to_owned(),
                ..template.clone()
            }
            .observe_truth()
            .and_then(|data| {
                let results = AssimilationRunner::with_reduction(config, &data, Arc::clone(&reduction))?.run()?;
                Ok(BatchRecord {
                    index,
                    ref_mae_mean: results.ref_mae_mean(),
                    da_mae_mean: results.da_mae_mean(),
                    percent_improvement: results.percent_improvement(),
                    iterations: results.iterations,
                    converged: results.converged,
                    warnings: results.warnings,
                })
            });
            outcome.map_err(|e| {
                log::error!("control state {index} failed: {e}");
                e
            })
        })
        .collect::<VardaResult<Vec<_>>>()?;

    let count = records.len() as f64;
    let mean = |f: fn(&BatchRecord) -> f64| records.iter().map(f).sum::<f64>() / count;
    let report = BatchReport {
        n_modes: reduction.n_modes(),
        mean_ref_mae: mean(|r| r.ref_mae_mean),
        mean_da_mae: mean(|r| r.da_mae_mean),
        mean_percent_improvement: mean(|r| r.percent_improvement),
        n_improved: records.iter().filter(|r| r.da_mae_mean < r.ref_mae_mean).count(),
        build_warnings,
        records,
    };
    log::info!(
        "Batch DA: mean ref_MAE {:.6e}, mean da_MAE {:.6e}, {} / {} improved",
        report.mean_ref_mae,
        report.mean_da_mae,
        report.n_improved,
        report.records.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{random_vector, SimpleRng, TwinExperiment};
    use ndarray::Array1;

    fn controls(twin: &TwinExperiment, count: usize) -> Array2<f64> {
        let mut rng = SimpleRng::new(77);
        let (n, k) = twin.basis.dim();
        let mut out = Array2::zeros((n, count));
        for j in 0..count {
            let w: Array1<f64> = random_vector(k, &mut rng);
            out.column_mut(j).assign(&twin.basis.dot(&w));
        }
        out
    }

    #[test]
    fn test_batch_matches_individual_runs() {
        let twin = TwinExperiment::linear(40, 4, 2, 13).unwrap();
        let template = twin.linear_data().unwrap();
        let config = AssimilationConfig {
            n_modes: Some(4),
            alpha: 1e-8,
            tol: 1e-12,
            ..Default::default()
        };
        let states = controls(&twin, 5);
        let report = run_batch(&config, &template, &states).unwrap();
        assert_eq!(report.records.len(), 5);
        assert_eq!(report.n_modes, 4);
        for (j, record) in report.records.iter().enumerate() {
            assert_eq!(record.index, j);
            let single = AssimilationData {
                u_c: states.column(j).to_owned(),
                ..template.clone()
            }
            .observe_truth()
            .unwrap();
            let res = crate::runner::run(&config, &single).unwrap();
            assert!((res.da_mae_mean() - record.da_mae_mean).abs() < 1e-9);
        }
        assert_eq!(report.n_improved, 5);
        assert!(report.mean_da_mae < 1e-4 * report.mean_ref_mae);
    }

    #[test]
    fn test_wrong_control_rows() {
        let twin = TwinExperiment::linear(20, 3, 2, 13).unwrap();
        let template = twin.linear_data().unwrap();
        let err = run_batch(&AssimilationConfig::default(), &template, &Array2::zeros((5, 2))).unwrap_err();
        assert!(matches!(err.root(), VardaError::InvalidState(_)));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let twin = TwinExperiment::linear(20, 3, 2, 13).unwrap();
        let template = twin.linear_data().unwrap();
        let err = run_batch(&AssimilationConfig::default(), &template, &Array2::zeros((20, 0))).unwrap_err();
        assert!(matches!(err.root(), VardaError::InvalidArgument(_)));
    }
}
