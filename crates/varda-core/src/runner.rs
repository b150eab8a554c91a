// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Assimilation Runner (stage orchestrator)
// ─────────────────────────────────────────────────────────────────────
//! One assimilation run, advanced through four transitions:
//!   1. INIT → REDUCE_BUILT:           factorize V or prepare the model
//!   2. REDUCE_BUILT → OPTIMIZED:      initial guess, L-BFGS on J(w)
//!   3. OPTIMIZED → RECONSTRUCTED:     u_DA = u₀ + reduce_to_full(w_opt)
//!   4. RECONSTRUCTED → EVALUATED:     error statistics
//!
//! Every error leaving the runner is tagged with the stage the run was
//! in when it failed. Calling a transition out of order is `InvalidState`.

use std::fmt;
use std::sync::Arc;

use ndarray::{Array1, Array2};

use varda_types::{
    AssimilationConfig, AssimilationResults, AssimilationWarning, CompressionMethod, CostBreakdown,
    ErrorStatistics, InitialGuess, ObservationNoise, Stage, VardaError, VardaResult,
};

use crate::cost::CostState;
use crate::hooks::PersistenceHook;
use crate::nonlinear::{NonlinearReduction, ReductionModel};
use crate::normalization::NormalizationParams;
use crate::observation::ObservationOperator;
use crate::optimizer::{Lbfgs, OptimizeResult};
use crate::reduction::{LinearReduction, ReducedBasis, ReductionOperator};
use crate::stats;
use crate::svd::TruncationPolicy;

/// Inputs of one run. All states are in the (possibly normalized) space
/// the reduction was trained in.
#[derive(Clone)]
pub struct AssimilationData {
    /// Snapshot matrix V (n×M), LINEAR method.
    pub v: Option<Array2<f64>>,
    /// Encoder/decoder, NONLINEAR method.
    pub model: Option<Arc<dyn ReductionModel>>,
    /// Background state.
    pub u_0: Array1<f64>,
    /// Control (truth) state used for evaluation.
    pub u_c: Array1<f64>,
    pub g: ObservationOperator,
    /// Misfit d = y − G·u₀ (length m).
    pub d: Array1<f64>,
    /// Set when the states were normalized before assimilation.
    pub normalization: Option<NormalizationParams>,
    /// Subtracted from u₀ before the linear projection.
    pub baseline: Option<Array1<f64>>,
}

impl fmt::Debug for AssimilationData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssimilationData")
            .field("v", &self.v.as_ref().map(|v| v.dim()))
            .field("model", &self.model.as_ref().map(|m| (m.latent_dim(), m.full_dim())))
            .field("n", &self.u_0.len())
            .field("m", &self.d.len())
            .field("normalized", &self.normalization.is_some())
            .finish()
    }
}

impl AssimilationData {
    /// Linear-method inputs with a zero misfit; set `d` or call `observe_truth`.
    pub fn linear(v: Array2<f64>, u_0: Array1<f64>, u_c: Array1<f64>, g: ObservationOperator) -> Self {
        let d = Array1::zeros(g.n_obs());
        Self {
            v: Some(v),
            model: None,
            u_0,
            u_c,
            g,
            d,
            normalization: None,
            baseline: None,
        }
    }

    /// Nonlinear-method inputs with a zero misfit; set `d` or call `observe_truth`.
    pub fn nonlinear(
        model: Arc<dyn ReductionModel>,
        u_0: Array1<f64>,
        u_c: Array1<f64>,
        g: ObservationOperator,
    ) -> Self {
        let d = Array1::zeros(g.n_obs());
        Self {
            v: None,
            model: Some(model),
            u_0,
            u_c,
            g,
            d,
            normalization: None,
            baseline: None,
        }
    }

    pub fn with_misfit(mut self, d: Array1<f64>) -> Self {
        self.d = d;
        self
    }

    pub fn with_normalization(mut self, params: NormalizationParams) -> Self {
        self.normalization = Some(params);
        self
    }

    pub fn with_baseline(mut self, baseline: Array1<f64>) -> Self {
        self.baseline = Some(baseline);
        self
    }

    /// Perfect observations of the control state: d = G·u_c − G·u₀.
    pub fn observe_truth(mut self) -> VardaResult<Self> {
        self.d = self.g.apply(&self.u_c)? - self.g.apply(&self.u_0)?;
        Ok(self)
    }

    /// n.
    pub fn full_dim(&self) -> usize {
        self.u_0.len()
    }

    fn validate(&self, config: &AssimilationConfig, noise: &ObservationNoise, need_source: bool) -> VardaResult<()> {
        let n = self.full_dim();
        if n == 0 {
            return Err(VardaError::InvalidState("background u_0 is empty".to_string()));
        }
        VardaError::check_len("control state u_c", self.u_c.len(), n)?;
        VardaError::check_len("observation operator columns", self.g.full_dim(), n)?;
        VardaError::check_len("misfit vector d", self.d.len(), self.g.n_obs())?;
        if let Some(m) = noise.n_obs() {
            if m != self.d.len() {
                return Err(VardaError::InvalidConfiguration(format!(
                    "obs_inverse_covariance is {m}x{m} but there are {} observations",
                    self.d.len()
                )));
            }
        }
        if let Some(params) = &self.normalization {
            VardaError::check_len("normalization parameters", params.dim(), n)?;
        }
        if let Some(b) = &self.baseline {
            VardaError::check_len("baseline", b.len(), n)?;
        }
        if !need_source {
            return Ok(());
        }
        match config.compression {
            CompressionMethod::Linear => {
                let v = self.v.as_ref().ok_or_else(|| {
                    VardaError::InvalidConfiguration(
                        "compression = LINEAR requires a snapshot matrix V".to_string(),
                    )
                })?;
                VardaError::check_len("snapshot matrix rows", v.nrows(), n)?;
            }
            CompressionMethod::Nonlinear => {
                let model = self.model.as_ref().ok_or_else(|| {
                    VardaError::InvalidConfiguration(
                        "compression = NONLINEAR requires a reduction model".to_string(),
                    )
                })?;
                VardaError::check_len("model full dimension", model.full_dim(), n)?;
            }
        }
        Ok(())
    }
}

/// Build the reduction operator selected by `config.compression`.
pub fn build_reduction(config: &AssimilationConfig, data: &AssimilationData) -> VardaResult<ReductionOperator> {
    match config.compression {
        CompressionMethod::Linear => {
            let v = data.v.as_ref().ok_or_else(|| {
                VardaError::InvalidConfiguration("compression = LINEAR requires a snapshot matrix V".to_string())
            })?;
            let policy = TruncationPolicy::from_modes(config.n_modes);
            LinearReduction::from_snapshots(v, policy, config.verify_factorization).map(ReductionOperator::Linear)
        }
        CompressionMethod::Nonlinear => {
            let model = data.model.as_ref().ok_or_else(|| {
                VardaError::InvalidConfiguration("compression = NONLINEAR requires a reduction model".to_string())
            })?;
            if let Some(k) = config.n_modes {
                if k != model.latent_dim() {
                    return Err(VardaError::InvalidConfiguration(format!(
                        "n_modes = {k} does not match the model latent dimension {}",
                        model.latent_dim()
                    )));
                }
            }
            NonlinearReduction::new(Arc::clone(model), config.jacobian, config.fd_eps)
                .map(ReductionOperator::Nonlinear)
        }
    }
}

struct Optimum {
    result: OptimizeResult,
    cost_initial: CostBreakdown,
    cost_final: CostBreakdown,
}

struct Analysis {
    u_0: Array1<f64>,
    u_c: Array1<f64>,
    u_da: Array1<f64>,
}

/// Stage-by-stage driver for one assimilation run.
pub struct AssimilationRunner<'a> {
    config: &'a AssimilationConfig,
    data: &'a AssimilationData,
    noise: ObservationNoise,
    stage: Stage,
    reduction: Option<Arc<ReductionOperator>>,
    optimum: Option<Optimum>,
    analysis: Option<Analysis>,
    results: Option<AssimilationResults>,
    warnings: Vec<AssimilationWarning>,
}

impl<'a> AssimilationRunner<'a> {
    /// Validate configuration and inputs; the run starts at INIT.
    pub fn new(config: &'a AssimilationConfig, data: &'a AssimilationData) -> VardaResult<Self> {
        let noise = Self::check_inputs(config, data, true)?;
        Ok(Self {
            config,
            data,
            noise,
            stage: Stage::Init,
            reduction: None,
            optimum: None,
            analysis: None,
            results: None,
            warnings: Vec::new(),
        })
    }

    /// Start at REDUCE_BUILT with an operator built elsewhere.
    pub fn with_reduction(
        config: &'a AssimilationConfig,
        data: &'a AssimilationData,
        reduction: Arc<ReductionOperator>,
    ) -> VardaResult<Self> {
        let noise = Self::check_inputs(config, data, false)?;
        VardaError::check_len("reduction full dimension", reduction.full_dim(), data.full_dim())
            .map_err(|e| e.at(Stage::ReduceBuilt))?;
        Ok(Self {
            config,
            data,
            noise,
            stage: Stage::ReduceBuilt,
            reduction: Some(reduction),
            optimum: None,
            analysis: None,
            results: None,
            warnings: Vec::new(),
        })
    }

    fn check_inputs(
        config: &AssimilationConfig,
        data: &AssimilationData,
        need_source: bool,
    ) -> VardaResult<ObservationNoise> {
        let checked = config.validate().and_then(|()| {
            let noise = config.noise()?;
            data.validate(config, &noise, need_source)?;
            Ok(noise)
        });
        checked.map_err(|e| e.at(Stage::Init))
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn reduction(&self) -> Option<&Arc<ReductionOperator>> {
        self.reduction.as_ref()
    }

    pub fn warnings(&self) -> &[AssimilationWarning] {
        &self.warnings
    }

    pub fn results(&self) -> Option<&AssimilationResults> {
        self.results.as_ref()
    }

    fn require_stage(&self, expected: Stage, transition: &str) -> VardaResult<()> {
        if self.stage != expected {
            return Err(VardaError::InvalidState(format!(
                "{transition} requires stage {expected}, run is at {}",
                self.stage
            ))
            .at(self.stage));
        }
        Ok(())
    }

    fn tag<T>(&self, result: VardaResult<T>) -> VardaResult<T> {
        result.map_err(|e| e.at(self.stage))
    }

    fn advance(&mut self) {
        if let Some(next) = self.stage.next() {
            log::debug!("stage {} → {}", self.stage, next);
            self.stage = next;
        }
    }

    /// INIT → REDUCE_BUILT.
    pub fn build_reduction(&mut self) -> VardaResult<()> {
        self.require_stage(Stage::Init, "build_reduction")?;
        let op = self.tag(build_reduction(self.config, self.data))?;
        self.warnings.extend(op.warnings().iter().cloned());
        self.reduction = Some(Arc::new(op));
        self.advance();
        Ok(())
    }

    fn current_reduction(&self) -> VardaResult<Arc<ReductionOperator>> {
        self.reduction
            .clone()
            .ok_or_else(|| VardaError::InvalidState("reduction operator not built".to_string()).at(self.stage))
    }

    fn initial_guess(&self, reduction: &ReductionOperator) -> VardaResult<Array1<f64>> {
        match self.config.initial_guess {
            InitialGuess::Projection => reduction.project(&self.data.u_0, self.data.baseline.as_ref()),
            InitialGuess::Zero => Ok(Array1::zeros(reduction.reduced_dim())),
        }
    }

    /// REDUCE_BUILT → OPTIMIZED.
    pub fn optimize(&mut self) -> VardaResult<()> {
        self.require_stage(Stage::ReduceBuilt, "optimize")?;
        let reduction = self.current_reduction()?;
        let w_0 = self.tag(self.initial_guess(&reduction))?;
        let basis: Arc<dyn ReducedBasis> = reduction;
        let cost = self.tag(CostState::new(
            self.data.d.clone(),
            self.data.g.clone(),
            self.noise.clone(),
            self.config.alpha,
            basis,
        ))?;

        let cost_initial = self.tag(cost.breakdown(&w_0))?;
        let result = self.tag(Lbfgs::from_config(self.config).minimize(&cost, w_0))?;
        let cost_final = self.tag(cost.breakdown(&result.w))?;

        log::info!(
            "L-BFGS: {} iterations, {} evaluations, J {:.6e} → {:.6e}, |grad| = {:.3e}",
            result.iters,
            result.evaluations,
            cost_initial.total,
            cost_final.total,
            result.grad_norm
        );
        if !result.converged {
            self.warnings.push(
                AssimilationWarning::NonConvergence {
                    iterations: result.iters,
                    grad_norm: result.grad_norm,
                }
                .emit(),
            );
        }

        self.optimum = Some(Optimum {
            result,
            cost_initial,
            cost_final,
        });
        self.advance();
        Ok(())
    }

    /// OPTIMIZED → RECONSTRUCTED.
    pub fn reconstruct(&mut self) -> VardaResult<()> {
        self.require_stage(Stage::Optimized, "reconstruct")?;
        let reduction = self.current_reduction()?;
        let optimum = self
            .optimum
            .as_ref()
            .ok_or_else(|| VardaError::InvalidState("no optimum recorded".to_string()).at(self.stage))?;

        let delta = self.tag(reduction.reduce_to_full(&optimum.result.w))?;
        let mut analysis = Analysis {
            u_0: self.data.u_0.clone(),
            u_c: self.data.u_c.clone(),
            u_da: &self.data.u_0 + &delta,
        };

        match (&self.data.normalization, self.config.undo_normalize) {
            (Some(params), true) => {
                analysis = self.tag(denormalize(params, &analysis))?;
                log::debug!("normalization undone on u_0, u_c and u_DA");
            }
            (Some(_), false) => log::info!("undo_normalize = false; errors computed in normalized space"),
            (None, _) => {}
        }

        if self.config.debug {
            let lines = reconstruction_tails(&optimum.result.w, &delta, self.data.normalization.as_ref(), &analysis);
            for (label, values) in lines {
                log::debug!("{label}[-4:] = {values}");
            }
        }

        self.analysis = Some(analysis);
        self.advance();
        Ok(())
    }

    /// RECONSTRUCTED → EVALUATED.
    pub fn evaluate(&mut self) -> VardaResult<AssimilationResults> {
        self.require_stage(Stage::Reconstructed, "evaluate")?;
        let (Some(analysis), Some(optimum), Some(reduction)) = (&self.analysis, &self.optimum, &self.reduction)
        else {
            return Err(VardaError::InvalidState("reconstruction missing".to_string()).at(self.stage));
        };

        let (stats, warning) = self.tag(stats::compute(&analysis.u_0, &analysis.u_c, &analysis.u_da))?;
        let n_modes = reduction.n_modes();
        let mut warnings = self.warnings.clone();
        warnings.extend(warning);

        if self.config.debug {
            for (label, values) in error_tails(&stats) {
                log::debug!("{label}[-4:] = {values}");
            }
        }

        log::info!("RESULTS");
        log::info!("da_MAE_mean: {:.6e}", stats.da_mae_mean);
        log::info!("ref_MAE_mean: {:.6e}", stats.ref_mae_mean);
        log::info!("percent improvement: {:.2}%", stats.percent_improvement);
        log::info!(
            "improved components: {} / {} ({:.1}%)",
            stats.improved_count,
            stats.ref_mae.len(),
            100.0 * stats.improved_fraction
        );

        let results = AssimilationResults {
            w_opt: optimum.result.w.clone(),
            u_da: analysis.u_da.clone(),
            stats,
            n_modes,
            iterations: optimum.result.iters,
            converged: optimum.result.converged,
            cost_initial: optimum.cost_initial,
            cost_final: optimum.cost_final,
            warnings,
        };
        self.warnings = results.warnings.clone();
        self.results = Some(results.clone());
        self.advance();
        Ok(results)
    }

    /// Run all remaining transitions.
    pub fn run(self) -> VardaResult<AssimilationResults> {
        self.run_with_hooks(&mut [])
    }

    /// Run all remaining transitions, notifying `hooks` on the factorization
    /// and on the final results.
    pub fn run_with_hooks(mut self, hooks: &mut [&mut dyn PersistenceHook]) -> VardaResult<AssimilationResults> {
        if self.stage == Stage::Init {
            self.build_reduction()?;
            if let Some(factors) = self.reduction.as_ref().and_then(|r| r.factors()) {
                for hook in hooks.iter_mut() {
                    hook.on_factorization(factors).map_err(|e| e.at(self.stage))?;
                }
            }
        }
        if self.stage == Stage::ReduceBuilt {
            self.optimize()?;
        }
        if self.stage == Stage::Optimized {
            self.reconstruct()?;
        }
        let results = self.evaluate()?;
        for hook in hooks.iter_mut() {
            hook.on_results(&results).map_err(|e| e.at(self.stage))?;
        }
        Ok(results)
    }
}

fn denormalize(params: &NormalizationParams, analysis: &Analysis) -> VardaResult<Analysis> {
    Ok(Analysis {
        u_0: params.denormalize(&analysis.u_0)?,
        u_c: params.denormalize(&analysis.u_c)?,
        u_da: params.denormalize(&analysis.u_da)?,
    })
}

fn reconstruction_tails(
    w_opt: &Array1<f64>,
    delta: &Array1<f64>,
    normalization: Option<&NormalizationParams>,
    analysis: &Analysis,
) -> Vec<(&'static str, String)> {
    let mut lines = Vec::with_capacity(7);
    if let Some(params) = normalization {
        lines.push(("std", tail(&params.std)));
        lines.push(("mean", tail(&params.mean)));
    }
    lines.push(("w_opt", tail(w_opt)));
    lines.push(("delta_u", tail(delta)));
    lines.push(("u_0", tail(&analysis.u_0)));
    lines.push(("u_c", tail(&analysis.u_c)));
    lines.push(("u_DA", tail(&analysis.u_da)));
    lines
}

fn error_tails(stats: &ErrorStatistics) -> [(&'static str, String); 2] {
    [("ref_MAE", tail(&stats.ref_mae)), ("da_MAE", tail(&stats.da_mae))]
}

fn tail(x: &Array1<f64>) -> String {
    let start = x.len().saturating_sub(4);
    let parts: Vec<String> = x.iter().skip(start).map(|v| format!("{v:.6e}")).collect();
    format!("[{}]", parts.join(", "))
}

/// Validate, build, optimize, reconstruct and evaluate in one call.
pub fn run(config: &AssimilationConfig, data: &AssimilationData) -> VardaResult<AssimilationResults> {
    AssimilationRunner::new(config, data)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::TwinExperiment;

    fn twin_config() -> AssimilationConfig {
        AssimilationConfig {
            n_modes: Some(4),
            alpha: 1e-8,
            tol: 1e-12,
            ..Default::default()
        }
    }

    #[test]
    fn test_stages_advance_in_order() {
        let twin = TwinExperiment::linear(40, 4, 2, 1).unwrap();
        let data = twin.linear_data().unwrap();
        let config = twin_config();
        let mut runner = AssimilationRunner::new(&config, &data).unwrap();
        assert_eq!(runner.stage(), Stage::Init);
        runner.build_reduction().unwrap();
        assert_eq!(runner.stage(), Stage::ReduceBuilt);
        runner.optimize().unwrap();
        assert_eq!(runner.stage(), Stage::Optimized);
        runner.reconstruct().unwrap();
        assert_eq!(runner.stage(), Stage::Reconstructed);
        let res = runner.evaluate().unwrap();
        assert_eq!(runner.stage(), Stage::Evaluated);
        assert_eq!(res.n_modes, 4);
        assert!(runner.results().is_some());
    }

    #[test]
    fn test_out_of_order_transition() {
        let twin = TwinExperiment::linear(20, 3, 2, 2).unwrap();
        let data = twin.linear_data().unwrap();
        let config = twin_config();
        let mut runner = AssimilationRunner::new(&config, &data).unwrap();
        let err = runner.optimize().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Init));
        assert!(matches!(err.root(), VardaError::InvalidState(_)));
        assert_eq!(runner.stage(), Stage::Init);
    }

    #[test]
    fn test_missing_snapshots_is_configuration_error() {
        let twin = TwinExperiment::nonlinear(20, 3, 2, 3).unwrap();
        let data = twin.nonlinear_data(true).unwrap();
        let config = twin_config();
        let err = AssimilationRunner::new(&config, &data).err().unwrap();
        assert!(err.is_configuration());
        assert_eq!(err.stage(), Some(Stage::Init));
    }

    #[test]
    fn test_latent_dimension_mismatch() {
        let twin = TwinExperiment::nonlinear(20, 3, 2, 3).unwrap();
        let data = twin.nonlinear_data(true).unwrap();
        let config = AssimilationConfig {
            compression: CompressionMethod::Nonlinear,
            n_modes: Some(5),
            ..Default::default()
        };
        let err = run(&config, &data).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_shape_mismatch_rejected_up_front() {
        let twin = TwinExperiment::linear(20, 3, 2, 4).unwrap();
        let data = twin.linear_data().unwrap().with_misfit(Array1::zeros(3));
        let err = AssimilationRunner::new(&twin_config(), &data).err().unwrap();
        assert!(matches!(err.root(), VardaError::InvalidState(_)));
    }

    #[test]
    fn test_iteration_cap_warns() {
        let twin = TwinExperiment::linear(30, 5, 1, 5).unwrap();
        let data = twin.linear_data().unwrap();
        let config = AssimilationConfig {
            max_iters: 1,
            tol: 1e-15,
            alpha: 1e-8,
            ..Default::default()
        };
        let res = run(&config, &data).unwrap();
        assert!(!res.converged);
        assert!(res
            .warnings
            .iter()
            .any(|w| matches!(w, AssimilationWarning::NonConvergence { iterations: 1, .. })));
    }

    #[test]
    fn test_normalization_undone() {
        let twin = TwinExperiment::linear(12, 2, 1, 6).unwrap();
        let params = NormalizationParams::new(Array1::from_elem(12, 10.0), Array1::from_elem(12, 2.0)).unwrap();
        let data = twin.linear_data().unwrap().with_normalization(params.clone());
        let config = twin_config();
        let res = run(&config, &data).unwrap();
        let raw = run(
            &AssimilationConfig {
                undo_normalize: false,
                ..config
            },
            &data,
        )
        .unwrap();
        let expected = params.denormalize(&raw.u_da).unwrap();
        for (a, b) in res.u_da.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
        assert!((res.ref_mae_mean() - 2.0 * raw.ref_mae_mean()).abs() < 1e-9);
    }

    #[test]
    fn test_debug_tails_cover_normalization_and_errors() {
        let params = NormalizationParams::new(Array1::from_elem(6, 1.0), Array1::from_elem(6, 2.0)).unwrap();
        let analysis = Analysis {
            u_0: Array1::zeros(6),
            u_c: Array1::ones(6),
            u_da: Array1::ones(6),
        };
        let w = Array1::zeros(2);
        let labels: Vec<_> = reconstruction_tails(&w, &analysis.u_0, Some(&params), &analysis)
            .into_iter()
            .map(|(label, _)| label)
            .collect();
        assert_eq!(labels, ["std", "mean", "w_opt", "delta_u", "u_0", "u_c", "u_DA"]);
        let without = reconstruction_tails(&w, &analysis.u_0, None, &analysis);
        assert_eq!(without[0].0, "w_opt");

        let (stats, _) = stats::compute(&analysis.u_0, &analysis.u_c, &analysis.u_da).unwrap();
        let [(ref_label, ref_tail), (da_label, da_tail)] = error_tails(&stats);
        assert_eq!((ref_label, da_label), ("ref_MAE", "da_MAE"));
        assert_eq!(ref_tail.matches(',').count(), 3);
        assert!(da_tail.starts_with("[0.000000e0"), "{da_tail}");
    }

    #[test]
    fn test_tail_formatting() {
        assert_eq!(tail(&Array1::from(vec![1.0])), "[1.000000e0]");
        assert_eq!(tail(&Array1::zeros(6)).matches(',').count(), 3);
    }
}
