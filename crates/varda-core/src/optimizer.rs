// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — L-BFGS Minimizer
// ─────────────────────────────────────────────────────────────────────
//! Limited-memory BFGS on top of argmin, with a More–Thuente line search
//! (strong Wolfe conditions).
//!
//! Stops when ‖∇J‖₂ < tol, when the cost change between iterations drops
//! below tol, or after `max_iters` iterations. Running out of iterations
//! is not an error: the best iterate is returned with `converged = false`.

use std::fmt::Write;
use std::sync::Arc;

use argmin::core::observers::{Observe, ObserverMode};
use argmin::core::{
    CostFunction, Error as ArgminError, Executor, Gradient, IterState, State, TerminationReason,
    TerminationStatus, KV,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use ndarray::Array1;
use parking_lot::Mutex;

use varda_types::{AssimilationConfig, VardaError, VardaResult};

use crate::cost::Objective;

type Param = Array1<f64>;
type LineSearch = MoreThuenteLineSearch<Param, Param, f64>;
type LbfgsState = IterState<Param, Param, (), (), (), f64>;

/// One row of the iteration log.
#[derive(Clone, Debug)]
pub struct TraceRecord {
    pub iter: usize,
    pub f: f64,
    /// ‖∇J‖_∞ at the current iterate.
    pub grad_norm: f64,
    /// ‖w_k − w_{k−1}‖₂.
    pub step: Option<f64>,
    pub note: Option<&'static str>,
}

impl TraceRecord {
    fn format_line(&self) -> String {
        let mut line = format!("[lbfgs] iter {:>6} | f {:>13.6e} | grad {:>13.6e}", self.iter, self.f, self.grad_norm);
        if let Some(step) = self.step {
            let _ = write!(line, " | step {step:>9.3e}");
        }
        if let Some(note) = self.note {
            let _ = write!(line, " | note {note}");
        }
        line
    }
}

/// Outcome of one minimization.
#[derive(Clone, Debug)]
pub struct OptimizeResult {
    /// Best iterate found.
    pub w: Array1<f64>,
    pub f: f64,
    pub iters: usize,
    /// ‖∇J(w)‖_∞.
    pub grad_norm: f64,
    pub converged: bool,
    /// Distinct points at which the objective was evaluated.
    pub evaluations: usize,
    pub trace: Option<Vec<TraceRecord>>,
}

/// L-BFGS settings.
#[derive(Clone, Debug)]
pub struct Lbfgs {
    pub memory: usize,
    pub max_iters: usize,
    pub tol: f64,
    /// Sufficient-decrease constant.
    pub c1: f64,
    /// Curvature constant, c1 < c2 < 1.
    pub c2: f64,
    pub collect_trace: bool,
}

impl Default for Lbfgs {
    fn default() -> Self {
        Self {
            memory: 10,
            max_iters: 1000,
            tol: 1e-6,
            c1: 1e-4,
            c2: 0.9,
            collect_trace: false,
        }
    }
}

// ─── argmin adapter ─────────────────────────────────────────────────

#[derive(Default)]
struct EvalCache {
    last: Option<(Param, f64, Param)>,
    evaluations: usize,
}

/// argmin asks for cost and gradient separately; both come from one
/// `value_and_gradient` call per distinct point.
struct CachedObjective<'a> {
    objective: &'a dyn Objective,
    cache: &'a Mutex<EvalCache>,
}

impl CachedObjective<'_> {
    fn eval(&self, w: &Param) -> VardaResult<(f64, Param)> {
        let mut cache = self.cache.lock();
        if let Some((at, f, g)) = &cache.last {
            if at == w {
                return Ok((*f, g.clone()));
            }
        }
        let (f, g) = self.objective.value_and_gradient(w)?;
        VardaError::check_len("gradient", g.len(), w.len())?;
        if !f.is_finite() {
            return Err(VardaError::NumericalInstability(format!("objective is {f} during L-BFGS")));
        }
        cache.evaluations += 1;
        cache.last = Some((w.clone(), f, g.clone()));
        Ok((f, g))
    }
}

impl CostFunction for CachedObjective<'_> {
    type Param = Param;
    type Output = f64;

    fn cost(&self, w: &Self::Param) -> Result<Self::Output, ArgminError> {
        Ok(self.eval(w)?.0)
    }
}

impl Gradient for CachedObjective<'_> {
    type Param = Param;
    type Gradient = Param;

    fn gradient(&self, w: &Self::Param) -> Result<Self::Gradient, ArgminError> {
        Ok(self.eval(w)?.1)
    }
}

/// Logs every iteration at debug level, optionally keeping the rows.
struct TraceObserver {
    history: Option<Arc<Mutex<Vec<TraceRecord>>>>,
}

impl TraceObserver {
    fn emit(history: Option<&Arc<Mutex<Vec<TraceRecord>>>>, record: TraceRecord) {
        log::debug!("{}", record.format_line());
        if let Some(history) = history {
            history.lock().push(record);
        }
    }
}

impl Observe<LbfgsState> for TraceObserver {
    fn observe_iter(&mut self, state: &LbfgsState, _kv: &KV) -> Result<(), ArgminError> {
        let step = match (state.get_param(), state.get_prev_param()) {
            (Some(w), Some(prev)) => Some(l2_norm(&(w - prev))),
            _ => None,
        };
        let record = TraceRecord {
            iter: state.get_iter() as usize,
            f: state.get_cost(),
            grad_norm: state.get_gradient().map_or(f64::NAN, inf_norm),
            step,
            note: None,
        };
        Self::emit(self.history.as_ref(), record);
        Ok(())
    }
}

fn from_argmin(e: ArgminError) -> VardaError {
    match e.downcast::<VardaError>() {
        Ok(inner) => inner,
        Err(other) => VardaError::NumericalInstability(format!("L-BFGS failed: {other}")),
    }
}

impl Lbfgs {
    pub fn from_config(config: &AssimilationConfig) -> Self {
        Self {
            memory: config.lbfgs_memory,
            max_iters: config.max_iters,
            tol: config.tol,
            collect_trace: config.debug,
            ..Self::default()
        }
    }

    fn validate(&self) -> VardaResult<()> {
        if self.memory == 0 || self.max_iters == 0 {
            return Err(VardaError::InvalidConfiguration(format!(
                "L-BFGS memory and max_iters must be >= 1, got {}, {}",
                self.memory, self.max_iters
            )));
        }
        if !(self.tol > 0.0) || !(self.c1 > 0.0 && self.c1 < self.c2 && self.c2 < 1.0) {
            return Err(VardaError::InvalidConfiguration(format!(
                "L-BFGS requires tol > 0 and 0 < c1 < c2 < 1, got {}, {}, {}",
                self.tol, self.c1, self.c2
            )));
        }
        Ok(())
    }

    fn solver(&self) -> VardaResult<LBFGS<LineSearch, Param, Param, f64>> {
        let config_err = |e: ArgminError| VardaError::InvalidConfiguration(format!("L-BFGS setup: {e}"));
        let line_search = MoreThuenteLineSearch::new().with_c(self.c1, self.c2).map_err(config_err)?;
        LBFGS::new(line_search, self.memory)
            .with_tolerance_grad(self.tol)
            .and_then(|s| s.with_tolerance_cost(self.tol))
            .map_err(config_err)
    }

    /// Minimize `objective` starting from `w0`.
    pub fn minimize(&self, objective: &dyn Objective, w0: Array1<f64>) -> VardaResult<OptimizeResult> {
        self.validate()?;
        VardaError::check_len("initial guess w0", w0.len(), objective.dim())?;

        let cache = Mutex::new(EvalCache::default());
        let history = self.collect_trace.then(|| Arc::new(Mutex::new(Vec::new())));
        let observer = TraceObserver {
            history: history.clone(),
        };
        let problem = CachedObjective {
            objective,
            cache: &cache,
        };

        let w_start = w0.clone();
        let outcome = Executor::new(problem, self.solver()?)
            .configure(|state| state.param(w0).max_iters(self.max_iters as u64))
            .add_observer(observer, ObserverMode::Always)
            .run()
            .map_err(from_argmin)?;

        let state = outcome.state();
        let converged = match state.get_termination_status() {
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
            | TerminationStatus::Terminated(TerminationReason::TargetCostReached) => true,
            _ => false,
        };
        let note = match state.get_termination_reason() {
            Some(TerminationReason::SolverConverged) => "converged",
            Some(TerminationReason::MaxItersReached) => "max iters",
            _ => "stopped",
        };
        let iters = state.get_iter() as usize;
        let w = state.get_best_param().cloned().unwrap_or(w_start);

        let checker = CachedObjective {
            objective,
            cache: &cache,
        };
        let (f, grad) = checker.eval(&w)?;
        let grad_norm = inf_norm(&grad);
        TraceObserver::emit(
            history.as_ref(),
            TraceRecord {
                iter: iters,
                f,
                grad_norm,
                step: None,
                note: Some(note),
            },
        );

        let evaluations = cache.lock().evaluations;
        let trace = history.map(|h| std::mem::take(&mut *h.lock()));
        Ok(OptimizeResult {
            w,
            f,
            iters,
            grad_norm,
            converged,
            evaluations,
            trace,
        })
    }
}

fn inf_norm(v: &Array1<f64>) -> f64 {
    v.iter().fold(0.0f64, |m, x| m.max(x.abs()))
}

fn l2_norm(v: &Array1<f64>) -> f64 {
    v.dot(v).sqrt()
}
