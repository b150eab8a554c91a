// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — PyO3 FFI Bindings
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
// Note: #[deny(unsafe_code)] not applied — PyO3 proc macros generate
// unsafe blocks internally. All hand-written code in this crate is safe.
//! Python-callable wrappers around the Rust assimilation engine.
//!
//! Exposes `AssimilationConfig`, `AssimilationResults`, `run_linear` and
//! `run_nonlinear` to Python via PyO3.
//!
//! # FFI Safety
//!
//! - The GIL is released for the whole run (`Python::allow_threads`) and
//!   re-acquired via `Python::with_gil` inside every model callback.
//! - Python exceptions raised by callbacks become `InvalidState` errors
//!   and abort the run.
//! - Arrays cross the boundary as owned `list[float]` / `list[list[float]]`.
//! - All config validated before the run starts.
//!
//! Install: `pip install -e crates/varda-ffi` (requires maturin).
//!
//! Usage from Python:
//! ```python
//! from varda import AssimilationConfig, run_linear
//!
//! cfg = AssimilationConfig(n_modes=8, alpha=1e-3)
//! res = run_linear(cfg, snapshots, u_0, u_c, obs_indices=list(range(0, 500, 5)))
//! print(res.da_mae_mean, res.percent_improvement)
//! ```

use std::sync::Arc;

use ndarray::{Array1, Array2};
use pyo3::exceptions::{PyArithmeticError, PyNotImplementedError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use varda_core::nonlinear::{matrix_from_rows, ReductionModel};
use varda_core::{run, AssimilationData, NormalizationParams, ObservationOperator};
use varda_types::{
    AssimilationConfig, AssimilationResults, CompressionMethod, InitialGuess, JacobianMode, VardaError,
    VardaResult,
};

// ─── Error mapping ──────────────────────────────────────────────────

fn to_py_err(e: VardaError) -> PyErr {
    let msg = e.to_string();
    match e.root() {
        VardaError::InvalidConfiguration(_) | VardaError::InvalidArgument(_) => PyValueError::new_err(msg),
        VardaError::Unimplemented(_) => PyNotImplementedError::new_err(msg),
        VardaError::NumericalInstability(_) => PyArithmeticError::new_err(msg),
        _ => PyRuntimeError::new_err(msg),
    }
}

fn to_array2(name: &str, rows: Vec<Vec<f64>>) -> PyResult<Array2<f64>> {
    matrix_from_rows(name, rows).map_err(to_py_err)
}

fn observation_operator(
    n: usize,
    obs_indices: Option<Vec<usize>>,
    g: Option<Vec<Vec<f64>>>,
) -> PyResult<ObservationOperator> {
    match (obs_indices, g) {
        (Some(_), Some(_)) => Err(PyValueError::new_err("pass either obs_indices or g, not both")),
        (Some(idx), None) => ObservationOperator::selection(idx, n).map_err(to_py_err),
        (None, Some(rows)) => Ok(ObservationOperator::dense(to_array2("g", rows)?)),
        (None, None) => Ok(ObservationOperator::identity(n)),
    }
}

/// Attach misfit and normalization, then run with the GIL released.
fn finish_and_run(
    py: Python<'_>,
    config: &AssimilationConfig,
    data: AssimilationData,
    d: Option<Vec<f64>>,
    mean: Option<Vec<f64>>,
    std: Option<Vec<f64>>,
) -> PyResult<PyAssimilationResults> {
    let data = match (mean, std) {
        (Some(mean), Some(std)) => {
            let params = NormalizationParams::new(Array1::from(mean), Array1::from(std)).map_err(to_py_err)?;
            data.with_normalization(params)
        }
        (None, None) => data,
        _ => return Err(PyValueError::new_err("mean and std must be given together")),
    };
    let data = match d {
        Some(d) => data.with_misfit(Array1::from(d)),
        None => data.observe_truth().map_err(to_py_err)?,
    };
    log::debug!("python run: {data:?}");
    let inner = py.allow_threads(|| run(config, &data)).map_err(to_py_err)?;
    Ok(PyAssimilationResults { inner })
}

// ─── PyAssimilationConfig ───────────────────────────────────────────

/// Python-visible configuration for one assimilation run.
#[pyclass(name = "AssimilationConfig")]
#[derive(Clone)]
struct PyAssimilationConfig {
    inner: AssimilationConfig,
}

#[pymethods]
impl PyAssimilationConfig {
    #[new]
    #[pyo3(signature = (
        compression = "LINEAR",
        n_modes = None,
        obs_variance = None,
        obs_inverse_covariance = None,
        alpha = 1.0,
        tol = 1e-6,
        max_iters = 1000,
        lbfgs_memory = 10,
        jacobian = "AUTO",
        fd_eps = 1e-5,
        initial_guess = "PROJECTION",
        undo_normalize = true,
        verify_factorization = false,
        debug = false,
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        compression: &str,
        n_modes: Option<usize>,
        obs_variance: Option<f64>,
        obs_inverse_covariance: Option<Vec<Vec<f64>>>,
        alpha: f64,
        tol: f64,
        max_iters: usize,
        lbfgs_memory: usize,
        jacobian: &str,
        fd_eps: f64,
        initial_guess: &str,
        undo_normalize: bool,
        verify_factorization: bool,
        debug: bool,
    ) -> PyResult<Self> {
        let obs_inverse_covariance = obs_inverse_covariance
            .map(|rows| to_array2("obs_inverse_covariance", rows))
            .transpose()?;
        // σ² = 1 unless the caller chose a noise form.
        let obs_variance = match (obs_variance, &obs_inverse_covariance) {
            (None, None) => Some(1.0),
            (var, _) => var,
        };
        let inner = AssimilationConfig {
            compression: compression.parse::<CompressionMethod>().map_err(to_py_err)?,
            n_modes,
            obs_variance,
            obs_inverse_covariance,
            alpha,
            tol,
            max_iters,
            lbfgs_memory,
            jacobian: jacobian.parse::<JacobianMode>().map_err(to_py_err)?,
            fd_eps,
            initial_guess: initial_guess.parse::<InitialGuess>().map_err(to_py_err)?,
            undo_normalize,
            verify_factorization,
            debug,
        };
        inner.validate().map_err(to_py_err)?;
        Ok(Self { inner })
    }

    #[staticmethod]
    fn from_json(json: &str) -> PyResult<Self> {
        let inner = AssimilationConfig::from_json(json).map_err(to_py_err)?;
        inner.validate().map_err(to_py_err)?;
        Ok(Self { inner })
    }

    fn to_json(&self) -> PyResult<String> {
        self.inner.to_json().map_err(to_py_err)
    }

    #[getter]
    fn compression(&self) -> String {
        self.inner.compression.to_string()
    }

    #[getter]
    fn n_modes(&self) -> Option<usize> {
        self.inner.n_modes
    }

    #[getter]
    fn alpha(&self) -> f64 {
        self.inner.alpha
    }

    #[getter]
    fn tol(&self) -> f64 {
        self.inner.tol
    }

    #[getter]
    fn max_iters(&self) -> usize {
        self.inner.max_iters
    }

    fn __repr__(&self) -> String {
        format!(
            "AssimilationConfig(compression={}, n_modes={:?}, alpha={}, tol={:e}, max_iters={})",
            self.inner.compression, self.inner.n_modes, self.inner.alpha, self.inner.tol, self.inner.max_iters
        )
    }
}

// ─── PyAssimilationResults ──────────────────────────────────────────

/// Python-visible outcome of one run.
#[pyclass(name = "AssimilationResults")]
#[derive(Clone)]
struct PyAssimilationResults {
    inner: AssimilationResults,
}

#[pymethods]
impl PyAssimilationResults {
    #[getter]
    fn w_opt(&self) -> Vec<f64> {
        self.inner.w_opt.to_vec()
    }

    #[getter]
    fn u_da(&self) -> Vec<f64> {
        self.inner.u_da.to_vec()
    }

    #[getter]
    fn ref_mae(&self) -> Vec<f64> {
        self.inner.stats.ref_mae.to_vec()
    }

    #[getter]
    fn da_mae(&self) -> Vec<f64> {
        self.inner.stats.da_mae.to_vec()
    }

    #[getter]
    fn ref_mae_mean(&self) -> f64 {
        self.inner.ref_mae_mean()
    }

    #[getter]
    fn da_mae_mean(&self) -> f64 {
        self.inner.da_mae_mean()
    }

    #[getter]
    fn percent_improvement(&self) -> f64 {
        self.inner.percent_improvement()
    }

    #[getter]
    fn n_modes(&self) -> usize {
        self.inner.n_modes
    }

    #[getter]
    fn iterations(&self) -> usize {
        self.inner.iterations
    }

    #[getter]
    fn converged(&self) -> bool {
        self.inner.converged
    }

    #[getter]
    fn warnings(&self) -> Vec<String> {
        self.inner.warnings.iter().map(ToString::to_string).collect()
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("w_opt", self.inner.w_opt.to_vec())?;
        dict.set_item("u_da", self.inner.u_da.to_vec())?;
        dict.set_item("ref_MAE", self.inner.stats.ref_mae.to_vec())?;
        dict.set_item("da_MAE", self.inner.stats.da_mae.to_vec())?;
        dict.set_item("ref_MAE_mean", self.inner.ref_mae_mean())?;
        dict.set_item("da_MAE_mean", self.inner.da_mae_mean())?;
        dict.set_item("percent_improvement", self.inner.percent_improvement())?;
        dict.set_item("n_modes", self.inner.n_modes)?;
        dict.set_item("iterations", self.inner.iterations)?;
        dict.set_item("converged", self.inner.converged)?;
        dict.set_item("cost_initial", self.inner.cost_initial.total)?;
        dict.set_item("cost_final", self.inner.cost_final.total)?;
        dict.set_item("warnings", self.warnings())?;
        Ok(dict)
    }

    fn __repr__(&self) -> String {
        format!(
            "AssimilationResults(n_modes={}, ref_MAE_mean={:.6e}, da_MAE_mean={:.6e}, improvement={:.2}%)",
            self.inner.n_modes,
            self.inner.ref_mae_mean(),
            self.inner.da_mae_mean(),
            self.inner.percent_improvement()
        )
    }
}

// ─── PyCallbackModel ────────────────────────────────────────────────

/// Encoder/decoder implemented by Python callables.
struct PyCallbackModel {
    encode: PyObject,
    decode: PyObject,
    jacobian: Option<PyObject>,
    latent_dim: usize,
    full_dim: usize,
    device: String,
}

impl PyCallbackModel {
    fn call_vector(&self, name: &str, cb: &PyObject, x: &Array1<f64>) -> VardaResult<Array1<f64>> {
        Python::with_gil(|py| {
            cb.call1(py, (x.to_vec(),))
                .and_then(|out| out.extract::<Vec<f64>>(py))
                .map(Array1::from)
                .map_err(|e| VardaError::InvalidState(format!("{name} callback failed: {e}")))
        })
    }
}

impl ReductionModel for PyCallbackModel {
    fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    fn full_dim(&self) -> usize {
        self.full_dim
    }

    fn encode(&self, u: &Array1<f64>) -> VardaResult<Array1<f64>> {
        self.call_vector("encode", &self.encode, u)
    }

    fn decode(&self, w: &Array1<f64>) -> VardaResult<Array1<f64>> {
        self.call_vector("decode", &self.decode, w)
    }

    fn has_explicit_jacobian(&self) -> bool {
        self.jacobian.is_some()
    }

    fn jacobian(&self, w: &Array1<f64>) -> VardaResult<Array2<f64>> {
        let Some(cb) = &self.jacobian else {
            return Err(VardaError::Unimplemented(
                "no jacobian callable was supplied".to_string(),
            ));
        };
        let rows = Python::with_gil(|py| {
            cb.call1(py, (w.to_vec(),))
                .and_then(|out| out.extract::<Vec<Vec<f64>>>(py))
                .map_err(|e| VardaError::InvalidState(format!("jacobian callback failed: {e}")))
        })?;
        matrix_from_rows("jacobian callback result", rows).map_err(|e| match e {
            VardaError::InvalidArgument(msg) => VardaError::InvalidState(msg),
            other => other,
        })
    }

    fn device(&self) -> &str {
        &self.device
    }
}

// ─── Entry points ───────────────────────────────────────────────────

/// Assimilate with a truncated-SVD reduction of `snapshots` (n rows × M columns).
///
/// Without `d`, perfect observations of `u_c` are assumed.
#[pyfunction]
#[pyo3(signature = (config, snapshots, u_0, u_c, d = None, obs_indices = None, g = None, mean = None, std = None))]
#[allow(clippy::too_many_arguments)]
fn run_linear(
    py: Python<'_>,
    config: &PyAssimilationConfig,
    snapshots: Vec<Vec<f64>>,
    u_0: Vec<f64>,
    u_c: Vec<f64>,
    d: Option<Vec<f64>>,
    obs_indices: Option<Vec<usize>>,
    g: Option<Vec<Vec<f64>>>,
    mean: Option<Vec<f64>>,
    std: Option<Vec<f64>>,
) -> PyResult<PyAssimilationResults> {
    if config.inner.compression != CompressionMethod::Linear {
        return Err(PyValueError::new_err(format!(
            "run_linear needs compression=LINEAR, config has {}",
            config.inner.compression
        )));
    }
    let v = to_array2("snapshots", snapshots)?;
    let g = observation_operator(u_0.len(), obs_indices, g)?;
    let data = AssimilationData::linear(v, Array1::from(u_0), Array1::from(u_c), g);
    finish_and_run(py, &config.inner, data, d, mean, std)
}

/// Assimilate through Python `encode(u) -> w` / `decode(w) -> δu` callables.
///
/// `jacobian(w)` may return the n×k matrix ∂decode/∂w as a list of rows;
/// without it, central differences over `decode` are used.
#[pyfunction]
#[pyo3(signature = (
    config, encode, decode, latent_dim, u_0, u_c,
    jacobian = None, d = None, obs_indices = None, g = None, mean = None, std = None, device = "cpu",
))]
#[allow(clippy::too_many_arguments)]
fn run_nonlinear(
    py: Python<'_>,
    config: &PyAssimilationConfig,
    encode: PyObject,
    decode: PyObject,
    latent_dim: usize,
    u_0: Vec<f64>,
    u_c: Vec<f64>,
    jacobian: Option<PyObject>,
    d: Option<Vec<f64>>,
    obs_indices: Option<Vec<usize>>,
    g: Option<Vec<Vec<f64>>>,
    mean: Option<Vec<f64>>,
    std: Option<Vec<f64>>,
    device: &str,
) -> PyResult<PyAssimilationResults> {
    if config.inner.compression != CompressionMethod::Nonlinear {
        return Err(PyValueError::new_err(format!(
            "run_nonlinear needs compression=NONLINEAR, config has {}",
            config.inner.compression
        )));
    }
    let n = u_0.len();
    let model: Arc<dyn ReductionModel> = Arc::new(PyCallbackModel {
        encode,
        decode,
        jacobian,
        latent_dim,
        full_dim: n,
        device: device.to_string(),
    });
    let g = observation_operator(n, obs_indices, g)?;
    let data = AssimilationData::nonlinear(model, Array1::from(u_0), Array1::from(u_c), g);
    finish_and_run(py, &config.inner, data, d, mean, std)
}

// ─── Module ─────────────────────────────────────────────────────────

#[pymodule]
fn varda(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyAssimilationConfig>()?;
    m.add_class::<PyAssimilationResults>()?;
    m.add_function(wrap_pyfunction!(run_linear, m)?)?;
    m.add_function(wrap_pyfunction!(run_nonlinear, m)?)?;
    Ok(())
}

