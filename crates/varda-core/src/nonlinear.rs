// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Nonlinear Reduction (encoder / decoder)
// ─────────────────────────────────────────────────────────────────────
//! Latent vector w → state increment through a caller-supplied model.
//!
//! Two Jacobian sources:
//!   - explicit: the model's closed-form ∂decode/∂w
//!   - numerical: central differences over `decode`, one column per
//!     latent coordinate, columns evaluated in parallel
//!
//! The source is fixed when the reduction is built, never per call.

use std::fmt;
use std::sync::Arc;

use ndarray::{Array1, Array2};
use rayon::prelude::*;

use varda_types::{AssimilationWarning, JacobianMode, VardaError, VardaResult};

/// Encoder/decoder pair for the NONLINEAR compression method.
///
/// `decode(w)` returns the state increment δu (length n) for a latent
/// vector of length k. Models are shared across batch workers.
pub trait ReductionModel: Send + Sync {
    /// k.
    fn latent_dim(&self) -> usize;

    /// n.
    fn full_dim(&self) -> usize;

    fn encode(&self, u: &Array1<f64>) -> VardaResult<Array1<f64>>;

    fn decode(&self, w: &Array1<f64>) -> VardaResult<Array1<f64>>;

    /// Whether `jacobian` is implemented.
    fn has_explicit_jacobian(&self) -> bool {
        false
    }

    /// Closed-form ∂decode/∂w at `w`, n×k.
    fn jacobian(&self, _w: &Array1<f64>) -> VardaResult<Array2<f64>> {
        Err(VardaError::Unimplemented(
            "reduction model has no explicit Jacobian".to_string(),
        ))
    }

    /// Acquire whatever compute resource the model runs on.
    ///
    /// Failures surface as `ResourceUnavailable` and are not retried.
    fn prepare(&self) -> VardaResult<()> {
        Ok(())
    }

    fn device(&self) -> &str {
        "cpu"
    }
}

/// Resolved Jacobian source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JacobianSource {
    Explicit,
    Numerical { eps: f64 },
}

/// Nonlinear reduction operator built from a `ReductionModel`.
#[derive(Clone)]
pub struct NonlinearReduction {
    model: Arc<dyn ReductionModel>,
    source: JacobianSource,
    warnings: Vec<AssimilationWarning>,
}

impl fmt::Debug for NonlinearReduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonlinearReduction")
            .field("latent_dim", &self.model.latent_dim())
            .field("full_dim", &self.model.full_dim())
            .field("device", &self.model.device())
            .field("source", &self.source)
            .finish()
    }
}

impl NonlinearReduction {
    /// Prepare the model and pick the Jacobian source for `mode`.
    pub fn new(model: Arc<dyn ReductionModel>, mode: JacobianMode, fd_eps: f64) -> VardaResult<Self> {
        if model.latent_dim() == 0 || model.full_dim() == 0 {
            return Err(VardaError::InvalidArgument(format!(
                "reduction model dimensions must be positive, got latent {} / full {}",
                model.latent_dim(),
                model.full_dim()
            )));
        }
        if !fd_eps.is_finite() || fd_eps <= 0.0 {
            return Err(VardaError::InvalidConfiguration(format!(
                "fd_eps must be finite and > 0, got {fd_eps}"
            )));
        }

        model.prepare().map_err(|e| match e {
            VardaError::ResourceUnavailable(msg) => VardaError::ResourceUnavailable(msg),
            other => VardaError::ResourceUnavailable(format!(
                "model preparation on device {:?} failed: {other}",
                model.device()
            )),
        })?;

        let explicit = model.has_explicit_jacobian();
        let source = match (mode, explicit) {
            (JacobianMode::Explicit, false) => {
                return Err(VardaError::Unimplemented(
                    "jacobian = EXPLICIT but the reduction model provides no Jacobian".to_string(),
                ));
            }
            (JacobianMode::Explicit, true) | (JacobianMode::Auto, true) => JacobianSource::Explicit,
            (JacobianMode::NumericalFallback, _) | (JacobianMode::Auto, false) => {
                JacobianSource::Numerical { eps: fd_eps }
            }
        };

        let mut warnings = Vec::new();
        if let JacobianSource::Numerical { .. } = source {
            warnings.push(
                AssimilationWarning::SlowJacobian {
                    decodes_per_gradient: 2 * model.latent_dim() + 1,
                }
                .emit(),
            );
        }

        log::info!(
            "Nonlinear reduction: latent {} → full {} on {} ({:?} Jacobian)",
            model.latent_dim(),
            model.full_dim(),
            model.device(),
            source
        );

        Ok(Self {
            model,
            source,
            warnings,
        })
    }

    pub fn model(&self) -> &Arc<dyn ReductionModel> {
        &self.model
    }

    pub fn source(&self) -> JacobianSource {
        self.source
    }

    pub fn warnings(&self) -> &[AssimilationWarning] {
        &self.warnings
    }

    pub fn latent_dim(&self) -> usize {
        self.model.latent_dim()
    }

    pub fn full_dim(&self) -> usize {
        self.model.full_dim()
    }

    /// Latent code of a full state, length-checked.
    pub fn encode(&self, u: &Array1<f64>) -> VardaResult<Array1<f64>> {
        VardaError::check_len("state passed to encode", u.len(), self.full_dim())?;
        let w = self.model.encode(u)?;
        VardaError::check_len("encoded latent vector", w.len(), self.latent_dim())?;
        Ok(w)
    }

    /// Increment δu = decode(w), length-checked.
    pub fn decode(&self, w: &Array1<f64>) -> VardaResult<Array1<f64>> {
        VardaError::check_len("latent vector passed to decode", w.len(), self.latent_dim())?;
        let du = self.model.decode(w)?;
        VardaError::check_len("decoded increment", du.len(), self.full_dim())?;
        Ok(du)
    }

    /// ∂decode/∂w at `w` from the resolved source, n×k.
    pub fn jacobian(&self, w: &Array1<f64>) -> VardaResult<Array2<f64>> {
        VardaError::check_len("latent vector passed to jacobian", w.len(), self.latent_dim())?;
        let jac = match self.source {
            JacobianSource::Explicit => self.model.jacobian(w)?,
            JacobianSource::Numerical { eps } => numerical_jacobian(w, eps, |x| self.decode(x))?,
        };
        let expected = (self.full_dim(), self.latent_dim());
        if jac.dim() != expected {
            return Err(VardaError::InvalidState(format!(
                "decoder Jacobian has shape {:?}, expected {:?}",
                jac.dim(),
                expected
            )));
        }
        Ok(jac)
    }
}

/// Central-difference Jacobian of `f` at `w`.
///
/// Column j is (f(w + h·e_j) − f(w − h·e_j)) / 2h with
/// h = eps·(1 + |w_j|). Columns are computed on the rayon pool.
pub fn numerical_jacobian<F>(w: &Array1<f64>, eps: f64, f: F) -> VardaResult<Array2<f64>>
where
    F: Fn(&Array1<f64>) -> VardaResult<Array1<f64>> + Sync,
{
    let k = w.len();
    let columns: Vec<Array1<f64>> = (0..k)
        .into_par_iter()
        .map(|j| {
            let h = eps * (1.0 + w[j].abs());
            let mut plus = w.clone();
            plus[j] += h;
            let mut minus = w.clone();
            minus[j] -= h;
            let f_plus = f(&plus)?;
            let f_minus = f(&minus)?;
            if f_plus.len() != f_minus.len() {
                return Err(VardaError::InvalidState(format!(
                    "decode output length changed between probes ({} vs {})",
                    f_plus.len(),
                    f_minus.len()
                )));
            }
            Ok((f_plus - f_minus) / (2.0 * h))
        })
        .collect::<VardaResult<Vec<_>>>()?;

    let n = columns.first().map_or(0, |c| c.len());
    let mut jac = Array2::zeros((n, k));
    for (j, col) in columns.iter().enumerate() {
        VardaError::check_len("finite-difference column", col.len(), n)?;
        jac.column_mut(j).assign(col);
    }
    if jac.iter().any(|x| !x.is_finite()) {
        return Err(VardaError::NumericalInstability(
            "finite-difference Jacobian contains non-finite entries".to_string(),
        ));
    }
    Ok(jac)
}

/// Dense matrix from row-major nested rows. Every row must have the
/// length of the first; a ragged input is `InvalidArgument`.
pub fn matrix_from_rows(name: &str, rows: Vec<Vec<f64>>) -> VardaResult<Array2<f64>> {
    let n_rows = rows.len();
    let n_cols = rows.first().map_or(0, Vec::len);
    if let Some(bad) = rows.iter().position(|r| r.len() != n_cols) {
        return Err(VardaError::InvalidArgument(format!(
            "{name}: row {bad} has {} entries, expected {n_cols}",
            rows[bad].len()
        )));
    }
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((n_rows, n_cols), flat)
        .map_err(|e| VardaError::InvalidArgument(format!("{name}: {e}")))
}
