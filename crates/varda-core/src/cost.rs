// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Reduced-Space Cost Function
// ─────────────────────────────────────────────────────────────────────
//! J(w) = ½·α·w·w + J_o(w)
//!
//! with Q = G·reduce_to_full(w) − d and
//!   - isotropic noise: J_o = ½·Q·Q / σ²
//!   - explicit R⁻¹:    J_o = ½·Qᵀ·R⁻¹·Q
//!
//! ∇J = α·w + Jᵀ·Gᵀ·R⁻¹·Q, with the decoder Jacobian J evaluated at the
//! same w as Q.

use std::sync::Arc;

use ndarray::Array1;

use varda_types::{CostBreakdown, ObservationNoise, VardaError, VardaResult};

use crate::observation::ObservationOperator;
use crate::reduction::ReducedBasis;

/// Differentiable scalar objective over ℝᵏ.
pub trait Objective: Send + Sync {
    fn dim(&self) -> usize;

    fn value(&self, w: &Array1<f64>) -> VardaResult<f64>;

    fn gradient(&self, w: &Array1<f64>) -> VardaResult<Array1<f64>>;

    /// Value and gradient in one pass; implementors share work here.
    fn value_and_gradient(&self, w: &Array1<f64>) -> VardaResult<(f64, Array1<f64>)> {
        Ok((self.value(w)?, self.gradient(w)?))
    }
}

/// Inputs of the cost that stay fixed during one optimization.
#[derive(Clone)]
pub struct CostState {
    d: Array1<f64>,
    g: ObservationOperator,
    noise: ObservationNoise,
    alpha: f64,
    basis: Arc<dyn ReducedBasis>,
}

impl CostState {
    /// Bind the misfit inputs, checking every dimension against `basis`.
    pub fn new(
        d: Array1<f64>,
        g: ObservationOperator,
        noise: ObservationNoise,
        alpha: f64,
        basis: Arc<dyn ReducedBasis>,
    ) -> VardaResult<Self> {
        if !alpha.is_finite() || alpha < 0.0 {
            return Err(VardaError::InvalidConfiguration(format!(
                "alpha must be finite and >= 0, got {alpha}"
            )));
        }
        VardaError::check_len("observation operator columns", g.full_dim(), basis.full_dim())?;
        VardaError::check_len("misfit vector d", d.len(), g.n_obs())?;
        if let Some(m) = noise.n_obs() {
            if m != d.len() {
                return Err(VardaError::InvalidConfiguration(format!(
                    "obs_inverse_covariance is {m}x{m} but there are {} observations",
                    d.len()
                )));
            }
        }
        Ok(Self {
            d,
            g,
            noise,
            alpha,
            basis,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn misfit(&self) -> &Array1<f64> {
        &self.d
    }

    pub fn basis(&self) -> &Arc<dyn ReducedBasis> {
        &self.basis
    }

    /// Q = G·reduce_to_full(w) − d.
    pub fn innovation(&self, w: &Array1<f64>) -> VardaResult<Array1<f64>> {
        let du = self.basis.reduce_to_full(w)?;
        Ok(self.g.apply(&du)? - &self.d)
    }

    /// R⁻¹·Q.
    fn weighted(&self, q: &Array1<f64>) -> Array1<f64> {
        match &self.noise {
            ObservationNoise::IsotropicVariance(var) => q / *var,
            ObservationNoise::InverseCovariance(r_inv) => r_inv.dot(q),
        }
    }

    fn split(&self, w: &Array1<f64>, q: &Array1<f64>) -> (CostBreakdown, Array1<f64>) {
        let r_q = self.weighted(q);
        let j_b = 0.5 * self.alpha * w.dot(w);
        let j_o = 0.5 * q.dot(&r_q);
        (CostBreakdown::new(j_b, j_o), r_q)
    }

    /// J_b, J_o and their sum at `w`.
    pub fn breakdown(&self, w: &Array1<f64>) -> VardaResult<CostBreakdown> {
        self.check_w(w)?;
        let q = self.innovation(w)?;
        let (split, _) = self.split(w, &q);
        log::debug!("J_b = {:.4e}, J_o = {:.4e}", split.j_b, split.j_o);
        check_finite(split.total)?;
        Ok(split)
    }

    fn check_w(&self, w: &Array1<f64>) -> VardaResult<()> {
        VardaError::check_len("reduced state w", w.len(), self.basis.reduced_dim())
    }
}

fn check_finite(total: f64) -> VardaResult<()> {
    if !total.is_finite() {
        return Err(VardaError::NumericalInstability(format!(
            "cost evaluated to {total}"
        )));
    }
    Ok(())
}

impl Objective for CostState {
    fn dim(&self) -> usize {
        self.basis.reduced_dim()
    }

    fn value(&self, w: &Array1<f64>) -> VardaResult<f64> {
        Ok(self.breakdown(w)?.total)
    }

    fn gradient(&self, w: &Array1<f64>) -> VardaResult<Array1<f64>> {
        Ok(self.value_and_gradient(w)?.1)
    }

    fn value_and_gradient(&self, w: &Array1<f64>) -> VardaResult<(f64, Array1<f64>)> {
        self.check_w(w)?;
        let (du, jac) = self.basis.evaluate(w)?;
        let q = self.g.apply(&du)? - &self.d;
        let (split, r_q) = self.split(w, &q);
        check_finite(split.total)?;

        let grad = jac.t().dot(&self.g.apply_transpose(&r_q)?) + self.alpha * w;
        if grad.iter().any(|x| !x.is_finite()) {
            return Err(VardaError::NumericalInstability(
                "cost gradient contains non-finite entries".to_string(),
            ));
        }
        Ok((split.total, grad))
    }
}
