// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Reduction Operators
// ─────────────────────────────────────────────────────────────────────
//! Reduced state w ↔ full-state increment δu.
//!
//! The cost and gradient kernels only see the `ReducedBasis` interface,
//! so linear and nonlinear reductions plug in interchangeably.

use std::borrow::Cow;

use ndarray::{Array1, Array2};

use varda_types::{AssimilationWarning, VardaError, VardaResult};

use crate::nonlinear::NonlinearReduction;
use crate::svd::{Svd, TruncatedSvd, TruncationPolicy};

/// Relative tolerance for the optional factorization self-check.
pub const VERIFY_TOL: f64 = 1e-6;

/// Capability set shared by every reduction.
pub trait ReducedBasis: Send + Sync {
    /// n.
    fn full_dim(&self) -> usize;

    /// Length of the reduced vector w.
    fn reduced_dim(&self) -> usize;

    /// δu for a reduced state.
    fn reduce_to_full(&self, w: &Array1<f64>) -> VardaResult<Array1<f64>>;

    /// ∂reduce_to_full/∂w at `w` (n × reduced_dim).
    fn jacobian(&self, w: &Array1<f64>) -> VardaResult<Cow<'_, Array2<f64>>>;

    /// δu and its Jacobian, both at the same `w`.
    fn evaluate(&self, w: &Array1<f64>) -> VardaResult<(Array1<f64>, Cow<'_, Array2<f64>>)> {
        let du = self.reduce_to_full(w)?;
        let jac = self.jacobian(w)?;
        Ok((du, jac))
    }

    /// Projection of the background onto the reduced space.
    fn project(&self, u_0: &Array1<f64>, baseline: Option<&Array1<f64>>) -> VardaResult<Array1<f64>>;
}

/// Truncated-SVD reduction: δu = V_trunc·w.
#[derive(Debug, Clone)]
pub struct LinearReduction {
    factors: TruncatedSvd,
    v_plus: Array2<f64>,
}

impl LinearReduction {
    pub fn new(factors: TruncatedSvd) -> Self {
        let v_plus = factors.pseudo_inverse();
        Self { factors, v_plus }
    }

    /// Factorize `v`, truncate by `policy` and optionally self-check.
    pub fn from_snapshots(v: &Array2<f64>, policy: TruncationPolicy, verify: bool) -> VardaResult<Self> {
        log::debug!("SVD of snapshot matrix {}x{}", v.nrows(), v.ncols());
        let svd = Svd::compute(v)?;
        let factors = svd.truncate(policy)?;
        if verify {
            factors.verify(&svd, v, VERIFY_TOL)?;
            log::info!("Factorization verified (rank {})", factors.rank());
        }
        Ok(Self::new(factors))
    }

    pub fn factors(&self) -> &TruncatedSvd {
        &self.factors
    }

    /// V_trunc (n×M).
    pub fn v_trunc(&self) -> &Array2<f64> {
        &self.factors.v_trunc
    }

    /// V⁺_trunc (M×n).
    pub fn v_plus(&self) -> &Array2<f64> {
        &self.v_plus
    }

    pub fn rank(&self) -> usize {
        self.factors.rank()
    }
}

impl ReducedBasis for LinearReduction {
    fn full_dim(&self) -> usize {
        self.factors.v_trunc.nrows()
    }

    fn reduced_dim(&self) -> usize {
        self.factors.v_trunc.ncols()
    }

    fn reduce_to_full(&self, w: &Array1<f64>) -> VardaResult<Array1<f64>> {
        VardaError::check_len("reduced state w", w.len(), self.reduced_dim())?;
        Ok(self.factors.v_trunc.dot(w))
    }

    fn jacobian(&self, w: &Array1<f64>) -> VardaResult<Cow<'_, Array2<f64>>> {
        VardaError::check_len("reduced state w", w.len(), self.reduced_dim())?;
        Ok(Cow::Borrowed(&self.factors.v_trunc))
    }

    fn project(&self, u_0: &Array1<f64>, baseline: Option<&Array1<f64>>) -> VardaResult<Array1<f64>> {
        VardaError::check_len("background u_0", u_0.len(), self.full_dim())?;
        match baseline {
            Some(b) => {
                VardaError::check_len("baseline", b.len(), self.full_dim())?;
                Ok(self.v_plus.dot(&(u_0 - b)))
            }
            None => Ok(self.v_plus.dot(u_0)),
        }
    }
}

impl ReducedBasis for NonlinearReduction {
    fn full_dim(&self) -> usize {
        NonlinearReduction::full_dim(self)
    }

    fn reduced_dim(&self) -> usize {
        self.latent_dim()
    }

    fn reduce_to_full(&self, w: &Array1<f64>) -> VardaResult<Array1<f64>> {
        self.decode(w)
    }

    fn jacobian(&self, w: &Array1<f64>) -> VardaResult<Cow<'_, Array2<f64>>> {
        NonlinearReduction::jacobian(self, w).map(Cow::Owned)
    }

    fn project(&self, u_0: &Array1<f64>, _baseline: Option<&Array1<f64>>) -> VardaResult<Array1<f64>> {
        self.encode(u_0)
    }
}

/// The reduction chosen by the configured compression method.
#[derive(Debug, Clone)]
pub enum ReductionOperator {
    Linear(LinearReduction),
    Nonlinear(NonlinearReduction),
}

impl ReductionOperator {
    /// Truncation rank (linear) or latent dimension (nonlinear).
    pub fn n_modes(&self) -> usize {
        match self {
            ReductionOperator::Linear(r) => r.rank(),
            ReductionOperator::Nonlinear(r) => r.latent_dim(),
        }
    }

    /// Warnings raised while building the operator.
    pub fn warnings(&self) -> &[AssimilationWarning] {
        match self {
            ReductionOperator::Linear(r) => &r.factors.warnings,
            ReductionOperator::Nonlinear(r) => r.warnings(),
        }
    }

    pub fn factors(&self) -> Option<&TruncatedSvd> {
        match self {
            ReductionOperator::Linear(r) => Some(r.factors()),
            ReductionOperator::Nonlinear(_) => None,
        }
    }

    fn basis(&self) -> &dyn ReducedBasis {
        match self {
            ReductionOperator::Linear(r) => r,
            ReductionOperator::Nonlinear(r) => r,
        }
    }
}

impl ReducedBasis for ReductionOperator {
    fn full_dim(&self) -> usize {
        self.basis().full_dim()
    }

    fn reduced_dim(&self) -> usize {
        self.basis().reduced_dim()
    }

    fn reduce_to_full(&self, w: &Array1<f64>) -> VardaResult<Array1<f64>> {
        self.basis().reduce_to_full(w)
    }

    fn jacobian(&self, w: &Array1<f64>) -> VardaResult<Cow<'_, Array2<f64>>> {
        self.basis().jacobian(w)
    }

    fn evaluate(&self, w: &Array1<f64>) -> VardaResult<(Array1<f64>, Cow<'_, Array2<f64>>)> {
        self.basis().evaluate(w)
    }

    fn project(&self, u_0: &Array1<f64>, baseline: Option<&Array1<f64>>) -> VardaResult<Array1<f64>> {
        self.basis().project(u_0, baseline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{random_matrix, random_vector, SimpleRng};

    fn linear(n: usize, m: usize, k: usize, seed: u64) -> (Array2<f64>, LinearReduction) {
        let mut rng = SimpleRng::new(seed);
        let v = random_matrix(n, m, &mut rng);
        let red = LinearReduction::from_snapshots(&v, TruncationPolicy::Explicit(k), true).unwrap();
        (v, red)
    }

    #[test]
    fn test_linear_dimensions() {
        let (_, red) = linear(30, 6, 4, 1);
        assert_eq!(red.full_dim(), 30);
        assert_eq!(red.reduced_dim(), 6);
        assert_eq!(red.rank(), 4);
        assert_eq!(red.v_plus().dim(), (6, 30));
    }

    #[test]
    fn test_full_rank_reduction_reproduces_snapshots() {
        let (v, red) = linear(25, 5, 5, 2);
        let mut rng = SimpleRng::new(3);
        let w = random_vector(5, &mut rng);
        let du = red.reduce_to_full(&w).unwrap();
        let expected = v.dot(&w);
        for (a, b) in du.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-10);
        }
    }

    #[test]
    fn test_projection_inverts_reduction_in_range() {
        let (_, red) = linear(25, 5, 5, 4);
        let mut rng = SimpleRng::new(5);
        let w = random_vector(5, &mut rng);
        let u = red.reduce_to_full(&w).unwrap();
        let back = red.project(&u, None).unwrap();
        let again = red.reduce_to_full(&back).unwrap();
        for (a, b) in again.iter().zip(u.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_projection_subtracts_baseline() {
        let (_, red) = linear(10, 3, 3, 6);
        let u = Array1::from_elem(10, 2.0);
        let with = red.project(&u, Some(&u)).unwrap();
        assert!(with.iter().all(|x| x.abs() < 1e-12));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let (_, red) = linear(10, 3, 2, 7);
        let err = red.reduce_to_full(&Array1::zeros(2)).unwrap_err();
        assert!(matches!(err, VardaError::InvalidState(_)));
    }

    #[test]
    fn test_operator_dispatch() {
        let (_, red) = linear(12, 4, 2, 8);
        let op = ReductionOperator::Linear(red);
        assert_eq!(op.n_modes(), 2);
        assert_eq!(op.reduced_dim(), 4);
        assert!(op.factors().is_some());
        let (du, jac) = op.evaluate(&Array1::ones(4)).unwrap();
        assert_eq!(du.len(), 12);
        assert_eq!(jac.dim(), (12, 4));
    }
}
