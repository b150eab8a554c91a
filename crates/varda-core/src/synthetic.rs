// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Synthetic Fields and Twin Experiments
// ─────────────────────────────────────────────────────────────────────
//! Deterministic test inputs: a seeded RNG, random snapshot matrices,
//! a closed-form nonlinear decoder and twin-experiment builders where
//! the truth is known exactly.

use std::sync::Arc;

use ndarray::{Array1, Array2};

use varda_types::{VardaError, VardaResult};

use crate::nonlinear::ReductionModel;
use crate::observation::ObservationOperator;
use crate::runner::AssimilationData;
use crate::svd::Svd;

/// Minimal xorshift64 RNG (no external dep).
#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0xDEAD_BEEF_CAFE_BABE } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform in [lo, hi).
    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }

    /// Approximate standard normal via Box-Muller.
    pub fn next_normal(&mut self) -> f64 {
        let u1 = self.next_f64().max(1e-300);
        let u2 = self.next_f64();
        (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }
}

/// rows×cols matrix with entries uniform in [-1, 1).
pub fn random_matrix(rows: usize, cols: usize, rng: &mut SimpleRng) -> Array2<f64> {
    Array2::from_shape_simple_fn((rows, cols), || rng.uniform(-1.0, 1.0))
}

/// Vector with entries uniform in [-1, 1).
pub fn random_vector(len: usize, rng: &mut SimpleRng) -> Array1<f64> {
    Array1::from_shape_simple_fn(len, || rng.uniform(-1.0, 1.0))
}

/// Vector of independent N(0, σ²) samples.
pub fn gaussian_noise(len: usize, sigma: f64, rng: &mut SimpleRng) -> Array1<f64> {
    Array1::from_shape_simple_fn(len, || sigma * rng.next_normal())
}

/// Nonlinear decoder δu = A·tanh(w) with a closed-form Jacobian
/// A·diag(1 − tanh²(w)). Encoding inverts through A⁺.
#[derive(Debug, Clone)]
pub struct TanhDecoder {
    a: Array2<f64>,
    a_plus: Array2<f64>,
    explicit_jacobian: bool,
}

impl TanhDecoder {
    /// `a` is n×k.
    pub fn new(a: Array2<f64>) -> VardaResult<Self> {
        let a_plus = Svd::compute(&a)?.pseudo_inverse();
        Ok(Self {
            a,
            a_plus,
            explicit_jacobian: true,
        })
    }

    /// Same decoder, advertising no closed-form Jacobian.
    pub fn without_jacobian(mut self) -> Self {
        self.explicit_jacobian = false;
        self
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.a
    }
}

impl ReductionModel for TanhDecoder {
    fn latent_dim(&self) -> usize {
        self.a.ncols()
    }

    fn full_dim(&self) -> usize {
        self.a.nrows()
    }

    fn encode(&self, u: &Array1<f64>) -> VardaResult<Array1<f64>> {
        VardaError::check_len("state passed to encode", u.len(), self.full_dim())?;
        let bound = 1.0 - 1e-12;
        Ok(self.a_plus.dot(u).mapv(|x| x.clamp(-bound, bound).atanh()))
    }

    fn decode(&self, w: &Array1<f64>) -> VardaResult<Array1<f64>> {
        VardaError::check_len("latent vector passed to decode", w.len(), self.latent_dim())?;
        Ok(self.a.dot(&w.mapv(f64::tanh)))
    }

    fn has_explicit_jacobian(&self) -> bool {
        self.explicit_jacobian
    }

    fn jacobian(&self, w: &Array1<f64>) -> VardaResult<Array2<f64>> {
        if !self.explicit_jacobian {
            return Err(VardaError::Unimplemented(
                "decoder was built without a Jacobian".to_string(),
            ));
        }
        VardaError::check_len("latent vector passed to jacobian", w.len(), self.latent_dim())?;
        let slope = w.mapv(|x| 1.0 - x.tanh().powi(2));
        Ok(&self.a * &slope)
    }
}

/// Twin experiment: the truth u_c is generated from a known reduced state.
#[derive(Debug, Clone)]
pub struct TwinExperiment {
    /// Snapshot matrix (linear twins) or decoder matrix A (nonlinear twins).
    pub basis: Array2<f64>,
    pub w_true: Array1<f64>,
    pub u_0: Array1<f64>,
    pub u_c: Array1<f64>,
    pub g: ObservationOperator,
}

impl TwinExperiment {
    /// u_0 = 0, u_c = V·w_true with V random n×k, every `stride`-th component observed.
    pub fn linear(n: usize, k: usize, stride: usize, seed: u64) -> VardaResult<Self> {
        let mut rng = SimpleRng::new(seed);
        let basis = random_matrix(n, k, &mut rng);
        let w_true = random_vector(k, &mut rng);
        let u_c = basis.dot(&w_true);
        Ok(Self {
            basis,
            w_true,
            u_0: Array1::zeros(n),
            u_c,
            g: ObservationOperator::every(stride, n)?,
        })
    }

    /// u_0 = 0, u_c = A·tanh(w_true) with A random n×k.
    pub fn nonlinear(n: usize, k: usize, stride: usize, seed: u64) -> VardaResult<Self> {
        let mut rng = SimpleRng::new(seed);
        let basis = random_matrix(n, k, &mut rng);
        let w_true = random_vector(k, &mut rng);
        let u_c = basis.dot(&w_true.mapv(f64::tanh));
        Ok(Self {
            basis,
            w_true,
            u_0: Array1::zeros(n),
            u_c,
            g: ObservationOperator::every(stride, n)?,
        })
    }

    /// Data for the LINEAR method, d = G·u_c.
    pub fn linear_data(&self) -> VardaResult<AssimilationData> {
        AssimilationData::linear(self.basis.clone(), self.u_0.clone(), self.u_c.clone(), self.g.clone())
            .observe_truth()
    }

    /// Data for the NONLINEAR method using `TanhDecoder` over the basis, d = G·u_c.
    pub fn nonlinear_data(&self, explicit_jacobian: bool) -> VardaResult<AssimilationData> {
        let mut decoder = TanhDecoder::new(self.basis.clone())?;
        if !explicit_jacobian {
            decoder = decoder.without_jacobian();
        }
        let model: Arc<dyn ReductionModel> = Arc::new(decoder);
        AssimilationData::nonlinear(model, self.u_0.clone(), self.u_c.clone(), self.g.clone())
            .observe_truth()
    }
}
