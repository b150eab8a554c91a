// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Truncated SVD
// ─────────────────────────────────────────────────────────────────────
//! Snapshot matrix V (n×M) → U·diag(s)·W with rank-adaptive truncation.
//!
//! Includes a pure-Rust one-sided (Hestenes) Jacobi SVD. Column pairs
//! are rotated until mutually orthogonal; the column norms are then the
//! singular values. Wide matrices are factorized through their transpose.

use ndarray::{Array1, Array2};

use varda_types::{AssimilationWarning, VardaError, VardaResult};

const MAX_SWEEPS: usize = 60;
const TOL: f64 = 1e-14;

/// Rank selection rule for the truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationPolicy {
    /// Keep exactly this many modes (must be ≥ 1).
    Explicit(usize),
    /// Keep singular values strictly above √s₁, at least one.
    Adaptive,
}

impl TruncationPolicy {
    pub fn from_modes(n_modes: Option<usize>) -> Self {
        match n_modes {
            Some(k) => TruncationPolicy::Explicit(k),
            None => TruncationPolicy::Adaptive,
        }
    }
}

/// Thin factorization V = U·diag(s)·W, s descending.
#[derive(Debug, Clone)]
pub struct Svd {
    /// n×r, r = min(n, M). Columns for zero singular values are zero.
    pub u: Array2<f64>,
    /// r singular values, descending.
    pub s: Array1<f64>,
    /// r×M.
    pub w: Array2<f64>,
}

impl Svd {
    /// Factorize `v`. Fails on empty or non-finite input.
    pub fn compute(v: &Array2<f64>) -> VardaResult<Self> {
        let (rows, cols) = v.dim();
        if rows == 0 || cols == 0 {
            return Err(VardaError::InvalidArgument(format!(
                "snapshot matrix V must be non-empty, got {rows}x{cols}"
            )));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(VardaError::NumericalInstability(
                "snapshot matrix V contains non-finite entries".to_string(),
            ));
        }

        let mut svd = if rows >= cols {
            jacobi_svd_tall(v)
        } else {
            // Vᵀ = U'·Σ·W'  ⇒  V = W'ᵀ·Σ·U'ᵀ
            let t = jacobi_svd_tall(&v.t().to_owned());
            Svd {
                u: t.w.t().to_owned(),
                s: t.s,
                w: t.u.t().to_owned(),
            }
        };
        fix_signs(&mut svd);

        if svd.s.iter().any(|x| !x.is_finite()) {
            return Err(VardaError::NumericalInstability(
                "Jacobi SVD produced non-finite singular values".to_string(),
            ));
        }
        Ok(svd)
    }

    /// Largest singular value s₁ (0 for an all-zero matrix).
    pub fn largest(&self) -> f64 {
        self.s.get(0).copied().unwrap_or(0.0)
    }

    /// Singular values below this are treated as exact zeros.
    pub fn zero_tolerance(&self) -> f64 {
        zero_tolerance(self.largest(), self.u.nrows().max(self.w.ncols()))
    }

    /// Number of singular values above `zero_tolerance`.
    pub fn numerical_rank(&self) -> usize {
        let tol = self.zero_tolerance();
        self.s.iter().filter(|&&x| x > tol).count()
    }

    /// U·diag(s)·W.
    pub fn reconstruct(&self) -> Array2<f64> {
        (&self.u * &self.s).dot(&self.w)
    }

    /// Moore-Penrose inverse V⁺ = Wᵀ·diag(1/s)·Uᵀ (zero modes dropped).
    pub fn pseudo_inverse(&self) -> Array2<f64> {
        pseudo_inverse(&self.u, &self.s, &self.w, self.zero_tolerance())
    }

    /// Rank-k matrix built by zeroing s beyond k instead of slicing.
    pub fn reconstruct_zeroed(&self, k: usize) -> Array2<f64> {
        let mut s = self.s.clone();
        for v in s.iter_mut().skip(k) {
            *v = 0.0;
        }
        (&self.u * &s).dot(&self.w)
    }

    /// Slice the factors to the rank chosen by `policy`.
    pub fn truncate(&self, policy: TruncationPolicy) -> VardaResult<TruncatedSvd> {
        let available = self.numerical_rank();
        if available == 0 {
            return Err(VardaError::InvalidArgument(
                "snapshot matrix V has no non-zero singular value".to_string(),
            ));
        }

        let mut warnings = Vec::new();
        let k = match policy {
            TruncationPolicy::Explicit(0) => {
                return Err(VardaError::InvalidArgument(
                    "n_modes must be a positive integer, got 0".to_string(),
                ));
            }
            TruncationPolicy::Explicit(k) if k > available => {
                warnings.push(
                    AssimilationWarning::RankClamped {
                        requested: k,
                        used: available,
                    }
                    .emit(),
                );
                available
            }
            TruncationPolicy::Explicit(k) => k,
            TruncationPolicy::Adaptive => {
                let (k, degenerate) = adaptive_rank(self.s.as_slice().unwrap_or(&[]));
                if degenerate {
                    warnings.push(
                        AssimilationWarning::DegenerateRank {
                            largest_singular_value: self.largest(),
                        }
                        .emit(),
                    );
                }
                k.min(available)
            }
        };

        log::info!("# modes kept: {k}");

        let u = self.u.slice(ndarray::s![.., ..k]).to_owned();
        let s = self.s.slice(ndarray::s![..k]).to_owned();
        let w = self.w.slice(ndarray::s![..k, ..]).to_owned();
        let v_trunc = (&u * &s).dot(&w);
        Ok(TruncatedSvd {
            u,
            s,
            w,
            v_trunc,
            warnings,
        })
    }
}

/// Rank-k factors and the reduction matrix V_trunc = U_k·diag(s_k)·W_k.
#[derive(Debug, Clone)]
pub struct TruncatedSvd {
    /// n×k.
    pub u: Array2<f64>,
    /// k values, all > 0, descending.
    pub s: Array1<f64>,
    /// k×M.
    pub w: Array2<f64>,
    /// n×M.
    pub v_trunc: Array2<f64>,
    pub warnings: Vec<AssimilationWarning>,
}

impl TruncatedSvd {
    pub fn rank(&self) -> usize {
        self.s.len()
    }

    /// V⁺_trunc = W_kᵀ·diag(1/s_k)·U_kᵀ (M×n).
    pub fn pseudo_inverse(&self) -> Array2<f64> {
        pseudo_inverse(&self.u, &self.s, &self.w, 0.0)
    }

    /// Check the generalized-inverse identities and the zeroing path.
    ///
    /// `full` must be the factorization this truncation was sliced from.
    pub fn verify(&self, full: &Svd, v: &Array2<f64>, tol: f64) -> VardaResult<()> {
        let v_plus = full.pseudo_inverse();
        let err = relative_error(&v.dot(&v_plus).dot(v), v);
        if err >= tol {
            return Err(VardaError::InvalidState(format!(
                "V+ is not a generalized inverse of V (relative error {err:.3e} >= {tol:.1e})"
            )));
        }

        let vt_plus = self.pseudo_inverse();
        let err = relative_error(&self.v_trunc.dot(&vt_plus).dot(&self.v_trunc), &self.v_trunc);
        if err >= tol {
            return Err(VardaError::InvalidState(format!(
                "V+_trunc is not a generalized inverse of V_trunc (relative error {err:.3e} >= {tol:.1e})"
            )));
        }

        let zeroed = full.reconstruct_zeroed(self.rank());
        let err = relative_error(&zeroed, &self.v_trunc);
        if err >= tol {
            return Err(VardaError::InvalidState(format!(
                "zeroed and sliced truncations disagree (relative error {err:.3e} >= {tol:.1e})"
            )));
        }
        Ok(())
    }
}

/// Adaptive rank: count of s > √s₁, forced to 1 when none qualify.
///
/// Returns `(rank, degenerate)` where `degenerate` flags the forced case.
pub fn adaptive_rank(s: &[f64]) -> (usize, bool) {
    let Some(&s1) = s.first() else {
        return (1, true);
    };
    let threshold = s1.sqrt();
    let count = s.iter().filter(|&&x| x > threshold).count();
    if count == 0 {
        (1, true)
    } else {
        (count, false)
    }
}

/// ‖a − b‖_F / ‖b‖_F (absolute error when b is zero).
pub fn relative_error(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    let diff: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt();
    let norm = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        diff / norm
    } else {
        diff
    }
}

fn zero_tolerance(s1: f64, dim: usize) -> f64 {
    s1 * (dim as f64 * f64::EPSILON).max(1e-12)
}

fn pseudo_inverse(u: &Array2<f64>, s: &Array1<f64>, w: &Array2<f64>, zero_tol: f64) -> Array2<f64> {
    let inv = s.mapv(|x| if x > zero_tol { 1.0 / x } else { 0.0 });
    (&w.t() * &inv).dot(&u.t())
}

/// One-sided Jacobi SVD for rows ≥ cols.
fn jacobi_svd_tall(v: &Array2<f64>) -> Svd {
    let (rows, cols) = v.dim();
    let mut a = v.to_owned();
    let mut rot = Array2::<f64>::eye(cols);

    for _sweep in 0..MAX_SWEEPS {
        let mut max_off = 0.0f64;

        for p in 0..cols {
            for q in (p + 1)..cols {
                let alpha = a.column(p).dot(&a.column(p));
                let beta = a.column(q).dot(&a.column(q));
                let gamma = a.column(p).dot(&a.column(q));
                if alpha <= f64::MIN_POSITIVE || beta <= f64::MIN_POSITIVE {
                    continue;
                }

                let off = gamma.abs() / (alpha * beta).sqrt();
                max_off = max_off.max(off);
                if off < TOL {
                    continue;
                }

                // Smaller root of t² + 2ζt − 1 = 0 for stability
                let zeta = (beta - alpha) / (2.0 * gamma);
                let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = c * t;

                rotate_columns(&mut a, p, q, c, s);
                rotate_columns(&mut rot, p, q, c, s);
            }
        }

        if max_off < TOL {
            break;
        }
    }

    let norms: Vec<f64> = (0..cols)
        .map(|j| a.column(j).dot(&a.column(j)).sqrt())
        .collect();
    let mut order: Vec<usize> = (0..cols).collect();
    order.sort_by(|&i, &j| {
        norms[j]
            .partial_cmp(&norms[i])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let s1 = order.first().map_or(0.0, |&i| norms[i]);
    let zero_tol = zero_tolerance(s1, rows.max(cols));

    let mut u = Array2::<f64>::zeros((rows, cols));
    let mut s = Array1::<f64>::zeros(cols);
    let mut w = Array2::<f64>::zeros((cols, cols));
    for (new_col, &old_col) in order.iter().enumerate() {
        let sigma = norms[old_col];
        s[new_col] = sigma;
        if sigma > zero_tol {
            u.column_mut(new_col).assign(&(&a.column(old_col) / sigma));
        }
        w.row_mut(new_col).assign(&rot.column(old_col));
    }

    Svd { u, s, w }
}

fn rotate_columns(m: &mut Array2<f64>, p: usize, q: usize, c: f64, s: f64) {
    for r in 0..m.nrows() {
        let mp = m[[r, p]];
        let mq = m[[r, q]];
        m[[r, p]] = c * mp - s * mq;
        m[[r, q]] = s * mp + c * mq;
    }
}

/// Sign convention: largest-magnitude entry of each U column positive.
fn fix_signs(svd: &mut Svd) {
    for col in 0..svd.s.len() {
        let mut max_abs = 0.0;
        let mut max_idx = 0;
        for (row, v) in svd.u.column(col).iter().enumerate() {
            if v.abs() > max_abs {
                max_abs = v.abs();
                max_idx = row;
            }
        }
        if svd.u[[max_idx, col]] < 0.0 {
            svd.u.column_mut(col).mapv_inplace(|x| -x);
            svd.w.row_mut(col).mapv_inplace(|x| -x);
        }
    }
}
