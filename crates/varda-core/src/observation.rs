// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Observation Operator
// ─────────────────────────────────────────────────────────────────────
//! G: full state space (n) → observation space (m).

use ndarray::{Array1, Array2};

use varda_types::{VardaError, VardaResult};

/// Linear observation operator.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservationOperator {
    /// Dense m×n matrix.
    Dense(Array2<f64>),
    /// Point observations: row i of G is the unit vector e_{indices[i]}.
    Selection { indices: Vec<usize>, full_dim: usize },
}

impl ObservationOperator {
    pub fn dense(g: Array2<f64>) -> Self {
        ObservationOperator::Dense(g)
    }

    /// Observe the listed state components. Fails on out-of-range indices.
    pub fn selection(indices: Vec<usize>, full_dim: usize) -> VardaResult<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= full_dim) {
            return Err(VardaError::InvalidArgument(format!(
                "observation index {bad} out of range for state dimension {full_dim}"
            )));
        }
        Ok(ObservationOperator::Selection { indices, full_dim })
    }

    /// Observe every `stride`-th component starting at 0.
    pub fn every(stride: usize, full_dim: usize) -> VardaResult<Self> {
        if stride == 0 {
            return Err(VardaError::InvalidArgument(
                "observation stride must be >= 1".to_string(),
            ));
        }
        Self::selection((0..full_dim).step_by(stride).collect(), full_dim)
    }

    /// Identity on an n-dimensional state.
    pub fn identity(full_dim: usize) -> Self {
        ObservationOperator::Selection {
            indices: (0..full_dim).collect(),
            full_dim,
        }
    }

    /// m.
    pub fn n_obs(&self) -> usize {
        match self {
            ObservationOperator::Dense(g) => g.nrows(),
            ObservationOperator::Selection { indices, .. } => indices.len(),
        }
    }

    /// n.
    pub fn full_dim(&self) -> usize {
        match self {
            ObservationOperator::Dense(g) => g.ncols(),
            ObservationOperator::Selection { full_dim, .. } => *full_dim,
        }
    }

    /// G·x.
    pub fn apply(&self, x: &Array1<f64>) -> VardaResult<Array1<f64>> {
        VardaError::check_len("state passed to G", x.len(), self.full_dim())?;
        Ok(match self {
            ObservationOperator::Dense(g) => g.dot(x),
            ObservationOperator::Selection { indices, .. } => {
                indices.iter().map(|&i| x[i]).collect()
            }
        })
    }

    /// Gᵀ·y.
    pub fn apply_transpose(&self, y: &Array1<f64>) -> VardaResult<Array1<f64>> {
        VardaError::check_len("observation vector passed to G^T", y.len(), self.n_obs())?;
        Ok(match self {
            ObservationOperator::Dense(g) => g.t().dot(y),
            ObservationOperator::Selection { indices, full_dim } => {
                let mut out = Array1::zeros(*full_dim);
                for (&i, &v) in indices.iter().zip(y.iter()) {
                    out[i] += v;
                }
                out
            }
        })
    }

    pub fn to_dense(&self) -> Array2<f64> {
        match self {
            ObservationOperator::Dense(g) => g.clone(),
            ObservationOperator::Selection { indices, full_dim } => {
                let mut g = Array2::zeros((indices.len(), *full_dim));
                for (row, &i) in indices.iter().enumerate() {
                    g[[row, i]] = 1.0;
                }
                g
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_selection_matches_dense() {
        let sel = ObservationOperator::selection(vec![0, 2, 2], 4).unwrap();
        let dense = ObservationOperator::dense(sel.to_dense());
        let x = array![1.0, -2.0, 3.0, 4.0];
        let y = array![0.5, 1.0, -1.0];
        assert_eq!(sel.apply(&x).unwrap(), dense.apply(&x).unwrap());
        assert_eq!(
            sel.apply_transpose(&y).unwrap(),
            dense.apply_transpose(&y).unwrap()
        );
    }

    #[test]
    fn test_every_stride() {
        let g = ObservationOperator::every(3, 10).unwrap();
        assert_eq!(g.n_obs(), 4);
        assert_eq!(g.full_dim(), 10);
    }

    #[test]
    fn test_out_of_range_index() {
        assert!(ObservationOperator::selection(vec![5], 5).is_err());
        assert!(ObservationOperator::every(0, 5).is_err());
    }

    #[test]
    fn test_shape_mismatch_is_invalid_state() {
        let g = ObservationOperator::identity(3);
        let err = g.apply(&array![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, VardaError::InvalidState(_)));
    }
}
