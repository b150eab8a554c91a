// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Per-Component Normalization
// ─────────────────────────────────────────────────────────────────────

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use varda_types::{VardaError, VardaResult};

/// Per-component mean and standard deviation of a snapshot set.
///
/// Normalized states are (x − mean) / std; `denormalize` inverts this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationParams {
    pub mean: Array1<f64>,
    pub std: Array1<f64>,
}

impl NormalizationParams {
    pub fn new(mean: Array1<f64>, std: Array1<f64>) -> VardaResult<Self> {
        VardaError::check_len("normalization std", std.len(), mean.len())?;
        if std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(VardaError::InvalidArgument(
                "normalization std must be finite and > 0".to_string(),
            ));
        }
        Ok(Self { mean, std })
    }

    /// Fit to snapshots stored as the columns of `snapshots` (n×M).
    ///
    /// Components with zero spread get std = 1.
    pub fn fit(snapshots: &Array2<f64>) -> VardaResult<Self> {
        if snapshots.ncols() == 0 {
            return Err(VardaError::InvalidArgument(
                "cannot fit normalization to zero snapshots".to_string(),
            ));
        }
        let mean = snapshots
            .mean_axis(Axis(1))
            .ok_or_else(|| VardaError::InvalidArgument("empty snapshot matrix".to_string()))?;
        let mut std = snapshots.std_axis(Axis(1), 0.0);
        let mut flat = 0usize;
        for s in std.iter_mut() {
            if *s <= f64::EPSILON {
                *s = 1.0;
                flat += 1;
            }
        }
        if flat > 0 {
            log::warn!("{flat} state components have zero spread; using std = 1 for them");
        }
        Self::new(mean, std)
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn normalize(&self, x: &Array1<f64>) -> VardaResult<Array1<f64>> {
        VardaError::check_len("state to normalize", x.len(), self.dim())?;
        Ok((x - &self.mean) / &self.std)
    }

    /// x·std + mean.
    pub fn denormalize(&self, x: &Array1<f64>) -> VardaResult<Array1<f64>> {
        VardaError::check_len("state to denormalize", x.len(), self.dim())?;
        Ok(x * &self.std + &self.mean)
    }

    /// Normalize every column of `snapshots`.
    pub fn normalize_columns(&self, snapshots: &Array2<f64>) -> VardaResult<Array2<f64>> {
        VardaError::check_len("snapshot rows", snapshots.nrows(), self.dim())?;
        let mean = self.mean.view().insert_axis(Axis(1));
        let std = self.std.view().insert_axis(Axis(1));
        Ok((snapshots - &mean) / &std)
    }
}
