// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Error Statistics
// ─────────────────────────────────────────────────────────────────────

use ndarray::Array1;

use varda_types::{AssimilationWarning, ErrorStatistics, VardaError, VardaResult};

/// Compare background `u_0` and analysis `u_da` against the truth `u_c`.
///
/// Returns the statistics and, when ref_MAE_mean is zero, a
/// `ZeroReferenceError` warning (percent improvement is then reported as 0).
pub fn compute(
    u_0: &Array1<f64>,
    u_c: &Array1<f64>,
    u_da: &Array1<f64>,
) -> VardaResult<(ErrorStatistics, Option<AssimilationWarning>)> {
    VardaError::check_len("background u_0", u_0.len(), u_c.len())?;
    VardaError::check_len("analysis u_DA", u_da.len(), u_c.len())?;
    if u_c.is_empty() {
        return Err(VardaError::InvalidState("empty state vectors".to_string()));
    }

    let ref_mae = (u_0 - u_c).mapv(f64::abs);
    let da_mae = (u_da - u_c).mapv(f64::abs);
    let n = u_c.len() as f64;
    let ref_mae_mean = ref_mae.sum() / n;
    let da_mae_mean = da_mae.sum() / n;

    let improved_count = ref_mae
        .iter()
        .zip(da_mae.iter())
        .filter(|(r, d)| r > d)
        .count();

    let (percent_improvement, warning) = if ref_mae_mean > 0.0 {
        (100.0 * (ref_mae_mean - da_mae_mean) / ref_mae_mean, None)
    } else {
        (0.0, Some(AssimilationWarning::ZeroReferenceError.emit()))
    };

    Ok((
        ErrorStatistics {
            ref_mae,
            da_mae,
            ref_mae_mean,
            da_mae_mean,
            improved_count,
            improved_fraction: improved_count as f64 / n,
            percent_improvement,
        },
        warning,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_statistics_values() {
        let u_c = array![1.0, 2.0, 3.0, 4.0];
        let u_0 = array![0.0, 2.0, 5.0, 4.5];
        let u_da = array![0.5, 2.5, 3.0, 4.5];
        let (stats, warning) = compute(&u_0, &u_c, &u_da).unwrap();
        assert!(warning.is_none());
        assert_eq!(stats.ref_mae, array![1.0, 0.0, 2.0, 0.5]);
        assert!((stats.ref_mae_mean - 0.875).abs() < 1e-15);
        assert!((stats.da_mae_mean - 0.375).abs() < 1e-15);
        assert_eq!(stats.improved_count, 2);
        assert!((stats.improved_fraction - 0.5).abs() < 1e-15);
        let expected = 100.0 * (0.875 - 0.375) / 0.875;
        assert!((stats.percent_improvement - expected).abs() < 1e-12);
    }

    #[test]
    fn test_zero_reference_error() {
        let u = array![1.0, 2.0];
        let (stats, warning) = compute(&u, &u, &array![1.5, 2.0]).unwrap();
        assert_eq!(stats.percent_improvement, 0.0);
        assert_eq!(warning, Some(AssimilationWarning::ZeroReferenceError));
    }

    #[test]
    fn test_length_mismatch() {
        let err = compute(&array![1.0], &array![1.0, 2.0], &array![1.0, 2.0]).unwrap_err();
        assert!(matches!(err, VardaError::InvalidState(_)));
    }
}
