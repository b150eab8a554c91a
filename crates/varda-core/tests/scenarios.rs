// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — End-to-End Assimilation Scenarios
// ─────────────────────────────────────────────────────────────────────

use std::sync::Arc;

use ndarray::{Array1, Array2};

use varda_core::nonlinear::ReductionModel;
use varda_core::synthetic::{random_matrix, SimpleRng, TanhDecoder, TwinExperiment};
use varda_core::{
    run, AssimilationConfig, AssimilationData, AssimilationRunner, AssimilationWarning, CompressionMethod,
    InitialGuess, JacobianMode, NormalizationParams, ObservationOperator, Stage, VardaError,
};

fn exact_linear_config() -> AssimilationConfig {
    AssimilationConfig {
        n_modes: Some(5),
        alpha: 1e-10,
        tol: 1e-12,
        ..Default::default()
    }
    .with_obs_variance(1.0)
}

#[test]
fn test_linear_twin_recovers_truth() {
    let twin = TwinExperiment::linear(100, 5, 4, 2024).unwrap();
    let data = twin.linear_data().unwrap();
    let res = run(&exact_linear_config(), &data).unwrap();

    assert_eq!(res.n_modes, 5);
    assert!(res.converged, "warnings: {:?}", res.warnings);
    for (got, want) in res.w_opt.iter().zip(twin.w_true.iter()) {
        assert!((got - want).abs() < 1e-3, "w_opt {got} vs w_true {want}");
    }
    assert!(res.da_mae_mean() < 1e-4, "da_MAE_mean = {}", res.da_mae_mean());
    assert!(res.percent_improvement() > 99.9);
    assert!(res.cost_final.total <= res.cost_initial.total);
}

#[test]
fn test_identity_inverse_covariance_matches_isotropic() {
    let twin = TwinExperiment::linear(100, 5, 4, 2024).unwrap();
    let data = twin.linear_data().unwrap();
    let var = 0.5;
    let iso = run(&exact_linear_config().with_obs_variance(var), &data).unwrap();
    let m = data.g.n_obs();
    let full = run(
        &exact_linear_config().with_inverse_covariance(Array2::eye(m) / var),
        &data,
    )
    .unwrap();
    for (a, b) in iso.w_opt.iter().zip(full.w_opt.iter()) {
        assert!((a - b).abs() < 1e-8, "{a} vs {b}");
    }
    assert!((iso.da_mae_mean() - full.da_mae_mean()).abs() < 1e-8);
}

#[test]
fn test_nonlinear_twin_improves_background() {
    let twin = TwinExperiment::nonlinear(60, 4, 2, 99).unwrap();
    let data = twin.nonlinear_data(true).unwrap();
    let config = AssimilationConfig {
        compression: CompressionMethod::Nonlinear,
        alpha: 1e-6,
        tol: 1e-12,
        ..Default::default()
    };
    let res = run(&config, &data).unwrap();
    assert_eq!(res.n_modes, 4);
    assert!(res.improved());
    assert!(
        res.da_mae_mean() < 0.1 * res.ref_mae_mean(),
        "da {} vs ref {}",
        res.da_mae_mean(),
        res.ref_mae_mean()
    );
}

#[test]
fn test_numerical_fallback_agrees_with_explicit() {
    let twin = TwinExperiment::nonlinear(40, 3, 2, 5).unwrap();
    let config = AssimilationConfig {
        compression: CompressionMethod::Nonlinear,
        alpha: 1e-4,
        tol: 1e-10,
        ..Default::default()
    };
    let explicit = run(&config, &twin.nonlinear_data(true).unwrap()).unwrap();
    let fallback = run(&config, &twin.nonlinear_data(false).unwrap()).unwrap();
    assert!(fallback
        .warnings
        .iter()
        .any(|w| matches!(w, AssimilationWarning::SlowJacobian { .. })));
    assert!(!explicit
        .warnings
        .iter()
        .any(|w| matches!(w, AssimilationWarning::SlowJacobian { .. })));
    assert!((explicit.da_mae_mean() - fallback.da_mae_mean()).abs() < 1e-4);
}

#[test]
fn test_explicit_mode_without_jacobian_fails_at_init() {
    let twin = TwinExperiment::nonlinear(20, 2, 2, 6).unwrap();
    let data = twin.nonlinear_data(false).unwrap();
    let config = AssimilationConfig {
        compression: CompressionMethod::Nonlinear,
        jacobian: JacobianMode::Explicit,
        ..Default::default()
    };
    let err = run(&config, &data).unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Init));
    assert!(matches!(err.root(), VardaError::Unimplemented(_)));
}

#[test]
fn test_invalid_noise_rejected_before_optimization() {
    let twin = TwinExperiment::linear(30, 3, 3, 8).unwrap();
    let data = twin.linear_data().unwrap();
    let config = AssimilationConfig {
        obs_variance: Some(1.0),
        obs_inverse_covariance: Some(Array2::eye(data.g.n_obs())),
        ..Default::default()
    };
    let err = AssimilationRunner::new(&config, &data).err().unwrap();
    assert!(err.is_configuration());
    assert_eq!(err.stage(), Some(Stage::Init));
}

#[test]
fn test_unknown_method_from_json_rejected() {
    let err = AssimilationConfig::from_json(r#"{"compression": "WAVELET"}"#).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_explicit_zero_modes_is_invalid_argument() {
    let twin = TwinExperiment::linear(30, 3, 3, 8).unwrap();
    let data = twin.linear_data().unwrap();
    let config = AssimilationConfig {
        n_modes: Some(0),
        ..Default::default()
    };
    let err = run(&config, &data).unwrap_err();
    assert!(matches!(err.root(), VardaError::InvalidArgument(_)));
}

#[test]
fn test_runs_are_idempotent() {
    let twin = TwinExperiment::linear(50, 4, 3, 31).unwrap();
    let data = twin.linear_data().unwrap();
    let config = AssimilationConfig {
        n_modes: Some(3),
        ..Default::default()
    };
    let a = run(&config, &data).unwrap();
    let b = run(&config, &data).unwrap();
    assert_eq!(a.w_opt, b.w_opt);
    assert_eq!(a.u_da, b.u_da);
    assert_eq!(a.stats.da_mae, b.stats.da_mae);
}

#[test]
fn test_adaptive_rank_on_decaying_spectrum() {
    // Columns scaled 100, 50, 1e-3: only the first two exceed √s₁.
    let mut rng = SimpleRng::new(12);
    let mut v = random_matrix(60, 3, &mut rng);
    for (j, scale) in [100.0, 50.0, 1e-3].into_iter().enumerate() {
        let col = v.column(j).to_owned();
        let norm = col.dot(&col).sqrt();
        v.column_mut(j).assign(&(col * (scale / norm)));
    }
    let n = v.nrows();
    let data = AssimilationData::linear(v, Array1::zeros(n), Array1::ones(n), ObservationOperator::identity(n))
        .observe_truth()
        .unwrap();
    let res = run(&AssimilationConfig::default(), &data).unwrap();
    assert_eq!(res.n_modes, 2);
}

#[test]
fn test_zero_initial_guess_matches_projection_for_convex_cost() {
    let twin = TwinExperiment::linear(80, 4, 2, 41).unwrap();
    let shift = Array1::from(vec![0.3, -0.2, 0.1, 0.4]);
    let mut data = twin.linear_data().unwrap().with_baseline(Array1::zeros(80));
    data.u_0 = twin.basis.dot(&shift);
    let data = data.observe_truth().unwrap();
    let config = AssimilationConfig {
        n_modes: Some(4),
        ..exact_linear_config()
    };
    let projection = run(&config, &data).unwrap();
    let zero = run(
        &AssimilationConfig {
            initial_guess: InitialGuess::Zero,
            ..config.clone()
        },
        &data,
    )
    .unwrap();
    let expected = &twin.w_true - &shift;
    for ((a, b), c) in projection.w_opt.iter().zip(zero.w_opt.iter()).zip(expected.iter()) {
        assert!((a - b).abs() < 1e-6);
        assert!((a - c).abs() < 1e-3);
    }
}

#[test]
fn test_normalized_twin_reports_physical_errors() {
    let twin = TwinExperiment::linear(40, 3, 2, 17).unwrap();
    let mean = Array1::from_elem(40, 280.0);
    let std = Array1::from_elem(40, 5.0);
    let params = NormalizationParams::new(mean, std).unwrap();
    let data = twin.linear_data().unwrap().with_normalization(params);
    let config = AssimilationConfig {
        n_modes: Some(3),
        alpha: 1e-10,
        tol: 1e-12,
        ..Default::default()
    };
    let res = run(&config, &data).unwrap();
    assert!(res.u_da.iter().all(|x| (x - 280.0).abs() < 50.0));
    let ref_normalized = twin.u_c.mapv(f64::abs).mean().unwrap();
    assert!((res.ref_mae_mean() - 5.0 * ref_normalized).abs() < 1e-9);
}

#[test]
fn test_model_without_device_fails_with_resource_unavailable() {
    struct Offline(TanhDecoder);

    impl ReductionModel for Offline {
        fn latent_dim(&self) -> usize {
            self.0.latent_dim()
        }
        fn full_dim(&self) -> usize {
            self.0.full_dim()
        }
        fn encode(&self, u: &Array1<f64>) -> varda_core::VardaResult<Array1<f64>> {
            self.0.encode(u)
        }
        fn decode(&self, w: &Array1<f64>) -> varda_core::VardaResult<Array1<f64>> {
            self.0.decode(w)
        }
        fn prepare(&self) -> varda_core::VardaResult<()> {
            Err(VardaError::ResourceUnavailable("no accelerator attached".to_string()))
        }
    }

    let mut rng = SimpleRng::new(3);
    let model: Arc<dyn ReductionModel> = Arc::new(Offline(TanhDecoder::new(random_matrix(10, 2, &mut rng)).unwrap()));
    let data = AssimilationData::nonlinear(model, Array1::zeros(10), Array1::ones(10), ObservationOperator::identity(10))
        .observe_truth()
        .unwrap();
    let config = AssimilationConfig {
        compression: CompressionMethod::Nonlinear,
        ..Default::default()
    };
    let err = run(&config, &data).unwrap_err();
    assert!(matches!(err.root(), VardaError::ResourceUnavailable(_)));
    assert_eq!(err.stage(), Some(Stage::Init));
}
