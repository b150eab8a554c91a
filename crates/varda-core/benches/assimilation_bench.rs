// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Assimilation Benchmarks
// ─────────────────────────────────────────────────────────────────────
//! Criterion benchmarks for the hot paths:
//!   - Jacobi SVD and truncation
//!   - Cost + gradient (linear and nonlinear, explicit vs numerical Jacobian)
//!   - Full linear run

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use varda_core::nonlinear::{NonlinearReduction, ReductionModel};
use varda_core::synthetic::{random_matrix, random_vector, SimpleRng, TanhDecoder, TwinExperiment};
use varda_core::{
    run, AssimilationConfig, CostState, JacobianMode, LinearReduction, Objective, ObservationOperator, Svd,
    TruncationPolicy,
};
use varda_types::ObservationNoise;

const N: usize = 500;
const M: usize = 20;

// ── Helpers ───────────────────────────────────────────────────────────

fn snapshots() -> ndarray::Array2<f64> {
    random_matrix(N, M, &mut SimpleRng::new(1))
}

fn linear_cost() -> CostState {
    let red = LinearReduction::from_snapshots(&snapshots(), TruncationPolicy::Explicit(10), false)
        .expect("bench snapshots factorize");
    let g = ObservationOperator::every(5, N).expect("valid stride");
    let d = random_vector(g.n_obs(), &mut SimpleRng::new(2));
    CostState::new(d, g, ObservationNoise::IsotropicVariance(1.0), 1.0, Arc::new(red)).expect("valid cost")
}

fn nonlinear_cost(mode: JacobianMode) -> CostState {
    let model: Arc<dyn ReductionModel> =
        Arc::new(TanhDecoder::new(random_matrix(N, 8, &mut SimpleRng::new(3))).expect("decoder"));
    let red = NonlinearReduction::new(model, mode, 1e-5).expect("reduction");
    let g = ObservationOperator::every(5, N).expect("valid stride");
    let d = random_vector(g.n_obs(), &mut SimpleRng::new(4));
    CostState::new(d, g, ObservationNoise::IsotropicVariance(1.0), 1.0, Arc::new(red)).expect("valid cost")
}

// ── SVD ───────────────────────────────────────────────────────────────

fn bench_svd(c: &mut Criterion) {
    let v = snapshots();
    c.bench_function("jacobi_svd_500x20", |b| b.iter(|| Svd::compute(black_box(&v))));
}

fn bench_truncate_adaptive(c: &mut Criterion) {
    let svd = Svd::compute(&snapshots()).expect("factorize");
    c.bench_function("truncate_adaptive_500x20", |b| {
        b.iter(|| svd.truncate(black_box(TruncationPolicy::Adaptive)))
    });
}

// ── Cost / gradient ──────────────────────────────────────────────────

fn bench_linear_value_and_gradient(c: &mut Criterion) {
    let cost = linear_cost();
    let w = random_vector(M, &mut SimpleRng::new(5));
    c.bench_function("linear_value_and_gradient", |b| {
        b.iter(|| cost.value_and_gradient(black_box(&w)))
    });
}

fn bench_nonlinear_explicit(c: &mut Criterion) {
    let cost = nonlinear_cost(JacobianMode::Explicit);
    let w = random_vector(8, &mut SimpleRng::new(6));
    c.bench_function("nonlinear_gradient_explicit", |b| {
        b.iter(|| cost.value_and_gradient(black_box(&w)))
    });
}

fn bench_nonlinear_numerical(c: &mut Criterion) {
    let cost = nonlinear_cost(JacobianMode::NumericalFallback);
    let w = random_vector(8, &mut SimpleRng::new(6));
    c.bench_function("nonlinear_gradient_numerical", |b| {
        b.iter(|| cost.value_and_gradient(black_box(&w)))
    });
}

// ── Full run ─────────────────────────────────────────────────────────

fn bench_full_linear_run(c: &mut Criterion) {
    let twin = TwinExperiment::linear(N, 10, 5, 7).expect("twin");
    let data = twin.linear_data().expect("data");
    let config = AssimilationConfig {
        n_modes: Some(10),
        ..Default::default()
    };
    c.bench_function("full_linear_run_500", |b| b.iter(|| run(black_box(&config), &data)));
}

criterion_group!(svd, bench_svd, bench_truncate_adaptive);

criterion_group!(
    cost,
    bench_linear_value_and_gradient,
    bench_nonlinear_explicit,
    bench_nonlinear_numerical,
);

criterion_group!(runs, bench_full_linear_run);

criterion_main!(svd, cost, runs);
