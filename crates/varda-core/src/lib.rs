// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Assimilation Engine
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Reduced-order variational data assimilation.
//!
//! The analysis increment is sought in a low-dimensional latent space:
//! u_DA = u₀ + reduce_to_full(w_opt), with w_opt minimising
//! J(w) = ½·α·w·w + J_o(w).
//!
//! Architecture:
//!   - Svd: one-sided Jacobi SVD, √s₁ adaptive truncation
//!   - ReductionOperator: truncated SVD (linear) or encoder/decoder (nonlinear)
//!   - ObservationOperator: dense G or point selection
//!   - CostState: J, ∇J through the `ReducedBasis` interface
//!   - Lbfgs: limited-memory BFGS driver
//!   - AssimilationRunner: INIT → REDUCE_BUILT → OPTIMIZED → RECONSTRUCTED → EVALUATED
//!   - run_batch: shared reduction over many control states

pub mod batch;
pub mod cost;
pub mod hooks;
pub mod nonlinear;
pub mod normalization;
pub mod observation;
pub mod optimizer;
pub mod reduction;
pub mod runner;
pub mod stats;
pub mod svd;
pub mod synthetic;

pub use batch::{run_batch, BatchRecord, BatchReport};
pub use cost::{CostState, Objective};
pub use hooks::{FactorDump, JsonResultsWriter, PersistenceHook, ScopedWorkdir, FACTORS_FILE};
pub use nonlinear::{JacobianSource, NonlinearReduction, ReductionModel};
pub use normalization::NormalizationParams;
pub use observation::ObservationOperator;
pub use optimizer::{Lbfgs, OptimizeResult, TraceRecord};
pub use reduction::{LinearReduction, ReducedBasis, ReductionOperator};
pub use runner::{build_reduction, run, AssimilationData, AssimilationRunner};
pub use svd::{Svd, TruncatedSvd, TruncationPolicy};

pub use varda_types::{
    AssimilationConfig, AssimilationResults, AssimilationWarning, CompressionMethod, InitialGuess, JacobianMode,
    Stage, VardaError, VardaResult,
};
