// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Types
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Configuration, error taxonomy, run stages and result records for
//! reduced-order variational data assimilation.

pub mod config;
pub mod error;
pub mod results;

pub use config::{AssimilationConfig, CompressionMethod, InitialGuess, JacobianMode, ObservationNoise};
pub use error::{Stage, VardaError, VardaResult};
pub use results::{AssimilationResults, AssimilationWarning, CostBreakdown, ErrorStatistics};
