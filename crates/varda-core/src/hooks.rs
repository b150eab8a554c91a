// ─────────────────────────────────────────────────────────────────────
// VarDA-ROM — Persistence Hooks and Scoped Working Directories
// ─────────────────────────────────────────────────────────────────────
//! Optional side effects around a run. The core never writes to disk on
//! its own; callers that want artifacts attach a `PersistenceHook`, and
//! temporary output lives in a `ScopedWorkdir` that is removed on drop.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use varda_types::{AssimilationResults, VardaError, VardaResult};

use crate::svd::TruncatedSvd;

/// File name of the factor dump written by `JsonResultsWriter`.
pub const FACTORS_FILE: &str = "factors.json";

/// Serialized rank-k factors V_trunc = U·diag(s)·W.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorDump {
    /// n×k.
    pub u: Array2<f64>,
    pub s: Array1<f64>,
    /// k×M.
    pub w: Array2<f64>,
}

impl From<&TruncatedSvd> for FactorDump {
    fn from(factors: &TruncatedSvd) -> Self {
        Self {
            u: factors.u.clone(),
            s: factors.s.clone(),
            w: factors.w.clone(),
        }
    }
}

/// Callbacks fired by `AssimilationRunner::run_with_hooks`.
pub trait PersistenceHook {
    /// After a linear reduction is built.
    fn on_factorization(&mut self, _factors: &TruncatedSvd) -> VardaResult<()> {
        Ok(())
    }

    /// After the run reaches EVALUATED.
    fn on_results(&mut self, _results: &AssimilationResults) -> VardaResult<()> {
        Ok(())
    }
}

/// Writes the results as pretty JSON into a directory.
#[derive(Debug, Clone)]
pub struct JsonResultsWriter {
    dir: PathBuf,
    file_name: String,
}

impl JsonResultsWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            file_name: "results.json".to_string(),
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }
}

impl PersistenceHook for JsonResultsWriter {
    fn on_factorization(&mut self, factors: &TruncatedSvd) -> VardaResult<()> {
        let s: Vec<String> = factors.s.iter().map(|x| format!("{x:.6e}")).collect();
        let path = self.dir.join("singular_values.txt");
        fs::write(&path, s.join("\n")).map_err(|e| io_error(&path, e))?;

        let json = serde_json::to_string(&FactorDump::from(factors))
            .map_err(|e| VardaError::InvalidState(format!("factor encode error: {e}")))?;
        let path = self.dir.join(FACTORS_FILE);
        fs::write(&path, json).map_err(|e| io_error(&path, e))?;
        log::debug!("U, s, W (rank {}) written to {}", factors.rank(), path.display());
        Ok(())
    }

    fn on_results(&mut self, results: &AssimilationResults) -> VardaResult<()> {
        let json = serde_json::to_string_pretty(results)
            .map_err(|e| VardaError::InvalidState(format!("results encode error: {e}")))?;
        let path = self.path();
        fs::write(&path, json).map_err(|e| io_error(&path, e))?;
        log::info!("Results written to {}", path.display());
        Ok(())
    }
}

fn io_error(path: &Path, e: std::io::Error) -> VardaError {
    VardaError::ResourceUnavailable(format!("{}: {e}", path.display()))
}

/// Directory created on construction and removed recursively on drop,
/// on both success and error paths, unless `keep` is called.
#[derive(Debug)]
pub struct ScopedWorkdir {
    path: PathBuf,
    keep: bool,
}

impl ScopedWorkdir {
    pub fn create(path: impl Into<PathBuf>) -> VardaResult<Self> {
        let path = path.into();
        fs::create_dir_all(&path).map_err(|e| io_error(&path, e))?;
        log::debug!("workdir {} created", path.display());
        Ok(Self { path, keep: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Disarm the cleanup and hand back the path.
    pub fn keep(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for ScopedWorkdir {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => log::debug!("workdir {} removed", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed to remove workdir {}: {e}", self.path.display()),
        }
    }
}
