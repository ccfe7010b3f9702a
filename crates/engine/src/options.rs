//! Engine configuration.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Which kinds of backend to enumerate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendSelection {
    #[default]
    All,
    Cpu,
    Gpu,
}

impl BackendSelection {
    pub fn includes_cpu(&self) -> bool {
        matches!(self, BackendSelection::All | BackendSelection::Cpu)
    }

    pub fn includes_gpu(&self) -> bool {
        matches!(self, BackendSelection::All | BackendSelection::Gpu)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EngineOptions {
    pub backends: BackendSelection,
    /// Upper bound on instances per batch; `None` runs each backend's share as one batch.
    pub single_batch_length: Option<usize>,
    /// Relative weight per enumerated backend, in enumeration order.
    pub backend_weights: Option<Vec<f64>>,
    pub cpu_threads: Option<usize>,
    pub calibration_cache: Option<PathBuf>,
}

impl EngineOptions {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let blob = fs::read_to_string(path)
            .with_context(|| format!("failed to read engine options {}", path.display()))?;
        let options: EngineOptions = serde_json::from_str(&blob)
            .with_context(|| format!("invalid engine options {}", path.display()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.single_batch_length == Some(0) {
            bail!("single_batch_length must be at least 1");
        }
        if self.cpu_threads == Some(0) {
            bail!("cpu_threads must be at least 1");
        }
        if let Some(weights) = &self.backend_weights {
            if let Some(weight) = weights.iter().find(|w| !w.is_finite() || **w <= 0.0) {
                bail!("backend weights must be positive and finite, got {weight}");
            }
        }
        Ok(())
    }

    pub fn with_batch_length(mut self, length: usize) -> Self {
        self.single_batch_length = Some(length);
        self
    }
}
