//! Compute backend abstraction shared by the CPU and GPU runtimes.

use crate::kernel_data::FlatBuffer;
use crate::marshal::BoundCall;
use anyhow::Result;
use parafit_ir::Program;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendInfo {
    pub name: String,
    pub kind: BackendKind,
    pub device: String,
    /// Instances the backend can process concurrently.
    pub parallelism: usize,
}

/// Writable rows produced by one batch, ready to merge into the bound buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutput {
    pub start: usize,
    pub end: usize,
    /// Slot position in the record layout paired with its rows for `[start, end)`.
    pub columns: Vec<(usize, FlatBuffer)>,
    pub results: Option<FlatBuffer>,
}

impl BatchOutput {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// An execution context able to run a lowered program over a batch of instances.
///
/// Backends hold no per-call state: everything a batch needs is in the program
/// and the bound call, so a failed call can be retried as is.
pub trait ComputeBackend: Send + Sync {
    fn info(&self) -> &BackendInfo;

    fn name(&self) -> &str {
        &self.info().name
    }

    /// Whether this backend can execute the program at its bound precision.
    fn supports(&self, program: &Program) -> bool;

    fn run_batch(
        &self,
        program: &Program,
        call: &BoundCall,
        range: Range<usize>,
    ) -> Result<BatchOutput>;
}

pub type DynBackend = Arc<dyn ComputeBackend>;
