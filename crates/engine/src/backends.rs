//! Backend enumeration.

use crate::options::EngineOptions;
use anyhow::Result;
use parafit_backend_cpu::{CpuBackend, CpuBackendOptions};
use parafit_ir::EngineError;
use parafit_kernels::DynBackend;
use std::sync::Arc;
use tracing::{info, warn};

/// Initialises every backend the options select. Fails with
/// `EngineError::BackendUnavailable` if none comes up.
pub fn enumerate_backends(options: &EngineOptions) -> Result<Vec<DynBackend>> {
    let mut backends: Vec<DynBackend> = Vec::new();

    if options.backends.includes_cpu() {
        match CpuBackend::new(CpuBackendOptions {
            threads: options.cpu_threads,
        }) {
            Ok(backend) => backends.push(Arc::new(backend)),
            Err(err) => warn!(error = %err, "CPU backend failed to initialise"),
        }
    }

    if options.backends.includes_gpu() {
        append_gpu_backends(&mut backends);
    }

    if backends.is_empty() {
        return Err(EngineError::unavailable(format!(
            "no backend initialised for selection {:?}",
            options.backends
        ))
        .into());
    }

    info!(
        backends = ?backends.iter().map(|b| b.name().to_string()).collect::<Vec<_>>(),
        "enumerated compute backends"
    );
    Ok(backends)
}

#[cfg(feature = "gpu")]
fn append_gpu_backends(backends: &mut Vec<DynBackend>) {
    let gpus = parafit_backend_gpu::enumerate_gpu_backends();
    if gpus.is_empty() {
        warn!("no GPU adapter available");
    }
    for gpu in gpus {
        backends.push(Arc::new(gpu));
    }
}

#[cfg(not(feature = "gpu"))]
fn append_gpu_backends(_backends: &mut Vec<DynBackend>) {
    warn!("GPU backends requested but support is not compiled in");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BackendSelection;

    #[test]
    fn cpu_selection_yields_one_cpu_backend() {
        let options = EngineOptions {
            backends: BackendSelection::Cpu,
            cpu_threads: Some(2),
            ..EngineOptions::default()
        };
        let backends = enumerate_backends(&options).unwrap();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].name(), "cpu");
        assert_eq!(backends[0].info().parallelism, 2);
    }
}
