//! Backend calibration: time a probe batch on every backend and derive
//! relative weights proportional to measured throughput.

use crate::cache::{BackendProfile, CalibrationCache};
use anyhow::{bail, Result};
use parafit_ir::Program;
use parafit_kernels::{BoundCall, DynBackend};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct Calibrator {
    cache: CalibrationCache,
    runs: usize,
    warmup_runs: usize,
}

impl Calibrator {
    pub fn new(cache: CalibrationCache) -> Self {
        Self {
            cache,
            runs: 3,
            warmup_runs: 1,
        }
    }

    pub fn with_runs(mut self, warmup_runs: usize, runs: usize) -> Self {
        self.warmup_runs = warmup_runs;
        self.runs = runs.max(1);
        self
    }

    pub fn cache(&self) -> &CalibrationCache {
        &self.cache
    }

    pub fn into_cache(self) -> CalibrationCache {
        self.cache
    }

    /// Profiles `backend` on the whole bound range, reusing a cached profile if present.
    pub fn profile(
        &mut self,
        backend: &DynBackend,
        program: &Program,
        call: &BoundCall,
    ) -> Result<BackendProfile> {
        if let Some(profile) = self.cache.get(backend.name(), program.name()) {
            debug!(
                backend = backend.name(),
                routine = program.name(),
                "using cached calibration"
            );
            return Ok(profile.clone());
        }
        if !backend.supports(program) {
            bail!(
                "backend `{}` cannot run routine `{}`",
                backend.name(),
                program.name()
            );
        }

        let range = 0..call.instances();
        for _ in 0..self.warmup_runs {
            backend.run_batch(program, call, range.clone())?;
        }

        let mut total = Duration::default();
        for _ in 0..self.runs {
            let start = Instant::now();
            backend.run_batch(program, call, range.clone())?;
            total += start.elapsed();
        }

        let avg_ms = total.as_secs_f64() * 1000.0 / self.runs as f64;
        let profile = BackendProfile::new(backend.name(), program.name(), call.instances(), avg_ms);
        info!(
            backend = backend.name(),
            routine = program.name(),
            time_ms = avg_ms,
            "calibrated backend"
        );
        self.cache.insert(profile.clone());
        Ok(profile)
    }

    /// Relative weights, one per backend, summing to the number of backends.
    pub fn calibrate(
        &mut self,
        backends: &[DynBackend],
        program: &Program,
        call: &BoundCall,
    ) -> Result<Vec<f64>> {
        let mut throughputs = Vec::with_capacity(backends.len());
        for backend in backends {
            throughputs.push(self.profile(backend, program, call)?.throughput());
        }
        Ok(weights_from_throughput(&throughputs))
    }
}

/// Normalises throughputs so the weights average to one. Degenerate
/// measurements fall back to equal weights.
pub fn weights_from_throughput(throughputs: &[f64]) -> Vec<f64> {
    let finite = throughputs.iter().all(|t| t.is_finite() && *t > 0.0);
    let total: f64 = throughputs.iter().sum();
    if !finite || total <= 0.0 {
        return vec![1.0; throughputs.len()];
    }
    let scale = throughputs.len() as f64 / total;
    throughputs.iter().map(|t| t * scale).collect()
}
