//! Random restarts around a fitted parameter map.

use anyhow::{bail, Result};
use ndarray::{Array2, Ix2, Zip};
use parafit_engine::{Engine, SampleRequest};
use parafit_ir::ElementType;

/// Moves every parameter by `scale * |x| * z` with `z ~ N(0, 1)`, or by
/// `scale * z` where the parameter is zero. Draws come from the engine's
/// counter-based streams, so a seed reproduces the perturbation exactly.
#[derive(Debug, Clone)]
pub struct Perturbation {
    scale: f64,
}

impl Default for Perturbation {
    fn default() -> Self {
        Self { scale: 0.05 }
    }
}

impl Perturbation {
    pub fn new(scale: f64) -> Self {
        Self { scale }
    }

    pub fn perturb(
        &self,
        engine: &Engine,
        parameters: &Array2<f64>,
        seed: Option<u64>,
    ) -> Result<Array2<f64>> {
        if !(self.scale.is_finite() && self.scale >= 0.0) {
            bail!("perturbation scale must be finite and non-negative");
        }
        let (instances, count) = parameters.dim();
        if instances == 0 || count == 0 {
            return Ok(parameters.clone());
        }
        let mut request = SampleRequest::new(instances, count).element(ElementType::F64);
        if let Some(seed) = seed {
            request = request.seed(seed);
        }
        let noise = engine
            .randn(request, 0.0, 1.0)?
            .to_f64()
            .into_dimensionality::<Ix2>()?;

        let scale = self.scale;
        let mut perturbed = parameters.clone();
        Zip::from(&mut perturbed).and(&noise).for_each(|x, z| {
            let magnitude = if *x == 0.0 { 1.0 } else { x.abs() };
            *x += scale * magnitude * z;
        });
        Ok(perturbed)
    }
}
