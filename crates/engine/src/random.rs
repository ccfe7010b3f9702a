//! Reproducible random sample matrices.

use crate::session::{Engine, EvaluateOptions};
use anyhow::{anyhow, bail, Result};
use parafit_ir::{DataType, ElementType, Precision};
use parafit_kernels::{seed_table, HostBuffer, Input, KernelData, KernelInputs, RNG_STATE};

/// Requested distribution and output element type of a sample matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRequest {
    pub instances: usize,
    pub samples: usize,
    pub element: ElementType,
    pub seed: Option<u64>,
}

impl SampleRequest {
    pub fn new(instances: usize, samples: usize) -> Self {
        Self {
            instances,
            samples,
            element: ElementType::F64,
            seed: None,
        }
    }

    pub fn element(mut self, element: ElementType) -> Self {
        self.element = element;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn precision(&self) -> Result<Precision> {
        match self.element {
            ElementType::F32 => Ok(Precision::Single),
            ElementType::F64 | ElementType::Float => Ok(Precision::Double),
            ElementType::U32 => bail!("random samples need a floating point element type"),
        }
    }
}

impl Engine {
    /// `instances x samples` draws from `U(min, max)`.
    ///
    /// Bounds are scalars or one value per instance.
    pub fn rand(
        &self,
        request: SampleRequest,
        min: impl Into<Input>,
        max: impl Into<Input>,
    ) -> Result<HostBuffer> {
        self.sample("uniform_sampler", ("min_val", min.into()), ("max_val", max.into()), request)
    }

    /// `instances x samples` draws from `N(mean, std^2)`, with per-instance
    /// or shared moments.
    pub fn randn(
        &self,
        request: SampleRequest,
        mean: impl Into<Input>,
        std: impl Into<Input>,
    ) -> Result<HostBuffer> {
        self.sample("gaussian_sampler", ("mean", mean.into()), ("std", std.into()), request)
    }

    fn sample(
        &self,
        routine: &str,
        (first, a): (&str, Input),
        (second, b): (&str, Input),
        request: SampleRequest,
    ) -> Result<HostBuffer> {
        let precision = request.precision()?;
        let sampler = self.routine(routine, request.samples)?;

        let mut inputs: KernelInputs = [
            (first.to_string(), a),
            (second.to_string(), b),
            (
                "samples".to_string(),
                KernelData::zeros(&[request.instances, request.samples], ElementType::Float).into(),
            ),
            (
                RNG_STATE.to_string(),
                KernelData::read_only(seed_table(request.instances, request.seed)).into(),
            ),
        ]
        .into_iter()
        .collect();

        self.evaluate(
            &sampler,
            &mut inputs,
            &EvaluateOptions::with_precision(precision),
        )?;

        let samples = inputs
            .remove("samples")
            .and_then(|input| match input {
                Input::Data(data) => data.into_buffer(),
                _ => None,
            })
            .ok_or_else(|| anyhow!("{routine} produced no samples"))?;
        Ok(match request.element {
            ElementType::F32 => samples.convert(DataType::F32),
            _ => samples.convert(DataType::F64),
        })
    }
}
