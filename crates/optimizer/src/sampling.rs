//! Metropolis-Hastings sampling of the posterior around a fit.
//!
//! The log-likelihood is Gaussian, `-0.5 * SSE / sigma^2`, with a flat prior.
//! Each iteration proposes every parameter in turn with a Gaussian random
//! walk step. Every instance draws from its own counter-based stream.

use crate::model::{check_parameters, data_parameters, Model, Objective};
use crate::optimizer::{routine_inputs, take_buffer};
use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Array3, Axis, Ix2};
use parafit_engine::{Engine, EvaluateOptions};
use parafit_ir::{inout, input, output, ElementType, FunctionBuilder, Precision};
use parafit_kernels::{seed_table, KernelData, RandomStream, RNG_STATE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

const DATA_OFFSET: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplerConfig {
    /// Stored samples per instance.
    pub samples: usize,
    /// Iterations discarded before the first stored sample.
    pub burn_in: usize,
    /// Iterations per stored sample.
    pub thinning: usize,
    /// Proposal standard deviation relative to `max(|x|, 1e-3)` at the start point.
    pub proposal_scale: f64,
    /// Noise standard deviation of the likelihood.
    pub noise_std: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            samples: 200,
            burn_in: 100,
            thinning: 1,
            proposal_scale: 0.05,
            noise_std: 1.0,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.samples == 0 {
            return Err("sampler needs at least one sample".into());
        }
        if self.thinning == 0 {
            return Err("thinning must be at least 1".into());
        }
        if !(self.proposal_scale.is_finite() && self.proposal_scale > 0.0) {
            return Err("proposal scale must be positive".into());
        }
        if !(self.noise_std.is_finite() && self.noise_std > 0.0) {
            return Err("noise standard deviation must be positive".into());
        }
        Ok(())
    }
}

/// Sample ensemble and per-instance statistics.
#[derive(Debug, Clone)]
pub struct SamplingOutput {
    /// `instances x samples x parameters`.
    pub samples: Array3<f64>,
    pub mean: Array2<f64>,
    pub std: Array2<f64>,
    pub acceptance_rate: Array1<f64>,
}

impl SamplingOutput {
    /// Statistics under `Sampling.<param>.mean`, `Sampling.<param>.std` and
    /// `Sampling.acceptance_rate`.
    pub fn statistics(&self, names: &[String]) -> BTreeMap<String, Array1<f64>> {
        let mut maps = BTreeMap::new();
        for (index, name) in names.iter().enumerate() {
            maps.insert(format!("Sampling.{name}.mean"), self.mean.column(index).to_owned());
            maps.insert(format!("Sampling.{name}.std"), self.std.column(index).to_owned());
        }
        maps.insert(
            "Sampling.acceptance_rate".to_string(),
            self.acceptance_rate.clone(),
        );
        maps
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetropolisHastings {
    config: SamplerConfig,
}

impl MetropolisHastings {
    pub fn new(config: SamplerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn sample(
        &self,
        engine: &Engine,
        model: &dyn Model,
        start: &Array2<f64>,
        precision: Precision,
        seed: Option<u64>,
    ) -> Result<SamplingOutput> {
        if let Err(message) = self.config.validate() {
            bail!(message);
        }
        check_parameters(model, start)?;
        let (instances, count) = start.dim();
        let config = self.config.clone();
        let objective = Objective::new(model, DATA_OFFSET)?;

        let routine = FunctionBuilder::new("metropolis_hastings")
            .param(inout("x", ElementType::Float))
            .param(output("samples", ElementType::Float))
            .param(output("acceptance", ElementType::Float))
            .param(input(RNG_STATE, ElementType::U32))
            .params(data_parameters(model))
            .depends_on(model.residual_function())
            .native(move |record| {
                let mut x = record.floats(0)?.to_vec();
                let mut stream = RandomStream::from_seed_row(record.words(3)?)?;
                let steps: Vec<f64> = x
                    .iter()
                    .map(|v| config.proposal_scale * v.abs().max(1e-3))
                    .collect();
                let inverse_variance = 1.0 / (config.noise_std * config.noise_std);
                let log_likelihood = |sse: f64| -0.5 * sse * inverse_variance;

                let mut current = log_likelihood(objective.sse(record, &x)?);
                let mut chain = Vec::with_capacity(config.samples * x.len());
                let mut accepted = 0usize;
                let mut proposed = 0usize;
                let iterations = config.burn_in + config.samples * config.thinning;
                for iteration in 0..iterations {
                    for j in 0..x.len() {
                        let previous = x[j];
                        x[j] = previous + steps[j] * stream.normal();
                        let candidate = log_likelihood(objective.sse(record, &x)?);
                        let threshold = stream.uniform().ln();
                        proposed += 1;
                        if candidate.is_finite() && threshold < candidate - current {
                            current = candidate;
                            accepted += 1;
                        } else {
                            x[j] = previous;
                        }
                    }
                    let kept = iteration + 1 - config.burn_in.min(iteration + 1);
                    if iteration >= config.burn_in && kept % config.thinning == 0 {
                        chain.extend(x.iter().map(|v| record.round(*v)));
                    }
                }

                let count = x.len().max(1);
                let stored = chain.len() / count;
                let mean: Vec<f64> = (0..x.len())
                    .map(|j| {
                        let sum: f64 = chain.iter().skip(j).step_by(count).sum();
                        record.round(sum / stored.max(1) as f64)
                    })
                    .collect();
                let rate = if proposed == 0 {
                    0.0
                } else {
                    accepted as f64 / proposed as f64
                };

                record.set_floats(0, &mean)?;
                record.set_floats(1, &chain)?;
                record.set_floats(2, &[record.round(rate)])?;
                Ok(None)
            })
            .build()?;

        let mut inputs = routine_inputs(model, start);
        inputs.insert(
            "samples".to_string(),
            KernelData::zeros(&[instances, self.config.samples * count], ElementType::Float).into(),
        );
        inputs.insert(
            "acceptance".to_string(),
            KernelData::zeros(&[instances], ElementType::Float).into(),
        );
        inputs.insert(
            RNG_STATE.to_string(),
            KernelData::read_only(seed_table(instances, seed)).into(),
        );
        engine.evaluate(&routine, &mut inputs, &EvaluateOptions::with_precision(precision))?;

        let mean = take_buffer(&mut inputs, "x")?
            .to_f64()
            .into_dimensionality::<Ix2>()?;
        let samples = take_buffer(&mut inputs, "samples")?
            .to_f64()
            .into_shape((instances, self.config.samples, count))?;
        let acceptance_rate = take_buffer(&mut inputs, "acceptance")?
            .to_f64()
            .into_shape(instances)?;
        let std = samples.std_axis(Axis(1), 0.0);

        info!(
            model = model.name(),
            instances,
            samples = self.config.samples,
            mean_acceptance = acceptance_rate.mean().unwrap_or(0.0),
            "sampling finished"
        );
        Ok(SamplingOutput {
            samples,
            mean,
            std,
            acceptance_rate,
        })
    }
}
