//! The full fitting pipeline.
//!
//! ```text
//! GridSearch? -> primary optimizer -> [(smooth | perturb | none) -> optimizer]*
//!             -> sampler? -> residuals -> error measures
//! ```
//!
//! Every stage takes and returns an `instances x parameters` matrix. The
//! result always carries the residual error measures, whichever optional
//! stages ran.

use crate::config::{MetaOptimizerConfig, RoundAdjustment};
use crate::grid_search::GridSearch;
use crate::model::Model;
use crate::nmsimplex::NMSimplex;
use crate::optimizer::{OptimizationResult, Optimizer};
use crate::perturbation::Perturbation;
use crate::residuals::{ErrorMeasures, ResidualCalculator};
use crate::sampling::MetropolisHastings;
use crate::smoothing::{MedianSmoother, Smoother};
use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array2, Array3};
use parafit_engine::Engine;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of [`MetaOptimizer::minimize`].
#[derive(Debug, Clone)]
pub struct FitResult {
    pub parameters: Array2<f64>,
    /// Status codes of the last optimizer run.
    pub status: Array1<u32>,
    /// Per-instance maps: one per parameter name, then `Errors.*` and,
    /// when sampling ran, `Sampling.*`.
    pub maps: BTreeMap<String, Array1<f64>>,
    /// `instances x samples x parameters`, kept with `full_output`.
    pub samples: Option<Array3<f64>>,
}

pub struct MetaOptimizer {
    config: MetaOptimizerConfig,
    optimizer: Arc<dyn Optimizer>,
    round_optimizers: Vec<Arc<dyn Optimizer>>,
    round_smoothers: Vec<Arc<dyn Smoother>>,
}

impl MetaOptimizer {
    /// Pipeline with Nelder-Mead as the primary optimizer.
    pub fn new(config: MetaOptimizerConfig) -> Result<Self> {
        if let Err(message) = config.validate() {
            bail!("invalid meta-optimizer config: {message}");
        }
        let optimizer = Arc::new(NMSimplex::with_patience(config.patience));
        Ok(Self {
            config,
            optimizer,
            round_optimizers: Vec::new(),
            round_smoothers: Vec::new(),
        })
    }

    pub fn with_optimizer(mut self, optimizer: Arc<dyn Optimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Optimizers for the extra rounds; the last entry serves every later round.
    pub fn with_round_optimizers(mut self, optimizers: Vec<Arc<dyn Optimizer>>) -> Self {
        self.round_optimizers = optimizers;
        self
    }

    /// Smoothers for the extra rounds; the last entry serves every later round.
    pub fn with_round_smoothers(mut self, smoothers: Vec<Arc<dyn Smoother>>) -> Self {
        self.round_smoothers = smoothers;
        self
    }

    pub fn config(&self) -> &MetaOptimizerConfig {
        &self.config
    }

    pub fn minimize(
        &self,
        engine: &Engine,
        model: &dyn Model,
        start: Option<&Array2<f64>>,
    ) -> Result<FitResult> {
        let config = &self.config;
        let precision = config.precision;
        let mut parameters = match start {
            Some(start) => start.clone(),
            None => model.initial_parameters(),
        };
        info!(
            model = model.name(),
            instances = model.instances(),
            optimizer = self.optimizer.name(),
            rounds = config.rounds.len(),
            "fitting model"
        );

        if config.enable_grid_search {
            let grid = GridSearch::new(config.grid_points, config.grid_span);
            parameters = grid
                .minimize(engine, model, &parameters, precision)
                .context("grid search failed")?
                .parameters;
        }

        let OptimizationResult {
            parameters: fitted,
            mut status,
        } = self.optimizer.minimize(engine, model, &parameters, precision)?;
        parameters = fitted;

        let default_smoother = MedianSmoother::new(config.smoothing_radius);
        let perturbation = Perturbation::new(config.perturbation_scale);
        for (round, adjustment) in config.rounds.iter().enumerate() {
            let optimizer = pick(&self.round_optimizers, round).unwrap_or(&self.optimizer);
            let adjusted = match adjustment {
                RoundAdjustment::None => parameters,
                RoundAdjustment::Smooth => {
                    let smoother: &dyn Smoother = match pick(&self.round_smoothers, round) {
                        Some(smoother) => smoother.as_ref(),
                        None => &default_smoother,
                    };
                    smoother.smooth(&parameters)?
                }
                RoundAdjustment::Perturb => perturbation.perturb(
                    engine,
                    &parameters,
                    config.seed.map(|seed| seed.wrapping_add(round as u64)),
                )?,
            };
            debug!(round, adjustment = ?adjustment, optimizer = optimizer.name(), "extra round");
            let result = optimizer
                .minimize(engine, model, &adjusted, precision)
                .with_context(|| format!("optimization round {round} failed"))?;
            parameters = result.parameters;
            status = result.status;
        }

        let mut maps = BTreeMap::new();
        let mut samples = None;
        if config.enable_sampling {
            let seed = config
                .seed
                .map(|seed| seed.wrapping_add(config.rounds.len() as u64));
            let output = MetropolisHastings::new(config.sampler.clone())
                .sample(engine, model, &parameters, precision, seed)
                .context("sampling failed")?;
            maps.extend(output.statistics(&model.parameter_names()));
            parameters = output.mean;
            if config.full_output {
                samples = Some(output.samples);
            }
        }

        for (index, name) in model.parameter_names().into_iter().enumerate() {
            maps.insert(name, parameters.column(index).to_owned());
        }
        let residuals = ResidualCalculator::calculate(engine, model, &parameters, precision)?;
        maps.extend(ErrorMeasures::calculate(&residuals));

        Ok(FitResult {
            parameters,
            status,
            maps,
            samples,
        })
    }
}

/// Entry `round` of an override list, or its last entry past the end.
fn pick<T: ?Sized>(overrides: &[Arc<T>], round: usize) -> Option<&Arc<T>> {
    overrides.get(round).or_else(|| overrides.last())
}
