//! Model fitting on top of the dispatch engine.
//!
//! Optimizers, the sampler and the residual calculator are ordinary routines:
//! each depends on the model's residual routine and runs once per instance
//! through [`parafit_engine::Engine::evaluate`].
//!
//! # Key Components
//!
//! - [`model::Model`]: the collaborator a fit runs against
//! - [`optimizer::Optimizer`]: Nelder-Mead, Levenberg-Marquardt and grid search
//! - [`smoothing::Smoother`] and [`perturbation::Perturbation`]: adjustments between rounds
//! - [`sampling::MetropolisHastings`]: posterior sampling around a fit
//! - [`residuals::ErrorMeasures`]: per-instance error summaries
//! - [`meta::MetaOptimizer`]: the whole pipeline, driven by [`config::MetaOptimizerConfig`]

pub mod config;
pub mod grid_search;
pub mod levenberg_marquardt;
mod linalg;
pub mod meta;
pub mod model;
pub mod nmsimplex;
pub mod optimizer;
pub mod perturbation;
pub mod residuals;
pub mod sampling;
pub mod smoothing;

pub use config::{MetaOptimizerConfig, RoundAdjustment};
pub use grid_search::GridSearch;
pub use levenberg_marquardt::LevenbergMarquardt;
pub use meta::{FitResult, MetaOptimizer};
pub use model::{Model, Objective, PolynomialModel};
pub use nmsimplex::NMSimplex;
pub use optimizer::{OptimizationResult, Optimizer, Status};
pub use perturbation::Perturbation;
pub use residuals::{ErrorMeasures, ResidualCalculator};
pub use sampling::{MetropolisHastings, SamplerConfig, SamplingOutput};
pub use smoothing::{MedianSmoother, Smoother};
