//! parafit: data-parallel evaluation of per-instance routines across compute
//! backends, with model fitting on top.
//!
//! ```no_run
//! use parafit::{Engine, EngineOptions, SampleRequest};
//!
//! # fn main() -> anyhow::Result<()> {
//! let engine = Engine::new(EngineOptions::default())?;
//! let draws = engine.rand(SampleRequest::new(5, 100).seed(42), 0.0, 1.0)?;
//! assert_eq!(draws.shape(), &[5, 100]);
//! # Ok(())
//! # }
//! ```

pub use parafit_engine as engine;
pub use parafit_ir as ir;
pub use parafit_kernels as kernels;
pub use parafit_optimizer as optimizer;

pub use parafit_engine::{
    CancellationToken, Engine, EngineOptions, EvaluateOptions, Evaluation, SampleRequest,
};
pub use parafit_ir::{
    engine_error, inout, input, output, scalar, CompositionError, ElementType, EngineError,
    FunctionBuilder, FunctionDescriptor, Precision,
};
pub use parafit_kernels::{HostBuffer, Input, KernelData, KernelInputs};
pub use parafit_optimizer::{MetaOptimizer, MetaOptimizerConfig, Model};
