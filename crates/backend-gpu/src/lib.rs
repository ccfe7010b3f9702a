//! wgpu backend for parafit.

pub mod planner;
pub mod runtime;

pub use planner::*;
pub use runtime::*;
