//! CPU backend for parafit.

pub mod runtime;

pub use runtime::*;
