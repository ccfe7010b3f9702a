//! Backend relative-speed calibration for parafit.

pub mod cache;
pub mod tuner;

pub use cache::*;
pub use tuner::*;
