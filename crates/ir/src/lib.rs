//! Routine descriptors, composition and lowering for parafit.

pub mod builder;
pub mod dialect;
pub mod error;
pub mod lowering;
pub mod record;
pub mod registry;

pub use builder::*;
pub use dialect::*;
pub use error::*;
pub use lowering::*;
pub use record::*;
pub use registry::*;
