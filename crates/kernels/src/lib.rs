//! Host data, marshalling, random streams and library routines for parafit.

pub mod backend;
pub mod kernel_data;
pub mod library;
pub mod marshal;
pub mod random;
pub mod registry;

pub use backend::*;
pub use kernel_data::*;
pub use library::*;
pub use marshal::*;
pub use random::*;
pub use registry::*;
