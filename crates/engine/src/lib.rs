//! parafit engine facade: backends, scheduling and evaluation.

pub mod backends;
#[cfg(feature = "cli")]
pub mod cli;
pub mod options;
pub mod random;
pub mod scheduler;
pub mod session;

pub use backends::*;
#[cfg(feature = "cli")]
pub use cli::*;
pub use options::*;
pub use random::*;
pub use scheduler::*;
pub use session::*;
