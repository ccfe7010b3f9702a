//! Typed failure kinds carried inside `anyhow::Error`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompositionError {
    /// Two distinct routine bodies export the same name.
    #[error("routine name `{name}` is defined by two different bodies")]
    NameCollision { name: String },
    /// The dependency graph loops back onto a routine still being composed.
    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("composition failed: {0}")]
    Composition(#[from] CompositionError),
    #[error("shape error: {detail}")]
    Shape { detail: String },
    #[error("no compute backend available: {detail}")]
    BackendUnavailable { detail: String },
    #[error("batch [{start}, {end}) failed on backend `{backend}`: {source}")]
    Dispatch {
        backend: String,
        start: usize,
        end: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("evaluation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn shape<D: Into<String>>(detail: D) -> Self {
        EngineError::Shape {
            detail: detail.into(),
        }
    }

    pub fn unavailable<D: Into<String>>(detail: D) -> Self {
        EngineError::BackendUnavailable {
            detail: detail.into(),
        }
    }
}

/// Finds the typed engine failure inside an error chain, if any.
pub fn engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.chain().find_map(|cause| cause.downcast_ref::<EngineError>())
}
