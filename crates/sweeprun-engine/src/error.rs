//! Engine errors.

use sweeprun_core::{BuildHandle, BuildStatus, CoreError};
use thiserror::Error;

use crate::backend::BackendError;
use crate::gate::BuilderError;
use crate::store::StoreError;

/// Errors surfaced by the orchestration engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad sweep spec, bad criterion, missing image. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The image builder reported a failed build.
    #[error("Build {status}, watch the build logs: {handle}")]
    Build {
        handle: BuildHandle,
        status: BuildStatus,
    },

    /// A task ended in `error`.
    #[error("Run error: {0}")]
    Run(String),

    /// A sweep expanded to zero tasks.
    #[error("Batch produced no tasks, check the hyperparams or param_file")]
    EmptyBatch,

    /// A declared secret source could not be resolved.
    #[error("Secrets error: {0}")]
    Secrets(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Builder(#[from] BuilderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(CoreError),
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Configuration(msg) => Self::Configuration(msg),
            other => Self::Core(other),
        }
    }
}

impl EngineError {
    /// Whether this error stems from user configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_map_by_kind() {
        let err = EngineError::from(CoreError::Configuration("bad op".to_string()));
        assert!(err.is_configuration());

        let err = EngineError::from(CoreError::Serialization("task payload: boom".to_string()));
        assert!(matches!(err, EngineError::Core(CoreError::Serialization(_))));
        assert_eq!(err.to_string(), "Serialization error: task payload: boom");
    }
}
