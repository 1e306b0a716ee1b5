//! Core domain errors.

use thiserror::Error;

/// Core domain errors for SweepRun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad user configuration (sweep spec, criterion, image settings).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}
