//! SweepRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Process execution
//! - Run stores
//! - Image builders
//!
//! All types here describe a unit of work, its runtime, and its lifecycle.

pub mod criterion;
pub mod error;
pub mod ids;
pub mod runtime;
pub mod status;
pub mod task;
pub mod update;

// Re-export commonly used types
pub use criterion::{is_comparable, SelectOp, SelectionCriterion};
pub use error::CoreError;
pub use ids::{BuildHandle, RunKey, Uid};
pub use runtime::{BackendKind, BuildDescriptor, RunMode, RuntimeSpec, DEFAULT_BASE_IMAGE};
pub use status::{BuildStatus, RunState};
pub use task::{SecretSourceRef, TaskDescriptor, TaskMetadata, TaskSpec, TaskStatus};
pub use update::StatusUpdate;
