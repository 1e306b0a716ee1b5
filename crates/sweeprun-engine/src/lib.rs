//! SweepRun Engine
//!
//! Drives tasks from submission to a terminal state:
//! - expands sweeps into iterations ([`generator`])
//! - gates execution on image readiness ([`gate`])
//! - runs one task through a backend and persists its transitions ([`executor`])
//! - runs a whole sweep and isolates per-task failures ([`batch`])
//! - summarizes a sweep and elects the best iteration ([`selector`])
//!
//! The run store, execution backends, image builder, secret sources and
//! reporting sink sit behind traits so callers can plug their own.

pub mod backend;
pub mod batch;
pub mod config;
pub mod error;
pub mod executor;
pub mod gate;
pub mod generator;
pub mod orchestrator;
pub mod report;
pub mod secrets;
pub mod selector;
pub mod store;

pub use backend::{Backend, BackendError, ExecutionBackend, FnBackend, LocalProcessBackend, ResolvedCommand};
pub use batch::{BatchOrchestrator, BatchResultSet};
pub use config::EngineConfig;
pub use error::EngineError;
pub use executor::{normalize_status, RunExecutor};
pub use gate::{BuildGate, Builder, BuilderError, GateState, Readiness, ScriptedBuilder};
pub use generator::TaskGenerator;
pub use orchestrator::{BatchReport, Orchestrator, RunOutcome};
pub use report::{PipelineReport, ReportError, ReportSink};
pub use secrets::{EnvSecrets, MapSecrets, SecretSource, Secrets};
pub use selector::{aggregate_state, select, summarize, Selection, SummaryTable};
pub use store::{FileRunStore, MemoryRunStore, RunFilter, RunStore, StoreError};
