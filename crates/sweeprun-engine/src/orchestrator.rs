//! Orchestrator: the entry point taking a task to its final state.
//!
//! One call to [`Orchestrator::run`] is one orchestration step. While the
//! image is still being built the step returns [`RunOutcome::NotReady`] and
//! the caller decides when to step again.

use std::sync::Arc;

use serde_json::Value;
use sweeprun_core::{
    BuildStatus, RunState, RuntimeSpec, SelectionCriterion, TaskDescriptor,
};
use tracing::{error, info, warn};

use crate::backend::Backend;
use crate::batch::{BatchOrchestrator, BatchResultSet};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::{normalize_status, RunExecutor};
use crate::gate::{BuildGate, Builder, Readiness};
use crate::generator::TaskGenerator;
use crate::report::ReportSink;
use crate::secrets::Secrets;
use crate::selector::{Selection, SummaryTable};
use crate::store::RunStore;

/// Output name of the elected iteration on a sweep parent.
pub const BEST_ITERATION_OUTPUT: &str = "best_iteration";

/// Result of one orchestration step.
#[derive(Debug)]
pub enum RunOutcome {
    /// The image is not built yet; step again later.
    NotReady(BuildStatus),
    /// A standalone task completed.
    Single(TaskDescriptor),
    /// A sweep ran to the end; the parent may still be in `error`.
    Batch(BatchReport),
}

/// Everything a finished sweep produced.
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// Parent task carrying the summary table and aggregate state.
    pub parent: TaskDescriptor,
    pub results: BatchResultSet,
    pub summary: SummaryTable,
    pub selection: Selection,
    /// Set when the selector could not be parsed and selection was skipped.
    pub criterion_error: Option<String>,
}

impl BatchReport {
    /// The elected task, if any.
    pub fn winner(&self) -> Option<&TaskDescriptor> {
        self.results.winner(&self.selection)
    }
}

/// Drives tasks for one runtime.
pub struct Orchestrator {
    config: EngineConfig,
    runtime: RuntimeSpec,
    backend: Backend,
    builder: Option<Arc<dyn Builder>>,
    store: Option<Arc<dyn RunStore>>,
    reporter: Option<Arc<dyn ReportSink>>,
    gate: BuildGate,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, runtime: RuntimeSpec, backend: Backend) -> Self {
        let gate = BuildGate::for_runtime(&runtime);
        Self {
            config,
            runtime,
            backend,
            builder: None,
            store: None,
            reporter: None,
            gate,
        }
    }

    /// Builder method to set the image builder.
    pub fn with_builder(mut self, builder: Arc<dyn Builder>) -> Self {
        self.builder = Some(builder);
        self
    }

    /// Builder method to set the run store.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builder method to set the reporting sink.
    pub fn with_reporter(mut self, reporter: Arc<dyn ReportSink>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn runtime(&self) -> &RuntimeSpec {
        &self.runtime
    }

    pub fn gate(&self) -> &BuildGate {
        &self.gate
    }

    /// Run one orchestration step for `task`.
    ///
    /// Standalone tasks ending in `error` come back as [`EngineError::Run`]
    /// after their state is persisted. Sweeps always return their report;
    /// the parent's state tells whether any member failed.
    pub async fn run(&mut self, task: TaskDescriptor) -> Result<RunOutcome, EngineError> {
        match self
            .gate
            .step(&mut self.runtime, self.builder.as_deref())
            .await
        {
            Ok(Readiness::Ready) => {}
            Ok(Readiness::NotReady(status)) => return Ok(RunOutcome::NotReady(status)),
            Err(err @ EngineError::Build { .. }) => {
                self.fail_task(task, &err).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        }

        let secrets = Secrets::resolve(&task.spec.secret_sources)?;

        if let Some(store) = &self.store {
            if let Err(e) = store.connect().await {
                warn!(error = %e, "Run store unavailable, runs will not be persisted");
            }
        }

        let executor = self.executor(&secrets);
        let mut task = task;
        executor.prepare(&mut task);

        match TaskGenerator::for_task(&task)? {
            None => executor.run(task).await.map(RunOutcome::Single),
            Some(generator) => self
                .run_batch(&executor, task, generator)
                .await
                .map(RunOutcome::Batch),
        }
    }

    fn executor(&self, secrets: &Secrets) -> RunExecutor {
        let mut executor = RunExecutor::new(self.backend.clone(), self.config.clone())
            .with_runtime(&self.runtime)
            .with_secret_env(secrets.env_pairs());
        if let Some(store) = &self.store {
            executor = executor.with_store(store.clone());
        }
        if let Some(reporter) = &self.reporter {
            executor = executor.with_reporter(reporter.clone());
        }
        executor
    }

    async fn run_batch(
        &self,
        executor: &RunExecutor,
        mut parent: TaskDescriptor,
        generator: TaskGenerator,
    ) -> Result<BatchReport, EngineError> {
        let (criterion, criterion_error) =
            match SelectionCriterion::parse(parent.spec.selector.as_deref()) {
                Ok(criterion) => (criterion, None),
                Err(e) => {
                    error!(selector = ?parent.spec.selector, error = %e, "Selection skipped");
                    (None, Some(e.to_string()))
                }
            };

        let key = parent
            .key()
            .ok_or_else(|| EngineError::Run("sweep parent has no uid".to_string()))?;
        info!(
            name = %parent.metadata.name,
            uid = %key.uid,
            project = %key.project,
            tasks = generator.size_hint().0,
            "Starting sweep"
        );
        parent.transition(RunState::Running)?;
        executor.store_snapshot(&parent, &key).await;

        let results = match BatchOrchestrator::new(executor).run(generator).await {
            Ok(results) => results,
            Err(err) => {
                parent.status = normalize_status(parent.status, Some(&err.to_string()));
                executor.persist_update(&parent, &key).await;
                return Err(err);
            }
        };

        let summary = results.summary();
        let selection = results.select(criterion.as_ref());
        parent.status.iterations = summary.to_rows();
        if let Some(winner) = results.winner(&selection) {
            parent.status.outputs = winner.status.outputs.clone();
        }
        if criterion.is_some() {
            parent.status.outputs.insert(
                BEST_ITERATION_OUTPUT.to_string(),
                Value::from(selection.iteration()),
            );
        }

        let (state, message) = results.aggregate();
        parent.transition(state)?;
        parent.status.error = message;
        parent.status.last_update = Some(chrono::Utc::now());
        match state {
            RunState::Error => error!(
                uid = %key.uid,
                error = parent.status.error.as_deref().unwrap_or_default(),
                "Sweep finished with failures"
            ),
            _ => info!(uid = %key.uid, best = selection.iteration(), "Sweep completed"),
        }
        executor.persist_update(&parent, &key).await;

        executor.report(&parent);
        self.write_results_table(&summary);

        Ok(BatchReport {
            parent,
            results,
            summary,
            selection,
            criterion_error,
        })
    }

    /// Write the iteration results table under the report dir, ignoring failures.
    fn write_results_table(&self, summary: &SummaryTable) {
        let Some(dir) = &self.config.report_dir else {
            return;
        };
        let path = dir.join(&self.config.results_artifact);
        let written = summary.to_csv().and_then(|csv| {
            std::fs::create_dir_all(dir)?;
            std::fs::write(&path, csv)?;
            Ok(())
        });
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "Failed to write iteration results");
        }
    }

    /// End a task in `error` without running it.
    async fn fail_task(&self, mut task: TaskDescriptor, err: &EngineError) {
        let executor = self.executor(&Secrets::default());
        executor.prepare(&mut task);
        task.status = normalize_status(task.status, Some(&err.to_string()));
        task.status.last_update = Some(chrono::Utc::now());
        error!(name = %task.metadata.name, error = %err, "Run failed before execution");
        if let Some(key) = task.key() {
            executor.store_snapshot(&task, &key).await;
        }
    }
}
