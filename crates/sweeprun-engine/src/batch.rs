//! Batch orchestrator: runs every task of a sweep, one after another.

use sweeprun_core::{RunState, SelectionCriterion, TaskDescriptor};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::executor::RunExecutor;
use crate::generator::TaskGenerator;
use crate::selector::{aggregate_state, select, summarize, Selection, SummaryTable};

/// Terminal tasks of one batch, in generation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResultSet {
    tasks: Vec<TaskDescriptor>,
}

impl BatchResultSet {
    pub fn tasks(&self) -> &[TaskDescriptor] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<TaskDescriptor> {
        self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of tasks that ended in `error`.
    pub fn failures(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status.state == RunState::Error)
            .count()
    }

    pub fn summary(&self) -> SummaryTable {
        summarize(&self.tasks)
    }

    pub fn select(&self, criterion: Option<&SelectionCriterion>) -> Selection {
        select(&self.tasks, criterion)
    }

    /// Overall state and failure message of the batch.
    pub fn aggregate(&self) -> (RunState, Option<String>) {
        aggregate_state(&self.tasks)
    }

    /// The task elected by a selection, if any.
    pub fn winner(&self, selection: &Selection) -> Option<&TaskDescriptor> {
        match selection {
            Selection::Winner { index, .. } => self.tasks.get(*index),
            _ => None,
        }
    }
}

impl From<Vec<TaskDescriptor>> for BatchResultSet {
    fn from(tasks: Vec<TaskDescriptor>) -> Self {
        Self { tasks }
    }
}

/// Runs generated tasks sequentially through a [`RunExecutor`].
pub struct BatchOrchestrator<'a> {
    executor: &'a RunExecutor,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(executor: &'a RunExecutor) -> Self {
        Self { executor }
    }

    /// Run every generated task in order.
    ///
    /// A failing task is recorded in its own `error` state and the batch
    /// moves on. A generator yielding nothing is an [`EngineError::EmptyBatch`].
    pub async fn run(&self, generator: TaskGenerator) -> Result<BatchResultSet, EngineError> {
        let mut tasks = Vec::with_capacity(generator.size_hint().0);
        for task in generator {
            let done = self.executor.execute(task).await;
            if done.status.state == RunState::Error {
                warn!(
                    uid = ?done.metadata.uid,
                    iteration = done.metadata.iteration,
                    error = done.status.error.as_deref().unwrap_or_default(),
                    "Task failed, continuing batch"
                );
            }
            tasks.push(done);
        }

        if tasks.is_empty() {
            return Err(EngineError::EmptyBatch);
        }

        let results = BatchResultSet::from(tasks);
        info!(
            tasks = results.len(),
            failed = results.failures(),
            "Batch finished"
        );
        Ok(results)
    }
}
