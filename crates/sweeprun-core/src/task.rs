//! Task descriptor types.

use crate::{CoreError, RunKey, RunState, Uid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A TaskDescriptor describes one unit of work: who it is, what to run,
/// and where it is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDescriptor {
    pub metadata: TaskMetadata,
    pub spec: TaskSpec,
    pub status: TaskStatus,
}

/// Identity and labels of a task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskMetadata {
    /// Human-readable run name.
    pub name: String,

    /// Project the run belongs to.
    pub project: String,

    /// Assigned on first execution when absent.
    pub uid: Option<Uid>,

    /// 0 for a standalone task, 1-based for sweep members.
    pub iteration: u32,

    /// Free-form labels (kind, owner, ...).
    pub labels: BTreeMap<String, String>,
}

/// Reference to a named secret source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretSourceRef {
    /// Source kind, e.g. "env" or "file".
    pub kind: String,

    /// Kind-specific location (env prefix, file path).
    #[serde(default)]
    pub source: String,
}

/// What to run and with which parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    /// Command to execute.
    pub command: String,

    /// Command arguments.
    pub args: Vec<String>,

    /// Entry point within the command, when the backend supports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    /// Parameter name -> value, in declaration order.
    pub parameters: Map<String, Value>,

    /// Named inputs (name -> source path).
    pub inputs: BTreeMap<String, String>,

    /// Hyperparameter sweep: parameter name -> list of candidate values.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub hyperparams: Map<String, Value>,

    /// Path of a CSV parameter table, one task per row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param_file: Option<String>,

    /// Selection criterion, `"[op.]field"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,

    /// Secret sources to resolve before the run starts.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secret_sources: Vec<SecretSourceRef>,
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskStatus {
    pub state: RunState,

    /// Output name -> scalar value or artifact reference.
    pub outputs: Map<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,

    /// Sweep summary table (header row, then one row per iteration).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub iterations: Vec<Vec<Value>>,
}

impl TaskDescriptor {
    /// Create a new standalone task.
    pub fn new(name: impl Into<String>) -> Self {
        let mut task = Self::default();
        task.metadata.name = name.into();
        task
    }

    /// Builder method to set the project.
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.metadata.project = project.into();
        self
    }

    /// Builder method to set a specific uid (useful for testing and re-runs).
    pub fn with_uid(mut self, uid: Uid) -> Self {
        self.metadata.uid = Some(uid);
        self
    }

    /// Builder method to add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Builder method to set the command and its arguments.
    pub fn with_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.spec.command = command.into();
        self.spec.args = args;
        self
    }

    /// Builder method to set a parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.spec.parameters.insert(name.into(), value.into());
        self
    }

    /// Builder method to add a swept parameter.
    pub fn with_hyper_param(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.spec.hyperparams.insert(name.into(), Value::Array(values));
        self
    }

    /// Builder method to set the parameter table path.
    pub fn with_param_file(mut self, path: impl Into<String>) -> Self {
        self.spec.param_file = Some(path.into());
        self
    }

    /// Builder method to set the selection criterion.
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.spec.selector = Some(selector.into());
        self
    }

    /// Builder method to add a named input.
    pub fn with_input(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.spec.inputs.insert(name.into(), path.into());
        self
    }

    /// Whether this task expands into multiple iterations.
    pub fn is_sweep(&self) -> bool {
        !self.spec.hyperparams.is_empty() || self.spec.param_file.is_some()
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.state.is_terminal()
    }

    /// Store key of this task, once it has a uid.
    pub fn key(&self) -> Option<RunKey> {
        self.metadata.uid.as_ref().map(|uid| {
            RunKey::new(uid.clone(), self.metadata.project.clone())
                .with_iteration(self.metadata.iteration)
        })
    }

    /// Look up an output value.
    pub fn output(&self, field: &str) -> Option<&Value> {
        self.status.outputs.get(field)
    }

    /// Move the task to a new state.
    ///
    /// Terminal descriptors only accept a repeat of their own state.
    pub fn transition(&mut self, to: RunState) -> Result<(), CoreError> {
        let from = self.status.state;
        let allowed = match (from, to) {
            (a, b) if a == b => true,
            (RunState::Submitted, _) => true,
            (RunState::Running, RunState::Completed | RunState::Error) => true,
            _ => false,
        };
        if !allowed {
            return Err(CoreError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.status.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_task_is_submitted() {
        let task = TaskDescriptor::new("train").with_project("p1");
        assert_eq!(task.status.state, RunState::Submitted);
        assert_eq!(task.metadata.iteration, 0);
        assert!(task.key().is_none());
        assert!(!task.is_sweep());
    }

    #[test]
    fn test_sweep_detection() {
        let task = TaskDescriptor::new("t").with_hyper_param("p1", vec![json!(1), json!(2)]);
        assert!(task.is_sweep());
        let task = TaskDescriptor::new("t").with_param_file("params.csv");
        assert!(task.is_sweep());
    }

    #[test]
    fn test_terminal_is_frozen() {
        let mut task = TaskDescriptor::new("t");
        task.transition(RunState::Running).unwrap();
        task.transition(RunState::Completed).unwrap();
        task.transition(RunState::Completed).unwrap();

        let err = task.transition(RunState::Error).unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
        assert!(task.transition(RunState::Running).is_err());
    }

    #[test]
    fn test_payload_shape_deserializes() {
        let payload = json!({
            "metadata": {"uid": "u1", "project": "p", "iteration": 2},
            "status": {"state": "completed", "outputs": {"accuracy": 0.9}}
        });
        let task: TaskDescriptor = serde_json::from_value(payload).unwrap();
        assert_eq!(task.metadata.iteration, 2);
        assert_eq!(task.output("accuracy"), Some(&json!(0.9)));
        assert_eq!(task.key().unwrap().store_uid(), "u1-2");
    }

    #[test]
    fn test_hyperparams_keep_declared_order() {
        let task: TaskDescriptor = serde_json::from_str(
            r#"{"spec": {"hyperparams": {"zeta": [1], "alpha": [2]}}}"#,
        )
        .unwrap();
        let names: Vec<&String> = task.spec.hyperparams.keys().collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }
}
