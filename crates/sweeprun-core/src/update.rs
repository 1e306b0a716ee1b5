//! Partial status updates handed to the run store.

use crate::{RunState, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A partial status update, applied on top of a stored task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// When the update was produced.
    pub last_update: DateTime<Utc>,

    /// New lifecycle state.
    pub state: RunState,

    /// Error message (only for `error`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Outputs reported by the run, replacing the stored ones when present.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub outputs: Map<String, Value>,

    /// Sweep summary table, set on a sweep parent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iterations: Vec<Vec<Value>>,
}

impl StatusUpdate {
    /// Create an update reflecting the given status.
    pub fn from_status(status: &TaskStatus, at: DateTime<Utc>) -> Self {
        Self {
            last_update: at,
            state: status.state,
            error: match status.state {
                RunState::Error => status.error.clone(),
                _ => None,
            },
            outputs: status.outputs.clone(),
            iterations: status.iterations.clone(),
        }
    }

    /// Apply this update to a status in place.
    pub fn apply_to(&self, status: &mut TaskStatus) {
        status.last_update = Some(self.last_update);
        status.state = self.state;
        if let Some(error) = &self.error {
            status.error = Some(error.clone());
        }
        if !self.outputs.is_empty() {
            status.outputs = self.outputs.clone();
        }
        if !self.iterations.is_empty() {
            status.iterations = self.iterations.clone();
        }
    }

    /// Dotted-path patch form (`status.state`, ...), as sent to stores.
    pub fn to_patch(&self) -> Map<String, Value> {
        let mut patch = Map::new();
        patch.insert(
            "status.last_update".to_string(),
            Value::String(self.last_update.to_rfc3339()),
        );
        patch.insert(
            "status.state".to_string(),
            Value::String(self.state.to_string()),
        );
        if let Some(error) = &self.error {
            patch.insert("status.error".to_string(), Value::String(error.clone()));
        }
        if !self.outputs.is_empty() {
            patch.insert(
                "status.outputs".to_string(),
                Value::Object(self.outputs.clone()),
            );
        }
        if !self.iterations.is_empty() {
            let rows = self.iterations.iter().cloned().map(Value::Array).collect();
            patch.insert("status.iterations".to_string(), Value::Array(rows));
        }
        patch
    }
}
