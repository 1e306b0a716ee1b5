//! Task files: a runtime and a task, as JSON or YAML.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sweeprun_core::{RunMode, RuntimeSpec, TaskDescriptor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskFileError {
    #[error("Failed to read task file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON task file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid YAML task file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid argument '{0}', expected name=value")]
    Argument(String),
}

/// Contents of a task file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFile {
    pub runtime: RuntimeSpec,
    pub task: TaskDescriptor,
}

impl TaskFile {
    /// Load a task file; `.yaml`/`.yml` files are YAML, anything else JSON.
    pub fn load(path: &Path) -> Result<Self, TaskFileError> {
        let text = std::fs::read_to_string(path)?;
        let yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );
        Self::parse(&text, yaml)
    }

    pub fn parse(text: &str, yaml: bool) -> Result<Self, TaskFileError> {
        if yaml {
            Ok(serde_yaml::from_str(text)?)
        } else {
            Ok(serde_json::from_str(text)?)
        }
    }
}

/// Parse a command-line value: JSON when it parses, else a plain string.
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Split `name=value`.
pub fn split_assignment(raw: &str) -> Result<(&str, &str), TaskFileError> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name, value)),
        _ => Err(TaskFileError::Argument(raw.to_string())),
    }
}

/// Parse `name=v1,v2,...` into a hyperparameter list.
pub fn parse_hyper(raw: &str) -> Result<(String, Vec<Value>), TaskFileError> {
    let (name, values) = split_assignment(raw)?;
    let values = values.split(',').map(|v| parse_value(v.trim())).collect();
    Ok((name.to_string(), values))
}

/// Parse a run mode name.
pub fn parse_mode(raw: &str) -> Result<RunMode, String> {
    match raw {
        "" | "default" => Ok(RunMode::Default),
        "pass" => Ok(RunMode::Pass),
        "args" => Ok(RunMode::Args),
        "noctx" => Ok(RunMode::NoCtx),
        other => Err(format!("unknown mode '{other}' (expected pass, args or noctx)")),
    }
}
