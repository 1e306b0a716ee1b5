//! Status enums for tasks and image builds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Task created and persisted, not yet handed to a backend.
    #[default]
    Submitted,
    /// Task handed to the execution backend.
    Running,
    /// Task finished without error.
    Completed,
    /// Task failed (backend failure, build failure or reported error).
    Error,
}

impl RunState {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Returns true if the task is still active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Lowercase name as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Parse a lowercase state name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(Self::Submitted),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported by the image builder for a dispatched build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
    /// Anything the builder reports that we do not recognize.
    #[serde(other)]
    Unknown,
}

impl BuildStatus {
    /// Map a raw builder status string.
    pub fn from_raw(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }

    /// Returns true if the build ended badly.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!RunState::Submitted.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Error.is_terminal());
    }

    #[test]
    fn test_state_serde_lowercase() {
        let json = serde_json::to_string(&RunState::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        let state: RunState = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(state, RunState::Error);
    }

    #[test]
    fn test_build_status_unknown() {
        assert_eq!(BuildStatus::from_raw("Succeeded"), BuildStatus::Succeeded);
        assert_eq!(BuildStatus::from_raw("ContainerCreating"), BuildStatus::Unknown);
        let status: BuildStatus = serde_json::from_str("\"evicted\"").unwrap();
        assert_eq!(status, BuildStatus::Unknown);
        assert!(BuildStatus::Error.is_failure());
        assert!(!BuildStatus::Pending.is_failure());
    }
}
