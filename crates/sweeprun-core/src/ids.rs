//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a logical run, stable across its sweep iterations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    /// Create a new Uid from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random Uid (32 hex chars, no dashes).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Uid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Handle of a dispatched image build, as returned by the builder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildHandle(String);

impl BuildHandle {
    /// Create a new BuildHandle from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BuildHandle {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Store key of one task: `(uid[-iteration], project)`.
///
/// External consumers key on the rendered `uid-iteration` form, so
/// [`RunKey::store_uid`] must stay exactly as is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub uid: Uid,
    pub project: String,
    pub iteration: u32,
}

impl RunKey {
    /// Create a key for a standalone task (iteration 0).
    pub fn new(uid: Uid, project: impl Into<String>) -> Self {
        Self {
            uid,
            project: project.into(),
            iteration: 0,
        }
    }

    /// Builder method to set the sweep iteration.
    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    /// The uid under which the store files this task.
    pub fn store_uid(&self) -> String {
        if self.iteration == 0 {
            self.uid.to_string()
        } else {
            format!("{}-{}", self.uid, self.iteration)
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.store_uid())
    }
}
