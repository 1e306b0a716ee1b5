//! Run store: the system of record for task descriptors.
//!
//! The engine only ever holds a working copy of a task; after each
//! transition it hands a snapshot to a [`RunStore`]. Keys follow the
//! `(uid[-iteration], project)` convention of [`RunKey::store_uid`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sweeprun_core::{RunKey, RunState, StatusUpdate, TaskDescriptor};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Errors raised by run stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run not found: {0}")]
    NotFound(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid store key component '{0}'")]
    InvalidKey(String),
}

/// Filter for [`RunStore::list_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub project: Option<String>,
    pub name: Option<String>,
    pub state: Option<RunState>,
    /// `key` (label present) or `key=value` (label equals).
    pub labels: Vec<String>,
    /// Keep only the newest N runs (0 keeps all).
    pub last: usize,
}

impl RunFilter {
    /// Builder method to filter by project.
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Builder method to filter by state.
    pub fn with_state(mut self, state: RunState) -> Self {
        self.state = Some(state);
        self
    }

    /// Builder method to keep only the newest N runs.
    pub fn with_last(mut self, last: usize) -> Self {
        self.last = last;
        self
    }

    /// Check whether a stored task passes this filter.
    pub fn matches(&self, task: &TaskDescriptor) -> bool {
        if let Some(project) = &self.project {
            if &task.metadata.project != project {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &task.metadata.name != name {
                return false;
            }
        }
        if let Some(state) = self.state {
            if task.status.state != state {
                return false;
            }
        }
        self.labels.iter().all(|label| match label.split_once('=') {
            Some((k, v)) => task.metadata.labels.get(k).map(String::as_str) == Some(v),
            None => task.metadata.labels.contains_key(label),
        })
    }

    /// Sort newest first and apply the `last` limit.
    fn finish(&self, mut runs: Vec<TaskDescriptor>) -> Vec<TaskDescriptor> {
        runs.sort_by(|a, b| {
            let ta = a.status.last_update.or(a.status.start_time);
            let tb = b.status.last_update.or(b.status.start_time);
            tb.cmp(&ta)
        });
        if self.last > 0 {
            runs.truncate(self.last);
        }
        runs
    }
}

/// Persistent run store.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Prepare the store for a run or batch. Called once per run.
    async fn connect(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Store a full descriptor snapshot.
    async fn store_run(&self, task: &TaskDescriptor, key: &RunKey) -> Result<(), StoreError>;

    /// Apply a partial status update to a stored descriptor.
    async fn update_run(&self, update: &StatusUpdate, key: &RunKey) -> Result<(), StoreError>;

    /// Read a stored descriptor.
    async fn read_run(&self, key: &RunKey) -> Result<TaskDescriptor, StoreError>;

    /// List stored descriptors, newest first.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<TaskDescriptor>, StoreError>;

    /// Delete a stored descriptor.
    async fn del_run(&self, key: &RunKey) -> Result<(), StoreError>;
}

/// In-memory run store.
#[derive(Clone, Default)]
pub struct MemoryRunStore {
    runs: Arc<RwLock<HashMap<(String, String), TaskDescriptor>>>,
}

impl MemoryRunStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs.
    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    /// Whether the store holds no runs.
    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }

    fn map_key(key: &RunKey) -> (String, String) {
        (key.project.clone(), key.store_uid())
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn store_run(&self, task: &TaskDescriptor, key: &RunKey) -> Result<(), StoreError> {
        self.runs
            .write()
            .await
            .insert(Self::map_key(key), task.clone());
        Ok(())
    }

    async fn update_run(&self, update: &StatusUpdate, key: &RunKey) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        let task = runs
            .get_mut(&Self::map_key(key))
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        update.apply_to(&mut task.status);
        Ok(())
    }

    async fn read_run(&self, key: &RunKey) -> Result<TaskDescriptor, StoreError> {
        self.runs
            .read()
            .await
            .get(&Self::map_key(key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<TaskDescriptor>, StoreError> {
        let runs = self.runs.read().await;
        let matched = runs.values().filter(|t| filter.matches(t)).cloned().collect();
        Ok(filter.finish(matched))
    }

    async fn del_run(&self, key: &RunKey) -> Result<(), StoreError> {
        self.runs
            .write()
            .await
            .remove(&Self::map_key(key))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

/// File-backed run store: `<root>/runs/<project>/<uid[-iteration]>.json`.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    root: PathBuf,
}

impl FileRunStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn run_path(&self, key: &RunKey) -> Result<PathBuf, StoreError> {
        let uid = key.store_uid();
        Ok(self
            .project_dir(&key.project)?
            .join(format!("{}.json", path_component(&uid)?)))
    }

    fn project_dir(&self, project: &str) -> Result<PathBuf, StoreError> {
        Ok(self.runs_dir().join(path_component(project)?))
    }

    async fn read_value(&self, key: &RunKey) -> Result<Value, StoreError> {
        let path = self.run_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_value(&self, key: &RunKey, value: &Value) -> Result<(), StoreError> {
        let path = self.run_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_dir_runs(&self, dir: &Path, out: &mut Vec<TaskDescriptor>) -> Result<(), StoreError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<TaskDescriptor>(&bytes) {
                Ok(task) => out.push(task),
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable run file"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn connect(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(self.runs_dir()).await?;
        Ok(())
    }

    async fn store_run(&self, task: &TaskDescriptor, key: &RunKey) -> Result<(), StoreError> {
        let value = serde_json::to_value(task)?;
        self.write_value(key, &value).await
    }

    async fn update_run(&self, update: &StatusUpdate, key: &RunKey) -> Result<(), StoreError> {
        let mut value = self.read_value(key).await?;
        for (path, new) in update.to_patch() {
            update_in(&mut value, &path, new);
        }
        self.write_value(key, &value).await
    }

    async fn read_run(&self, key: &RunKey) -> Result<TaskDescriptor, StoreError> {
        let value = self.read_value(key).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<TaskDescriptor>, StoreError> {
        let mut runs = Vec::new();
        match &filter.project {
            Some(project) => {
                self.read_dir_runs(&self.project_dir(project)?, &mut runs)
                    .await?
            }
            None => {
                let mut projects = match tokio::fs::read_dir(self.runs_dir()).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
                    Err(e) => return Err(e.into()),
                };
                while let Some(entry) = projects.next_entry().await? {
                    if entry.file_type().await?.is_dir() {
                        self.read_dir_runs(&entry.path(), &mut runs).await?;
                    }
                }
            }
        }
        runs.retain(|t| filter.matches(t));
        Ok(filter.finish(runs))
    }

    async fn del_run(&self, key: &RunKey) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.run_path(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// A project or uid used as a single path segment under the store root.
fn path_component(name: &str) -> Result<&str, StoreError> {
    let invalid = name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains(['/', '\\'])
        || Path::new(name).is_absolute();
    if invalid {
        return Err(StoreError::InvalidKey(name.to_string()));
    }
    Ok(name)
}

/// Set a dotted path (`status.state`) inside a JSON document, creating
/// intermediate objects as needed.
fn update_in(doc: &mut Value, path: &str, new: Value) {
    if !doc.is_object() {
        *doc = Value::Object(serde_json::Map::new());
    }
    let Some(map) = doc.as_object_mut() else {
        return;
    };
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), new);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            update_in(child, rest, new);
        }
    }
}
