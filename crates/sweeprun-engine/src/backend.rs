//! Execution backends.
//!
//! A backend receives a fully resolved command and returns the result
//! payload of the task (`metadata` + `status`). The set of backends is
//! closed: [`Backend`] dispatches on the [`BackendKind`] tag it was built
//! with.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use sweeprun_core::{BackendKind, TaskDescriptor};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Env var carrying the serialized task for the executed command.
pub const EXEC_CONFIG_ENV: &str = "SWEEPRUN_EXEC_CONFIG";

/// Env var carrying the run store location.
pub const DBPATH_ENV: &str = "SWEEPRUN_DBPATH";

/// Env var carrying base64 inline code.
pub const EXEC_CODE_ENV: &str = "SWEEPRUN_EXEC_CODE";

/// Errors raised by execution backends.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Execution failed: {0}")]
    Failed(String),

    #[error("Invalid result payload: {0}")]
    Payload(String),
}

/// A task ready to be handed to a backend.
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Runtime image (empty for backends that do not use one).
    pub image: String,
    /// Snapshot of the task being executed.
    pub task: TaskDescriptor,
}

/// Capability shared by every execution backend.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Kind tag of this backend.
    fn kind(&self) -> BackendKind;

    /// Execute the command and return the result payload.
    async fn execute(&self, cmd: &ResolvedCommand) -> Result<TaskDescriptor, BackendError>;
}

/// Runs the command as a local child process.
///
/// The result payload is the last stdout line holding a JSON object; a
/// process printing none yields the input task with no outputs.
#[derive(Debug, Clone, Default)]
pub struct LocalProcessBackend {
    working_dir: Option<PathBuf>,
}

impl LocalProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to run commands in a given directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl ExecutionBackend for LocalProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn execute(&self, cmd: &ResolvedCommand) -> Result<TaskDescriptor, BackendError> {
        if cmd.command.is_empty() {
            return Err(BackendError::Failed("no command to execute".to_string()));
        }

        info!(command = %cmd.command, args = ?cmd.args, "Spawning local process");

        let mut process = Command::new(&cmd.command);
        process
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            process.current_dir(dir);
        }

        let output = process.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr.lines().last().unwrap_or_default();
            warn!(status = %output.status, stderr = %tail, "Process exited with error");
            return Err(BackendError::Failed(format!(
                "process exited with {}: {}",
                output.status, tail
            )));
        }

        match parse_payload(&stdout)? {
            Some(payload) => Ok(payload),
            None => {
                debug!("Process printed no result payload");
                Ok(cmd.task.clone())
            }
        }
    }
}

/// Find the last JSON object line in the process output.
fn parse_payload(stdout: &str) -> Result<Option<TaskDescriptor>, BackendError> {
    let Some(line) = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('{') && l.ends_with('}'))
    else {
        return Ok(None);
    };
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| BackendError::Payload(e.to_string()))
}

type HandlerFn =
    Arc<dyn Fn(TaskDescriptor) -> BoxFuture<'static, Result<TaskDescriptor, BackendError>> + Send + Sync>;

/// Runs the task through an in-process async handler.
#[derive(Clone)]
pub struct FnBackend {
    handler: HandlerFn,
}

impl FnBackend {
    /// Wrap an async function taking the task and returning its payload.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(TaskDescriptor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskDescriptor, BackendError>> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |task| Box::pin(handler(task))),
        }
    }
}

#[async_trait]
impl ExecutionBackend for FnBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Handler
    }

    async fn execute(&self, cmd: &ResolvedCommand) -> Result<TaskDescriptor, BackendError> {
        (self.handler)(cmd.task.clone()).await
    }
}

/// The closed set of backends, selected by kind at construction.
#[derive(Clone)]
pub enum Backend {
    Local(LocalProcessBackend),
    Handler(FnBackend),
}

impl Backend {
    /// A local process backend.
    pub fn local() -> Self {
        Self::Local(LocalProcessBackend::new())
    }

    /// An in-process handler backend.
    pub fn handler<F, Fut>(handler: F) -> Self
    where
        F: Fn(TaskDescriptor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskDescriptor, BackendError>> + Send + 'static,
    {
        Self::Handler(FnBackend::new(handler))
    }
}

#[async_trait]
impl ExecutionBackend for Backend {
    fn kind(&self) -> BackendKind {
        match self {
            Self::Local(b) => b.kind(),
            Self::Handler(b) => b.kind(),
        }
    }

    async fn execute(&self, cmd: &ResolvedCommand) -> Result<TaskDescriptor, BackendError> {
        match self {
            Self::Local(b) => b.execute(cmd).await,
            Self::Handler(b) => b.execute(cmd).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sweeprun_core::RunState;

    fn resolved(command: &str, args: &[&str]) -> ResolvedCommand {
        ResolvedCommand {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
            image: String::new(),
            task: TaskDescriptor::new("t"),
        }
    }

    #[test]
    fn test_parse_payload_takes_last_object() {
        let out = "starting\n{\"status\":{\"outputs\":{\"a\":1}}}\nnoise\n{\"status\":{\"outputs\":{\"a\":2}}}\n";
        let payload = parse_payload(out).unwrap().unwrap();
        assert_eq!(payload.output("a"), Some(&json!(2)));
        assert!(parse_payload("no json here").unwrap().is_none());
        assert!(parse_payload("{not json}").is_err());
    }

    #[tokio::test]
    async fn test_fn_backend_kind_and_result() {
        let backend = Backend::handler(|mut task: TaskDescriptor| async move {
            task.status.outputs.insert("accuracy".to_string(), json!(0.8));
            Ok(task)
        });
        assert_eq!(backend.kind(), BackendKind::Handler);
        let payload = backend.execute(&resolved("", &[])).await.unwrap();
        assert_eq!(payload.output("accuracy"), Some(&json!(0.8)));
    }

    #[tokio::test]
    async fn test_local_backend_requires_command() {
        let err = Backend::local().execute(&resolved("", &[])).await.unwrap_err();
        assert!(matches!(err, BackendError::Failed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_backend_reads_payload() {
        let cmd = resolved(
            "sh",
            &["-c", r#"echo hello; echo '{"status":{"state":"completed","outputs":{"loss":0.25}}}'"#],
        );
        let payload = LocalProcessBackend::new().execute(&cmd).await.unwrap();
        assert_eq!(payload.status.state, RunState::Completed);
        assert_eq!(payload.output("loss"), Some(&json!(0.25)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_backend_passes_env() {
        let mut cmd = resolved(
            "sh",
            &["-c", r#"echo "{\"status\":{\"outputs\":{\"who\":\"$WHO\"}}}""#],
        );
        cmd.env.push(("WHO".to_string(), "bob".to_string()));
        let payload = LocalProcessBackend::new().execute(&cmd).await.unwrap();
        assert_eq!(payload.output("who"), Some(&json!("bob")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_backend_nonzero_exit() {
        let cmd = resolved("sh", &["-c", "echo oops >&2; exit 3"]);
        let err = LocalProcessBackend::new().execute(&cmd).await.unwrap_err();
        match err {
            BackendError::Failed(msg) => assert!(msg.contains("oops")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_backend_no_payload_returns_task() {
        let cmd = resolved("true", &[]);
        let payload = LocalProcessBackend::new().execute(&cmd).await.unwrap();
        assert_eq!(payload, cmd.task);
    }
}
