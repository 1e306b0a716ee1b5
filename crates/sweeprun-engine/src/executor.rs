//! Run executor: drives one task from `submitted` to a terminal state.
//!
//! Flow of a run:
//! 1. stamp identity and labels on the task
//! 2. persist it as `submitted` (best-effort)
//! 3. hand the resolved command to the backend
//! 4. normalize the payload status into `completed` or `error`
//! 5. persist the terminal state as a partial update (best-effort)

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sweeprun_core::{
    CoreError, RunKey, RunMode, RunState, RuntimeSpec, StatusUpdate, TaskDescriptor, TaskStatus, Uid,
};
use tracing::{error, info, warn};

use crate::backend::{
    Backend, ExecutionBackend, ResolvedCommand, DBPATH_ENV, EXEC_CODE_ENV, EXEC_CONFIG_ENV,
};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::report::ReportSink;
use crate::store::RunStore;

/// Force a payload status into a terminal state.
///
/// The status ends in `error` when the payload says so, carries an error
/// message, or a local error was raised; otherwise it ends `completed`.
/// A local error is attached only when the payload has no message of its
/// own. Applying this twice gives the same status.
pub fn normalize_status(mut status: TaskStatus, local_error: Option<&str>) -> TaskStatus {
    let payload_error = status.error.as_deref().is_some_and(|e| !e.is_empty());
    let local_error = local_error.filter(|e| !e.is_empty());

    if status.state != RunState::Error && !payload_error && local_error.is_none() {
        status.state = RunState::Completed;
        status.error = None;
        return status;
    }

    status.state = RunState::Error;
    if !payload_error {
        status.error = Some(local_error.unwrap_or("run failed").to_string());
    }
    status
}

/// Executes single tasks through a backend.
#[derive(Clone)]
pub struct RunExecutor {
    backend: Backend,
    store: Option<Arc<dyn RunStore>>,
    reporter: Option<Arc<dyn ReportSink>>,
    config: EngineConfig,
    image: String,
    mode: RunMode,
    inline_code: Option<String>,
    secret_env: Vec<(String, String)>,
}

impl RunExecutor {
    pub fn new(backend: Backend, config: EngineConfig) -> Self {
        Self {
            backend,
            store: None,
            reporter: None,
            config,
            image: String::new(),
            mode: RunMode::default(),
            inline_code: None,
            secret_env: Vec::new(),
        }
    }

    /// Builder method to persist transitions to a run store.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builder method to write a report after successful runs.
    pub fn with_reporter(mut self, reporter: Arc<dyn ReportSink>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Builder method to take image, mode and inline code from a runtime.
    pub fn with_runtime(mut self, runtime: &RuntimeSpec) -> Self {
        self.image = runtime.image.clone();
        self.mode = runtime.mode;
        self.inline_code = runtime.build.inline_code.clone();
        self
    }

    /// Builder method to pass resolved secrets to executed commands.
    pub fn with_secret_env(mut self, env: Vec<(String, String)>) -> Self {
        self.secret_env = env;
        self
    }

    pub fn store(&self) -> Option<&Arc<dyn RunStore>> {
        self.store.as_ref()
    }

    pub fn reporter(&self) -> Option<&Arc<dyn ReportSink>> {
        self.reporter.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stamp identity and labels on a task about to run.
    ///
    /// Assigns a uid when absent, the default project when none is set, and
    /// the `kind` and `owner` labels. An existing `owner` label is kept.
    ///
    /// A task that already finished is a re-run: it gets a fresh uid and a
    /// reset status so the stored terminal record stays untouched.
    pub fn prepare(&self, task: &mut TaskDescriptor) {
        if task.status.state.is_terminal() {
            let fresh = Uid::generate();
            info!(
                previous = ?task.metadata.uid,
                uid = %fresh,
                "Re-running finished task under a new uid"
            );
            task.metadata.uid = Some(fresh);
            task.status = TaskStatus::default();
        }
        if task.metadata.uid.is_none() {
            task.metadata.uid = Some(Uid::generate());
        }
        if task.metadata.project.is_empty() {
            task.metadata.project = self.config.default_project.clone();
        }
        task.metadata
            .labels
            .insert("kind".to_string(), self.backend.kind().as_str().to_string());
        if !task.metadata.labels.contains_key("owner") {
            if let Some(owner) = self.config.owner.as_ref().filter(|o| !o.is_empty()) {
                task.metadata.labels.insert("owner".to_string(), owner.clone());
            }
        }
        if task.status.start_time.is_none() {
            task.status.start_time = Some(Utc::now());
        }
    }

    /// Run one standalone task.
    ///
    /// The terminal state is persisted before returning. A task ending in
    /// `error` is returned as [`EngineError::Run`].
    pub async fn run(&self, task: TaskDescriptor) -> Result<TaskDescriptor, EngineError> {
        let done = self.execute(task).await;
        match done.status.state {
            RunState::Error => Err(EngineError::Run(
                done.status.error.unwrap_or_else(|| "run failed".to_string()),
            )),
            _ => {
                self.report(&done);
                Ok(done)
            }
        }
    }

    /// Run one task and return it in its terminal state.
    ///
    /// Backend failures are captured into the task's `error` state, never
    /// returned.
    pub async fn execute(&self, mut task: TaskDescriptor) -> TaskDescriptor {
        self.prepare(&mut task);
        let key = match task.key() {
            Some(key) => key,
            None => {
                // prepare() always assigns a uid
                task.status = normalize_status(task.status, Some("task has no uid"));
                return task;
            }
        };

        info!(
            name = %task.metadata.name,
            uid = %key.uid,
            project = %key.project,
            iteration = key.iteration,
            "Starting run"
        );

        if let Err(e) = task.transition(RunState::Submitted) {
            return self.reject(task, &key, &e.to_string()).await;
        }
        task.status.last_update = Some(Utc::now());
        self.store_snapshot(&task, &key).await;

        if let Err(e) = task.transition(RunState::Running) {
            return self.reject(task, &key, &e.to_string()).await;
        }
        task.status.last_update = Some(Utc::now());
        self.persist_update(&task, &key).await;

        let (status, local_error) = match self.resolve_command(&task) {
            Ok(cmd) => match self.backend.execute(&cmd).await {
                Ok(payload) => (payload.status, None),
                Err(e) => {
                    error!(uid = %key.uid, iteration = key.iteration, error = %e, "Run failed");
                    (task.status.clone(), Some(e.to_string()))
                }
            },
            Err(e) => (task.status.clone(), Some(e.to_string())),
        };

        let status = normalize_status(status, local_error.as_deref());
        let terminal = status.state;
        task.status = TaskStatus {
            state: task.status.state,
            start_time: task.status.start_time,
            last_update: Some(Utc::now()),
            ..status
        };
        if let Err(e) = task.transition(terminal) {
            return self.reject(task, &key, &e.to_string()).await;
        }

        info!(
            uid = %key.uid,
            iteration = key.iteration,
            state = %task.status.state,
            "Run finished"
        );
        self.persist_update(&task, &key).await;
        task
    }

    /// End a task in `error` without running it.
    async fn reject(&self, mut task: TaskDescriptor, key: &RunKey, reason: &str) -> TaskDescriptor {
        error!(uid = %key.uid, iteration = key.iteration, error = reason, "Run rejected");
        task.status = normalize_status(task.status, Some(reason));
        task.status.last_update = Some(Utc::now());
        self.persist_update(&task, key).await;
        task
    }

    /// Build the command handed to the backend.
    fn resolve_command(&self, task: &TaskDescriptor) -> Result<ResolvedCommand, EngineError> {
        let mut args = task.spec.args.clone();
        if let Some(handler) = &task.spec.handler {
            args.push("--handler".to_string());
            args.push(handler.clone());
        }
        if self.mode.params_as_args() {
            for (name, value) in &task.spec.parameters {
                args.push(format!("--{name}"));
                args.push(arg_text(value));
            }
        }

        let config = serde_json::to_string(task)
            .map_err(|e| CoreError::Serialization(format!("task payload: {e}")))?;
        let mut env = vec![(EXEC_CONFIG_ENV.to_string(), config)];
        if let Some(path) = &self.config.store_path {
            env.push((DBPATH_ENV.to_string(), path.display().to_string()));
        }
        if let Some(code) = &self.inline_code {
            env.push((EXEC_CODE_ENV.to_string(), code.clone()));
        }
        env.extend(self.secret_env.iter().cloned());

        Ok(ResolvedCommand {
            command: task.spec.command.clone(),
            args,
            env,
            image: self.image.clone(),
            task: task.clone(),
        })
    }

    /// Persist a full snapshot. Store failures are logged and ignored.
    pub(crate) async fn store_snapshot(&self, task: &TaskDescriptor, key: &RunKey) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.store_run(task, key).await {
            warn!(key = %key, error = %e, "Failed to store run");
        }
    }

    /// Persist the task's status as a partial update. Store failures are
    /// logged and ignored.
    pub(crate) async fn persist_update(&self, task: &TaskDescriptor, key: &RunKey) {
        let Some(store) = &self.store else {
            return;
        };
        let update = StatusUpdate::from_status(&task.status, Utc::now());
        if let Err(e) = store.update_run(&update, key).await {
            warn!(key = %key, error = %e, "Failed to update run state");
        }
    }

    /// Hand a terminal payload to the reporting sink, ignoring failures.
    pub(crate) fn report(&self, task: &TaskDescriptor) {
        let Some(reporter) = &self.reporter else {
            return;
        };
        if let Err(e) = reporter.write_report(task) {
            warn!(name = %task.metadata.name, error = %e, "Failed to write run report");
        }
    }
}

/// Command-line text of a parameter value.
fn arg_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::report::ReportError;
    use crate::store::MemoryRunStore;
    use serde_json::json;
    use std::sync::Mutex;

    fn succeed_with_accuracy() -> Backend {
        Backend::handler(|mut task: TaskDescriptor| async move {
            task.status
                .outputs
                .insert("accuracy".to_string(), json!(0.9));
            Ok(task)
        })
    }

    fn always_fail() -> Backend {
        Backend::handler(|_task: TaskDescriptor| async move {
            Err(BackendError::Failed("out of memory".to_string()))
        })
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<String>>,
    }

    impl ReportSink for RecordingSink {
        fn write_report(&self, payload: &TaskDescriptor) -> Result<(), ReportError> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(payload.metadata.name.clone());
            }
            Ok(())
        }
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let cases = vec![
            (TaskStatus::default(), None),
            (TaskStatus::default(), Some("local")),
            (
                TaskStatus {
                    error: Some("remote".to_string()),
                    ..TaskStatus::default()
                },
                Some("local"),
            ),
            (
                TaskStatus {
                    state: RunState::Error,
                    ..TaskStatus::default()
                },
                None,
            ),
        ];
        for (status, local) in cases {
            let once = normalize_status(status, local);
            let twice = normalize_status(once.clone(), local);
            assert_eq!(once, twice);
            assert!(once.state.is_terminal());
        }
    }

    #[test]
    fn test_normalize_error_precedence() {
        let ok = normalize_status(TaskStatus::default(), None);
        assert_eq!(ok.state, RunState::Completed);

        let local = normalize_status(TaskStatus::default(), Some("boom"));
        assert_eq!(local.state, RunState::Error);
        assert_eq!(local.error.as_deref(), Some("boom"));

        let remote = TaskStatus {
            error: Some("remote".to_string()),
            ..TaskStatus::default()
        };
        let remote = normalize_status(remote, Some("boom"));
        assert_eq!(remote.error.as_deref(), Some("remote"));
    }

    #[tokio::test]
    async fn test_prepare_stamps_identity() {
        let config = EngineConfig {
            owner: Some("alice".to_string()),
            ..EngineConfig::default()
        };
        let executor = RunExecutor::new(succeed_with_accuracy(), config);

        let mut task = TaskDescriptor::new("train");
        executor.prepare(&mut task);
        assert_eq!(task.metadata.uid.as_ref().map(|u| u.as_str().len()), Some(32));
        assert_eq!(task.metadata.project, "default");
        assert_eq!(task.metadata.labels["kind"], "handler");
        assert_eq!(task.metadata.labels["owner"], "alice");

        let mut task = TaskDescriptor::new("train").with_label("owner", "bob");
        executor.prepare(&mut task);
        assert_eq!(task.metadata.labels["owner"], "bob");
    }

    #[tokio::test]
    async fn test_run_persists_terminal_state() {
        let store = Arc::new(MemoryRunStore::new());
        let sink = Arc::new(RecordingSink::default());
        let executor = RunExecutor::new(succeed_with_accuracy(), EngineConfig::default())
            .with_store(store.clone())
            .with_reporter(sink.clone());

        let task = TaskDescriptor::new("train")
            .with_project("p1")
            .with_uid(Uid::new("u1"));
        let done = executor.run(task).await.unwrap();
        assert_eq!(done.status.state, RunState::Completed);
        assert_eq!(done.output("accuracy"), Some(&json!(0.9)));

        let stored = store
            .read_run(&RunKey::new(Uid::new("u1"), "p1"))
            .await
            .unwrap();
        assert_eq!(stored.status.state, RunState::Completed);
        assert_eq!(stored.output("accuracy"), Some(&json!(0.9)));
        assert_eq!(sink.seen.lock().unwrap().as_slice(), ["train"]);
    }

    #[tokio::test]
    async fn test_run_error_is_persisted_then_raised() {
        let store = Arc::new(MemoryRunStore::new());
        let sink = Arc::new(RecordingSink::default());
        let executor = RunExecutor::new(always_fail(), EngineConfig::default())
            .with_store(store.clone())
            .with_reporter(sink.clone());

        let task = TaskDescriptor::new("train").with_uid(Uid::new("u2"));
        let err = executor.run(task).await.unwrap_err();
        assert!(matches!(err, EngineError::Run(ref m) if m.contains("out of memory")));

        let stored = store
            .read_run(&RunKey::new(Uid::new("u2"), "default"))
            .await
            .unwrap();
        assert_eq!(stored.status.state, RunState::Error);
        assert!(stored.status.error.unwrap().contains("out of memory"));
        assert!(sink.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_member_uses_iteration_key() {
        let store = Arc::new(MemoryRunStore::new());
        let executor =
            RunExecutor::new(succeed_with_accuracy(), EngineConfig::default()).with_store(store.clone());

        let mut task = TaskDescriptor::new("train")
            .with_project("p1")
            .with_uid(Uid::new("u3"));
        task.metadata.iteration = 4;
        executor.execute(task).await;

        let key = RunKey::new(Uid::new("u3"), "p1").with_iteration(4);
        assert_eq!(key.store_uid(), "u3-4");
        assert!(store.read_run(&key).await.is_ok());
        assert!(store.read_run(&RunKey::new(Uid::new("u3"), "p1")).await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_command_args_mode() {
        let config = EngineConfig {
            store_path: Some("/tmp/runs".into()),
            ..EngineConfig::default()
        };
        let runtime = RuntimeSpec::default().with_mode(RunMode::Args);
        let executor = RunExecutor::new(Backend::local(), config)
            .with_runtime(&runtime)
            .with_secret_env(vec![("SWEEPRUN_SECRET_TOKEN".to_string(), "t".to_string())]);

        let mut task = TaskDescriptor::new("train")
            .with_command("python", vec!["train.py".to_string()])
            .with_param("lr", 0.1)
            .with_param("kernel", "rbf");
        task.spec.handler = Some("main".to_string());

        let cmd = executor.resolve_command(&task).unwrap();
        assert_eq!(cmd.command, "python");
        assert_eq!(
            cmd.args,
            ["train.py", "--handler", "main", "--lr", "0.1", "--kernel", "rbf"]
        );
        let env: Vec<&str> = cmd.env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(env, [EXEC_CONFIG_ENV, DBPATH_ENV, "SWEEPRUN_SECRET_TOKEN"]);
    }

    #[tokio::test]
    async fn test_prepare_has_no_owner_without_config() {
        let executor = RunExecutor::new(succeed_with_accuracy(), EngineConfig::default());
        let mut task = TaskDescriptor::new("train");
        executor.prepare(&mut task);
        assert!(!task.metadata.labels.contains_key("owner"));
    }

    #[tokio::test]
    async fn test_finished_task_reruns_under_new_uid() {
        let store = Arc::new(MemoryRunStore::new());
        let ok = RunExecutor::new(succeed_with_accuracy(), EngineConfig::default())
            .with_store(store.clone());
        let done = ok
            .execute(TaskDescriptor::new("train").with_uid(Uid::new("u1")))
            .await;
        assert_eq!(done.status.state, RunState::Completed);

        let failing =
            RunExecutor::new(always_fail(), EngineConfig::default()).with_store(store.clone());
        let rerun = failing.execute(done).await;
        assert_eq!(rerun.status.state, RunState::Error);
        let new_uid = rerun.metadata.uid.clone().unwrap();
        assert_ne!(new_uid, Uid::new("u1"));

        let original = store
            .read_run(&RunKey::new(Uid::new("u1"), "default"))
            .await
            .unwrap();
        assert_eq!(original.status.state, RunState::Completed);
        assert_eq!(original.output("accuracy"), Some(&json!(0.9)));

        let stored = store.read_run(&RunKey::new(new_uid, "default")).await.unwrap();
        assert_eq!(stored.status.state, RunState::Error);
    }

    #[tokio::test]
    async fn test_running_task_is_rejected_without_backend_call() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let backend = Backend::handler(move |task: TaskDescriptor| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Ok(task)
            }
        });
        let executor = RunExecutor::new(backend, EngineConfig::default());

        let mut task = TaskDescriptor::new("train").with_uid(Uid::new("u4"));
        task.status.state = RunState::Running;
        let done = executor.execute(task).await;
        assert_eq!(done.status.state, RunState::Error);
        assert!(done.status.error.unwrap().contains("running -> submitted"));
        assert_eq!(done.metadata.uid, Some(Uid::new("u4")));
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_does_not_fail_run() {
        use crate::store::{RunFilter, StoreError};
        use async_trait::async_trait;

        struct DownStore;

        #[async_trait]
        impl RunStore for DownStore {
            async fn store_run(&self, _: &TaskDescriptor, _: &RunKey) -> Result<(), StoreError> {
                Err(StoreError::Unavailable("down".to_string()))
            }
            async fn update_run(&self, _: &StatusUpdate, _: &RunKey) -> Result<(), StoreError> {
                Err(StoreError::Unavailable("down".to_string()))
            }
            async fn read_run(&self, key: &RunKey) -> Result<TaskDescriptor, StoreError> {
                Err(StoreError::NotFound(key.to_string()))
            }
            async fn list_runs(&self, _: &RunFilter) -> Result<Vec<TaskDescriptor>, StoreError> {
                Ok(Vec::new())
            }
            async fn del_run(&self, _: &RunKey) -> Result<(), StoreError> {
                Ok(())
            }
        }

        let executor = RunExecutor::new(succeed_with_accuracy(), EngineConfig::default())
            .with_store(Arc::new(DownStore));
        let done = executor.run(TaskDescriptor::new("train")).await.unwrap();
        assert_eq!(done.status.state, RunState::Completed);
    }
}
