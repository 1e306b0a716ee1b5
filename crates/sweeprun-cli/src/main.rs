//! SweepRun CLI - run tasks and sweeps, inspect the run store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sweeprun_core::{BackendKind, BuildStatus, RunKey, RunMode, RunState, TaskDescriptor, Uid};
use sweeprun_engine::{
    Backend, EngineConfig, FileRunStore, Orchestrator, PipelineReport, RunFilter, RunOutcome,
    RunStore, ScriptedBuilder,
};

mod taskfile;

use taskfile::{parse_hyper, parse_mode, parse_value, split_assignment, TaskFile};

/// SweepRun CLI - run tasks, hyperparameter sweeps and inspect results
#[derive(Parser)]
#[command(name = "sweeprun")]
#[command(about = "Run tasks and parameter sweeps", long_about = None)]
struct Cli {
    /// Run store directory
    #[arg(long, env = "SWEEPRUN_DBPATH", default_value = ".sweeprun")]
    db: PathBuf,

    /// Project name
    #[arg(short, long, env = "SWEEPRUN_PROJECT", default_value = "default")]
    project: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task or a sweep
    Run(RunArgs),

    /// Show a stored run
    Get {
        /// Run uid
        uid: String,

        /// Sweep iteration (0 for the parent or a standalone run)
        #[arg(short, long, default_value_t = 0)]
        iteration: u32,

        /// Print the raw JSON record
        #[arg(long)]
        json: bool,
    },

    /// List stored runs, newest first
    List {
        /// Only runs in this state
        #[arg(short, long)]
        state: Option<String>,

        /// Only runs carrying this label (key or key=value)
        #[arg(short, long)]
        label: Vec<String>,

        /// Show at most this many runs
        #[arg(long, default_value_t = 100)]
        last: usize,
    },

    /// Delete a stored run
    Delete {
        /// Run uid
        uid: String,

        #[arg(short, long, default_value_t = 0)]
        iteration: u32,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Task file (JSON, or YAML by extension)
    file: Option<PathBuf>,

    /// Task name
    #[arg(short, long)]
    name: Option<String>,

    /// Command to execute
    #[arg(short, long)]
    command: Option<String>,

    /// Command argument (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Entry point passed to the command as --handler
    #[arg(long)]
    handler: Option<String>,

    /// Run mode: pass, args or noctx
    #[arg(long, value_parser = parse_mode)]
    mode: Option<RunMode>,

    /// Runtime image
    #[arg(long)]
    image: Option<String>,

    /// Base image to run or build on
    #[arg(long)]
    base_image: Option<String>,

    /// Parameter as name=value (repeatable)
    #[arg(long = "param")]
    params: Vec<String>,

    /// Hyperparameter as name=v1,v2,... (repeatable)
    #[arg(long = "hyper")]
    hyper: Vec<String>,

    /// CSV parameter table, one run per row
    #[arg(long)]
    param_file: Option<String>,

    /// Selection criterion, e.g. max.accuracy
    #[arg(short, long)]
    selector: Option<String>,

    /// Directory for pipeline reports and the iteration results table
    #[arg(long, env = "SWEEPRUN_REPORT_DIR")]
    report_dir: Option<PathBuf>,

    /// Owner label for the run
    #[arg(long, env = "USER")]
    owner: Option<String>,

    /// Simulate image builds that succeed immediately
    #[arg(long)]
    dry_build: bool,

    /// Seconds between build status checks
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let store = FileRunStore::new(cli.db.clone());

    match cli.command {
        Commands::Run(args) => {
            run(store, cli.db, cli.project, args).await?;
        }
        Commands::Get {
            uid,
            iteration,
            json,
        } => {
            get_run(store, cli.project, uid, iteration, json).await?;
        }
        Commands::List { state, label, last } => {
            list_runs(store, cli.project, state, label, last).await?;
        }
        Commands::Delete { uid, iteration } => {
            let key = RunKey::new(Uid::new(uid), cli.project).with_iteration(iteration);
            store.del_run(&key).await?;
            println!("Run deleted: {}", key);
        }
    }

    Ok(())
}

/// Merge the task file and command-line overrides.
fn build_task_file(project: String, args: &RunArgs) -> Result<TaskFile, Box<dyn std::error::Error>> {
    let mut file = match &args.file {
        Some(path) => TaskFile::load(path)?,
        None => TaskFile::default(),
    };

    let task = &mut file.task;
    if let Some(name) = &args.name {
        task.metadata.name = name.clone();
    }
    if task.metadata.name.is_empty() {
        task.metadata.name = "run".to_string();
    }
    if task.metadata.project.is_empty() {
        task.metadata.project = project;
    }
    if let Some(command) = &args.command {
        task.spec.command = command.clone();
    }
    task.spec.args.extend(args.args.iter().cloned());
    if args.handler.is_some() {
        task.spec.handler = args.handler.clone();
    }
    for raw in &args.params {
        let (name, value) = split_assignment(raw)?;
        task.spec.parameters.insert(name.to_string(), parse_value(value));
    }
    for raw in &args.hyper {
        let (name, values) = parse_hyper(raw)?;
        task.spec
            .hyperparams
            .insert(name, serde_json::Value::Array(values));
    }
    if args.param_file.is_some() {
        task.spec.param_file = args.param_file.clone();
    }
    if args.selector.is_some() {
        task.spec.selector = args.selector.clone();
    }

    let runtime = &mut file.runtime;
    if let Some(mode) = args.mode {
        runtime.mode = mode;
    }
    if let Some(image) = &args.image {
        runtime.image = image.clone();
    }
    if let Some(base_image) = &args.base_image {
        runtime.build.base_image = base_image.clone();
    }

    Ok(file)
}

async fn run(
    store: FileRunStore,
    db: PathBuf,
    project: String,
    args: RunArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let TaskFile { runtime, task } = build_task_file(project.clone(), &args)?;
    if runtime.kind == BackendKind::Handler {
        return Err("handler runtimes need an in-process handler, use a local runtime".into());
    }

    let config = EngineConfig {
        store_path: Some(db),
        report_dir: args.report_dir.clone(),
        default_project: project,
        owner: args.owner.clone(),
        ..EngineConfig::default()
    };

    let mut orchestrator = Orchestrator::new(config.clone(), runtime, Backend::local())
        .with_store(Arc::new(store));
    if let Some(dir) = &config.report_dir {
        orchestrator = orchestrator.with_reporter(Arc::new(PipelineReport::new(dir.clone())));
    }
    if args.dry_build {
        orchestrator =
            orchestrator.with_builder(Arc::new(ScriptedBuilder::new(vec![BuildStatus::Succeeded])));
    }

    let outcome = loop {
        match orchestrator.run(task.clone()).await? {
            RunOutcome::NotReady(status) => {
                info!(status = %status, "Image not ready, checking again in {}s", args.poll_interval);
                tokio::time::sleep(Duration::from_secs(args.poll_interval)).await;
            }
            outcome => break outcome,
        }
    };

    match outcome {
        RunOutcome::Single(task) => {
            println!("Run completed:");
            print_task(&task);
        }
        RunOutcome::Batch(report) => {
            println!("Iterations:");
            print!("{}", report.summary.to_markdown());
            if let Some(err) = &report.criterion_error {
                println!("Selection skipped: {}", err);
            } else if let Some(best) = report.winner() {
                println!("Best iteration: {}", best.metadata.iteration);
            }
            println!();
            print_task(&report.parent);
            if report.parent.status.state == RunState::Error {
                let message = report
                    .parent
                    .status
                    .error
                    .unwrap_or_else(|| "sweep failed".to_string());
                return Err(message.into());
            }
        }
        RunOutcome::NotReady(_) => {}
    }

    Ok(())
}

async fn get_run(
    store: FileRunStore,
    project: String,
    uid: String,
    iteration: u32,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let key = RunKey::new(Uid::new(uid), project).with_iteration(iteration);
    let task = store.read_run(&key).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        print_task(&task);
    }

    Ok(())
}

async fn list_runs(
    store: FileRunStore,
    project: String,
    state: Option<String>,
    labels: Vec<String>,
    last: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut filter = RunFilter::default().with_project(project).with_last(last);
    if let Some(state) = state {
        let state = RunState::parse(&state).ok_or_else(|| format!("unknown state '{state}'"))?;
        filter = filter.with_state(state);
    }
    filter.labels = labels;

    let runs = store.list_runs(&filter).await?;

    println!("Runs ({}):", runs.len());
    println!("{:<36}  {:<5}  {:<10}  {:<16}  {}", "UID", "ITER", "STATE", "NAME", "STARTED");
    println!("{}", "-".repeat(90));

    for task in runs {
        let uid = task.metadata.uid.as_ref().map(Uid::as_str).unwrap_or("-");
        println!(
            "{:<36}  {:<5}  {:<10}  {:<16}  {}",
            uid,
            task.metadata.iteration,
            task.status.state.as_str(),
            task.metadata.name,
            format_timestamp(task.status.start_time)
        );
    }

    Ok(())
}

fn print_task(task: &TaskDescriptor) {
    let uid = task.metadata.uid.as_ref().map(Uid::as_str).unwrap_or("-");
    println!("  UID:        {}", uid);
    println!("  Name:       {}", task.metadata.name);
    println!("  Project:    {}", task.metadata.project);
    if task.metadata.iteration > 0 {
        println!("  Iteration:  {}", task.metadata.iteration);
    }
    println!("  State:      {}", task.status.state);
    println!("  Started:    {}", format_timestamp(task.status.start_time));

    if let Some(error) = &task.status.error {
        println!("  Error:      {}", error);
    }
    if !task.status.outputs.is_empty() {
        println!("  Outputs:");
        for (name, value) in &task.status.outputs {
            println!("    - {}: {}", name, value);
        }
    }
}

fn format_timestamp(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_overrides_apply_to_task_file() {
        let cli = Cli::parse_from([
            "sweeprun",
            "--project",
            "p1",
            "run",
            "--command",
            "python",
            "--arg",
            "train.py",
            "--param",
            "epochs=3",
            "--hyper",
            "lr=0.1,0.01",
            "--selector",
            "min.loss",
            "--mode",
            "args",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };

        let file = build_task_file(cli.project, &args).unwrap();
        assert_eq!(file.task.metadata.name, "run");
        assert_eq!(file.task.metadata.project, "p1");
        assert_eq!(file.task.spec.command, "python");
        assert_eq!(file.task.spec.args, ["train.py"]);
        assert_eq!(file.task.spec.parameters["epochs"], json!(3));
        assert_eq!(file.task.spec.hyperparams["lr"], json!([0.1, 0.01]));
        assert_eq!(file.task.spec.selector.as_deref(), Some("min.loss"));
        assert_eq!(file.runtime.mode, RunMode::Args);
    }

    #[test]
    fn test_bad_param_is_rejected() {
        let cli = Cli::parse_from(["sweeprun", "run", "--param", "oops"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(build_task_file(cli.project, &args).is_err());
    }
}
