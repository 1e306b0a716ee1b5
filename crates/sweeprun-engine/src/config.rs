//! Engine configuration.

use std::path::PathBuf;

/// Engine configuration, passed explicitly at orchestrator construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Run store location, handed to backends as `SWEEPRUN_DBPATH`.
    pub store_path: Option<PathBuf>,

    /// Directory for pipeline report files and the iteration results table.
    pub report_dir: Option<PathBuf>,

    /// Project used when a task does not name one.
    pub default_project: String,

    /// Value of the `owner` label when the task has none.
    pub owner: Option<String>,

    /// File name of the iteration results table.
    pub results_artifact: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            report_dir: None,
            default_project: "default".to_string(),
            owner: None,
            results_artifact: "iteration_results.csv".to_string(),
        }
    }
}
