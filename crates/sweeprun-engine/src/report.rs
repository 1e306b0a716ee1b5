//! Reporting sink for hosting pipelines.
//!
//! Writes the metrics and UI metadata files a pipeline host picks up after
//! a step. Reporting is best-effort: callers log and drop any error.

use std::fmt::Write;
use std::path::PathBuf;

use serde_json::{json, Value};
use sweeprun_core::TaskDescriptor;
use thiserror::Error;

pub const METRICS_FILE: &str = "mlpipeline-metrics.json";
pub const UI_METADATA_FILE: &str = "mlpipeline-ui-metadata.json";

/// Errors raised while writing a report.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Report I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Report JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Report YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Report CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Receives terminal task or batch payloads.
pub trait ReportSink: Send + Sync {
    fn write_report(&self, payload: &TaskDescriptor) -> Result<(), ReportError>;
}

/// Writes pipeline metrics and a markdown run report into a directory.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    dir: PathBuf,
}

impl PipelineReport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Numeric outputs as pipeline metrics.
    pub fn metrics(payload: &TaskDescriptor) -> Value {
        let metrics: Vec<Value> = payload
            .status
            .outputs
            .iter()
            .filter(|(_, v)| v.is_number())
            .map(|(k, v)| json!({"name": k, "numberValue": v}))
            .collect();
        json!({ "metrics": metrics })
    }

    /// Markdown run report: iteration table (if any) and the metadata as YAML.
    pub fn render_markdown(payload: &TaskDescriptor) -> Result<String, ReportError> {
        let mut text = String::from("# Run Report\n");
        let mut rest = payload.clone();
        if !payload.status.iterations.is_empty() {
            text.push_str("## Iterations\n");
            text.push_str(&markdown_table(&payload.status.iterations));
            rest.status.iterations.clear();
        }
        text.push_str("## Metadata\n```yaml\n");
        text.push_str(&serde_yaml::to_string(&rest)?);
        text.push_str("```\n");
        Ok(text)
    }
}

impl ReportSink for PipelineReport {
    fn write_report(&self, payload: &TaskDescriptor) -> Result<(), ReportError> {
        std::fs::create_dir_all(&self.dir)?;

        let metrics = Self::metrics(payload);
        std::fs::write(
            self.dir.join(METRICS_FILE),
            serde_json::to_vec(&metrics)?,
        )?;

        let metadata = json!({
            "outputs": [{
                "type": "markdown",
                "storage": "inline",
                "source": Self::render_markdown(payload)?,
            }]
        });
        std::fs::write(
            self.dir.join(UI_METADATA_FILE),
            serde_json::to_vec(&metadata)?,
        )?;
        Ok(())
    }
}

/// Render a header row plus data rows as a markdown table.
pub(crate) fn markdown_table(rows: &[Vec<Value>]) -> String {
    let Some((header, body)) = rows.split_first() else {
        return String::new();
    };
    let mut out = String::new();
    let cells = |row: &[Value]| {
        row.iter()
            .map(|v| cell_text(v).replace('|', "\\|"))
            .collect::<Vec<_>>()
            .join(" | ")
    };
    writeln!(out, "| {} |", cells(header.as_slice())).ok();
    writeln!(out, "|{}", " --- |".repeat(header.len())).ok();
    for row in body {
        writeln!(out, "| {} |", cells(row.as_slice())).ok();
    }
    out
}

/// Plain text of a table cell (strings unquoted, null empty).
pub(crate) fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
