//! Result selection and aggregation over a finished sweep.

use serde_json::Value;
use sweeprun_core::{is_comparable, RunState, SelectionCriterion, TaskDescriptor};

use crate::report::{markdown_table, ReportError};

/// Outcome of electing the best iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// No criterion was given.
    Absent,
    /// A criterion was given but no task qualified.
    NoWinner,
    /// The elected iteration and its position in the result set.
    Winner { iteration: u32, index: usize },
}

impl Selection {
    /// Elected iteration, 0 when nothing was elected.
    pub fn iteration(&self) -> u32 {
        match self {
            Self::Winner { iteration, .. } => *iteration,
            _ => 0,
        }
    }

    pub fn is_winner(&self) -> bool {
        matches!(self, Self::Winner { .. })
    }
}

/// Elect the best task by `criterion`.
///
/// Tasks are scanned by iteration. Only completed tasks carrying a scalar
/// value for the field are candidates, and numbers outrank other scalars; the best moves only on strict improvement, so ties keep
/// the earliest iteration.
pub fn select(results: &[TaskDescriptor], criterion: Option<&SelectionCriterion>) -> Selection {
    let Some(criterion) = criterion else {
        return Selection::Absent;
    };

    let mut order: Vec<usize> = (0..results.len()).collect();
    order.sort_by_key(|&i| results[i].metadata.iteration);

    let mut best: Option<(usize, &Value)> = None;
    for index in order {
        let task = &results[index];
        if task.status.state != RunState::Completed {
            continue;
        }
        let value = match task.output(&criterion.field) {
            Some(value) if is_comparable(value) => value,
            _ => continue,
        };
        match best {
            None => best = Some((index, value)),
            Some((_, current)) if criterion.improves(value, current) => {
                best = Some((index, value))
            }
            Some(_) => {}
        }
    }

    match best {
        Some((index, _)) => Selection::Winner {
            iteration: results[index].metadata.iteration,
            index,
        },
        None => Selection::NoWinner,
    }
}

/// Overall state of a batch and, on failure, a message counting failed tasks.
pub fn aggregate_state(results: &[TaskDescriptor]) -> (RunState, Option<String>) {
    let failed = results
        .iter()
        .filter(|t| t.status.state == RunState::Error)
        .count();
    if failed == 0 {
        (RunState::Completed, None)
    } else {
        (
            RunState::Error,
            Some(format!(
                "{failed} of {} tasks failed, check the iteration results",
                results.len()
            )),
        )
    }
}

/// One row per task: iteration, state, parameters, outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryTable {
    header: Vec<String>,
    rows: Vec<Vec<Value>>,
}

/// Build the summary table of a batch, rows sorted by iteration.
///
/// Parameter and output columns are the union over all tasks, in order of
/// first appearance.
pub fn summarize(results: &[TaskDescriptor]) -> SummaryTable {
    let mut params: Vec<&str> = Vec::new();
    let mut outputs: Vec<&str> = Vec::new();
    for task in results {
        for name in task.spec.parameters.keys() {
            if !params.contains(&name.as_str()) {
                params.push(name);
            }
        }
        for name in task.status.outputs.keys() {
            if !outputs.contains(&name.as_str()) {
                outputs.push(name);
            }
        }
    }

    let mut header = vec!["iter".to_string(), "state".to_string()];
    header.extend(params.iter().map(|p| format!("param.{p}")));
    header.extend(outputs.iter().map(|o| format!("output.{o}")));

    let mut sorted: Vec<&TaskDescriptor> = results.iter().collect();
    sorted.sort_by_key(|t| t.metadata.iteration);

    let rows = sorted
        .into_iter()
        .map(|task| {
            let mut row = Vec::with_capacity(header.len());
            row.push(Value::from(task.metadata.iteration));
            row.push(Value::from(task.status.state.as_str()));
            for p in &params {
                row.push(task.spec.parameters.get(*p).cloned().unwrap_or(Value::Null));
            }
            for o in &outputs {
                row.push(task.status.outputs.get(*o).cloned().unwrap_or(Value::Null));
            }
            row
        })
        .collect();

    SummaryTable { header, rows }
}

impl SummaryTable {
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Data rows, without the header.
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Header row followed by data rows, the form stored on the parent task.
    pub fn to_rows(&self) -> Vec<Vec<Value>> {
        let mut out = Vec::with_capacity(self.rows.len() + 1);
        out.push(self.header.iter().map(|h| Value::from(h.as_str())).collect());
        out.extend(self.rows.iter().cloned());
        out
    }

    pub fn to_markdown(&self) -> String {
        markdown_table(&self.to_rows())
    }

    pub fn to_csv(&self) -> Result<String, ReportError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.header)?;
        for row in &self.rows {
            writer.write_record(row.iter().map(crate::report::cell_text))?;
        }
        let bytes = writer.into_inner().map_err(|e| ReportError::Io(e.into_error()))?;
        String::from_utf8(bytes)
            .map_err(|e| ReportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(iteration: u32, accuracy: Option<f64>) -> TaskDescriptor {
        let mut t = TaskDescriptor::new("train").with_param("lr", 0.1 * iteration as f64);
        t.metadata.iteration = iteration;
        match accuracy {
            Some(a) => {
                t.status.state = RunState::Completed;
                t.status.outputs.insert("accuracy".to_string(), json!(a));
            }
            None => {
                t.status.state = RunState::Error;
                t.status.error = Some("boom".to_string());
            }
        }
        t
    }

    fn criterion(raw: &str) -> SelectionCriterion {
        SelectionCriterion::parse(Some(raw)).unwrap().unwrap()
    }

    #[test]
    fn test_max_ties_keep_earliest() {
        let results = vec![task(1, Some(0.7)), task(2, Some(0.9)), task(3, Some(0.9)), task(4, None)];
        let selection = select(&results, Some(&criterion("max.accuracy")));
        assert_eq!(selection, Selection::Winner { iteration: 2, index: 1 });
    }

    #[test]
    fn test_min_and_completion_order() {
        let results = vec![task(3, Some(0.2)), task(1, Some(0.5)), task(2, Some(0.2))];
        let selection = select(&results, Some(&criterion("min.accuracy")));
        assert_eq!(selection, Selection::Winner { iteration: 2, index: 2 });
    }

    #[test]
    fn test_reference_outputs_are_skipped() {
        let mut reference = task(1, Some(0.0));
        reference
            .status
            .outputs
            .insert("accuracy".to_string(), json!({"path": "s3://acc.json"}));
        let mut text = task(2, Some(0.0));
        text.status.outputs.insert("accuracy".to_string(), json!("n/a"));
        let results = vec![reference, text, task(3, Some(0.99)), task(4, Some(0.5))];

        let selection = select(&results, Some(&criterion("max.accuracy")));
        assert_eq!(selection, Selection::Winner { iteration: 3, index: 2 });

        let selection = select(&results[..1], Some(&criterion("max.accuracy")));
        assert_eq!(selection, Selection::NoWinner);
    }

    #[test]
    fn test_no_criterion_is_absent() {
        let results = vec![task(1, Some(0.7)), task(2, None)];
        assert_eq!(select(&results, None), Selection::Absent);
        assert_eq!(select(&[], None), Selection::Absent);
        assert_eq!(Selection::Absent.iteration(), 0);
    }

    #[test]
    fn test_all_skipped_is_no_winner() {
        let results = vec![task(1, None), task(2, None)];
        assert_eq!(select(&results, Some(&criterion("accuracy"))), Selection::NoWinner);

        let results = vec![task(1, Some(0.5))];
        assert_eq!(select(&results, Some(&criterion("max.loss"))), Selection::NoWinner);
    }

    #[test]
    fn test_aggregate_state() {
        let ok = vec![task(1, Some(0.1)), task(2, Some(0.2))];
        assert_eq!(aggregate_state(&ok), (RunState::Completed, None));

        let mixed = vec![task(1, None), task(2, Some(0.2)), task(3, None)];
        let (state, message) = aggregate_state(&mixed);
        assert_eq!(state, RunState::Error);
        assert!(message.unwrap().starts_with("2 of 3 tasks failed"));
    }

    #[test]
    fn test_summary_sorted_by_iteration() {
        let results = vec![task(2, Some(0.9)), task(1, None)];
        let table = summarize(&results);
        assert_eq!(table.header(), ["iter", "state", "param.lr", "output.accuracy"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0][0], json!(1));
        assert_eq!(table.rows()[0][1], json!("error"));
        assert_eq!(table.rows()[0][3], Value::Null);
        assert_eq!(table.rows()[1][3], json!(0.9));
    }

    #[test]
    fn test_summary_renderings() {
        let table = summarize(&[task(1, Some(0.5))]);
        assert_eq!(table.to_rows().len(), 2);

        let csv = table.to_csv().unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("iter,state,param.lr,output.accuracy"));
        assert_eq!(lines.next(), Some("1,completed,0.1,0.5"));

        let md = table.to_markdown();
        assert!(md.starts_with("| iter | state | param.lr | output.accuracy |"));
    }
}
