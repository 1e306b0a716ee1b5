//! Task generators: expand one sweep task into its iterations.
//!
//! Generators validate everything up front and then yield lazily, so a
//! malformed sweep fails before the first task exists. Iterations are
//! numbered from 1 in generation order.

use std::io::Read;
use std::path::Path;

use serde_json::{Map, Number, Value};
use sweeprun_core::{TaskDescriptor, TaskStatus};

use crate::error::EngineError;

/// Lazy, finite sequence of sweep member tasks.
#[derive(Debug)]
pub enum TaskGenerator {
    /// Cartesian product of hyperparameter lists.
    Grid(GridGenerator),
    /// One task per row of a parameter table.
    Table(TableGenerator),
}

impl TaskGenerator {
    /// Build the generator for a task, or `None` for a standalone task.
    ///
    /// Hyperparameters take precedence over a parameter table.
    pub fn for_task(task: &TaskDescriptor) -> Result<Option<Self>, EngineError> {
        if !task.spec.hyperparams.is_empty() {
            return Ok(Some(Self::Grid(GridGenerator::new(task)?)));
        }
        if let Some(path) = &task.spec.param_file {
            return Ok(Some(Self::Table(TableGenerator::from_path(task, Path::new(path))?)));
        }
        Ok(None)
    }
}

impl Iterator for TaskGenerator {
    type Item = TaskDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Grid(g) => g.next(),
            Self::Table(t) => t.next(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            Self::Grid(g) => g.size_hint(),
            Self::Table(t) => t.size_hint(),
        }
    }
}

/// Derive a sweep member from the parent task.
///
/// The child keeps the parent's identity and non-swept parameters, gets
/// the swept values on top, a fresh status, and no sweep config of its own.
fn child_task(base: &TaskDescriptor, iteration: u32, overlay: Map<String, Value>) -> TaskDescriptor {
    let mut task = base.clone();
    task.metadata.iteration = iteration;
    task.spec.parameters.extend(overlay);
    task.spec.hyperparams.clear();
    task.spec.param_file = None;
    task.status = TaskStatus::default();
    task
}

/// Cartesian grid over hyperparameter lists, first parameter varying slowest.
#[derive(Debug)]
pub struct GridGenerator {
    base: TaskDescriptor,
    axes: Vec<(String, Vec<Value>)>,
    cursor: Vec<usize>,
    produced: usize,
    total: usize,
}

impl GridGenerator {
    /// Validate the sweep of `task` and prepare the grid.
    pub fn new(task: &TaskDescriptor) -> Result<Self, EngineError> {
        let mut axes = Vec::with_capacity(task.spec.hyperparams.len());
        let mut total: usize = 1;
        for (name, values) in &task.spec.hyperparams {
            let values = match values {
                Value::Array(values) if !values.is_empty() => values.clone(),
                _ => {
                    return Err(EngineError::Configuration(format!(
                        "hyperparam '{name}' must be a non-empty list of values"
                    )))
                }
            };
            total = total.checked_mul(values.len()).ok_or_else(|| {
                EngineError::Configuration("hyperparam grid is too large".to_string())
            })?;
            axes.push((name.clone(), values));
        }
        if axes.is_empty() {
            return Err(EngineError::Configuration(
                "hyperparams must name at least one parameter".to_string(),
            ));
        }
        if u32::try_from(total).is_err() {
            return Err(EngineError::Configuration(
                "hyperparam grid is too large".to_string(),
            ));
        }

        let mut base = task.clone();
        base.spec.hyperparams.clear();
        Ok(Self {
            base,
            cursor: vec![0; axes.len()],
            axes,
            produced: 0,
            total,
        })
    }

    /// Number of tasks in the grid.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Move to the next grid point, last axis fastest.
    fn advance(&mut self) {
        for (i, (_, values)) in self.axes.iter().enumerate().rev() {
            self.cursor[i] += 1;
            if self.cursor[i] < values.len() {
                return;
            }
            self.cursor[i] = 0;
        }
    }
}

impl Iterator for GridGenerator {
    type Item = TaskDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.produced >= self.total {
            return None;
        }
        let overlay: Map<String, Value> = self
            .axes
            .iter()
            .zip(&self.cursor)
            .map(|((name, values), &i)| (name.clone(), values[i].clone()))
            .collect();
        self.produced += 1;
        self.advance();
        // total fits in u32, checked in new()
        Some(child_task(&self.base, self.produced as u32, overlay))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.produced;
        (left, Some(left))
    }
}

/// One task per row of a CSV parameter table with a header row.
#[derive(Debug)]
pub struct TableGenerator {
    base: TaskDescriptor,
    header: Vec<String>,
    rows: std::vec::IntoIter<Vec<String>>,
    next_iteration: u32,
}

impl TableGenerator {
    /// Read the parameter table at `path`.
    pub fn from_path(task: &TaskDescriptor, path: &Path) -> Result<Self, EngineError> {
        let file = std::fs::File::open(path).map_err(|e| {
            EngineError::Configuration(format!(
                "failed to read param file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_reader(task, file)
    }

    /// Read a parameter table from any reader.
    pub fn from_reader<R: Read>(task: &TaskDescriptor, reader: R) -> Result<Self, EngineError> {
        let bad_table = |e: csv::Error| EngineError::Configuration(format!("bad param table: {e}"));
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let header: Vec<String> = csv_reader
            .headers()
            .map_err(bad_table)?
            .iter()
            .map(str::to_string)
            .collect();
        if header.iter().any(String::is_empty) {
            return Err(EngineError::Configuration(
                "param table header has an empty column name".to_string(),
            ));
        }

        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record.map_err(bad_table)?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        if u32::try_from(rows.len()).is_err() {
            return Err(EngineError::Configuration("param table is too large".to_string()));
        }

        let mut base = task.clone();
        base.spec.param_file = None;
        Ok(Self {
            base,
            header,
            rows: rows.into_iter(),
            next_iteration: 1,
        })
    }
}

impl Iterator for TableGenerator {
    type Item = TaskDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.rows.next()?;
        let overlay: Map<String, Value> = self
            .header
            .iter()
            .zip(&row)
            .filter_map(|(name, cell)| coerce_cell(cell).map(|v| (name.clone(), v)))
            .collect();
        let iteration = self.next_iteration;
        self.next_iteration += 1;
        Some(child_task(&self.base, iteration, overlay))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

/// Type a table cell: bool, integer, float, else string. Empty cells are
/// skipped so the parent's value stays.
fn coerce_cell(cell: &str) -> Option<Value> {
    if cell.is_empty() {
        return None;
    }
    if cell.eq_ignore_ascii_case("true") {
        return Some(Value::Bool(true));
    }
    if cell.eq_ignore_ascii_case("false") {
        return Some(Value::Bool(false));
    }
    if let Ok(i) = cell.parse::<i64>() {
        return Some(Value::from(i));
    }
    if let Some(n) = cell.parse::<f64>().ok().and_then(Number::from_f64) {
        return Some(Value::Number(n));
    }
    Some(Value::String(cell.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sweeprun_core::{RunState, Uid};

    fn sweep() -> TaskDescriptor {
        TaskDescriptor::new("train")
            .with_project("p1")
            .with_uid(Uid::new("u1"))
            .with_param("epochs", 10)
            .with_hyper_param("lr", vec![json!(0.1), json!(0.01)])
            .with_hyper_param("depth", vec![json!(2), json!(4), json!(8)])
    }

    #[test]
    fn test_grid_count_and_order() {
        let tasks: Vec<_> = TaskGenerator::for_task(&sweep()).unwrap().unwrap().collect();
        assert_eq!(tasks.len(), 6);

        let iterations: Vec<u32> = tasks.iter().map(|t| t.metadata.iteration).collect();
        assert_eq!(iterations, vec![1, 2, 3, 4, 5, 6]);

        let points: Vec<(Value, Value)> = tasks
            .iter()
            .map(|t| (t.spec.parameters["lr"].clone(), t.spec.parameters["depth"].clone()))
            .collect();
        assert_eq!(
            points,
            vec![
                (json!(0.1), json!(2)),
                (json!(0.1), json!(4)),
                (json!(0.1), json!(8)),
                (json!(0.01), json!(2)),
                (json!(0.01), json!(4)),
                (json!(0.01), json!(8)),
            ]
        );
    }

    #[test]
    fn test_grid_is_deterministic() {
        let a: Vec<_> = GridGenerator::new(&sweep()).unwrap().collect();
        let b: Vec<_> = GridGenerator::new(&sweep()).unwrap().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_children_inherit_identity() {
        for task in GridGenerator::new(&sweep()).unwrap() {
            assert_eq!(task.metadata.uid, Some(Uid::new("u1")));
            assert_eq!(task.metadata.project, "p1");
            assert_eq!(task.spec.parameters["epochs"], json!(10));
            assert_eq!(task.status.state, RunState::Submitted);
            assert!(!task.is_sweep());
        }
    }

    #[test]
    fn test_grid_size_hint() {
        let mut grid = GridGenerator::new(&sweep()).unwrap();
        assert_eq!(grid.total(), 6);
        grid.next();
        assert_eq!(grid.size_hint(), (5, Some(5)));
    }

    #[test]
    fn test_malformed_sweep_fails_fast() {
        let not_a_list = TaskDescriptor::new("t").with_param("x", 1);
        let mut task = not_a_list.clone();
        task.spec.hyperparams.insert("p".to_string(), json!(3));
        assert!(TaskGenerator::for_task(&task).unwrap_err().is_configuration());

        let empty = TaskDescriptor::new("t").with_hyper_param("p", vec![]);
        assert!(GridGenerator::new(&empty).unwrap_err().is_configuration());

        assert!(TaskGenerator::for_task(&not_a_list).unwrap().is_none());
    }

    #[test]
    fn test_table_rows_with_coercion() {
        let csv = "p1,p2,flag\n1,abc,true\n2.5,,FALSE\n";
        let base = TaskDescriptor::new("t").with_param("p2", "default");
        let tasks: Vec<_> = TableGenerator::from_reader(&base, csv.as_bytes())
            .unwrap()
            .collect();
        assert_eq!(tasks.len(), 2);

        assert_eq!(tasks[0].metadata.iteration, 1);
        assert_eq!(tasks[0].spec.parameters["p1"], json!(1));
        assert_eq!(tasks[0].spec.parameters["p2"], json!("abc"));
        assert_eq!(tasks[0].spec.parameters["flag"], json!(true));

        assert_eq!(tasks[1].metadata.iteration, 2);
        assert_eq!(tasks[1].spec.parameters["p1"], json!(2.5));
        assert_eq!(tasks[1].spec.parameters["p2"], json!("default"));
        assert_eq!(tasks[1].spec.parameters["flag"], json!(false));
    }

    #[test]
    fn test_table_from_file_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.csv");
        std::fs::write(&path, "alpha\n0.1\n0.2\n0.3\n").unwrap();

        let task = TaskDescriptor::new("t").with_param_file(path.display().to_string());
        let generator = TaskGenerator::for_task(&task).unwrap().unwrap();
        assert_eq!(generator.count(), 3);

        let missing = TaskDescriptor::new("t").with_param_file("/nonexistent/params.csv");
        assert!(TaskGenerator::for_task(&missing).unwrap_err().is_configuration());
    }

    #[test]
    fn test_table_ragged_row_fails_fast() {
        let csv = "a,b\n1,2\n3\n";
        let err = TableGenerator::from_reader(&TaskDescriptor::new("t"), csv.as_bytes()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_table_without_rows_is_empty() {
        let generator = TableGenerator::from_reader(&TaskDescriptor::new("t"), "a,b\n".as_bytes()).unwrap();
        assert_eq!(generator.count(), 0);
    }

    #[test]
    fn test_coerce_cell() {
        assert_eq!(coerce_cell("42"), Some(json!(42)));
        assert_eq!(coerce_cell("-1.5"), Some(json!(-1.5)));
        assert_eq!(coerce_cell("True"), Some(json!(true)));
        assert_eq!(coerce_cell("rbf"), Some(json!("rbf")));
        assert_eq!(coerce_cell("NaN"), Some(json!("NaN")));
        assert_eq!(coerce_cell(""), None);
    }
}
