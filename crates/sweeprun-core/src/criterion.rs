//! Selection criterion parsing: `"[op.]field"`.

use crate::CoreError;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Optimization direction of a selection criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOp {
    Max,
    Min,
}

impl FromStr for SelectOp {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            other => Err(CoreError::Configuration(format!(
                "unsupported selector op '{other}'"
            ))),
        }
    }
}

impl fmt::Display for SelectOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Max => f.write_str("max"),
            Self::Min => f.write_str("min"),
        }
    }
}

/// A parsed selection criterion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionCriterion {
    pub op: SelectOp,
    /// Output field compared across tasks.
    pub field: String,
}

impl SelectionCriterion {
    /// Parse a criterion. Empty or absent input means "no selection".
    ///
    /// The op is everything before the first dot; a bare field defaults to `max`.
    pub fn parse(raw: Option<&str>) -> Result<Option<Self>, CoreError> {
        let raw = match raw.map(str::trim) {
            None | Some("") => return Ok(None),
            Some(raw) => raw,
        };
        let (op, field) = match raw.split_once('.') {
            Some((op, field)) => (op.parse::<SelectOp>()?, field),
            None => (SelectOp::Max, raw),
        };
        if field.is_empty() {
            return Err(CoreError::Configuration(format!(
                "selector '{raw}' names no output field"
            )));
        }
        Ok(Some(Self {
            op,
            field: field.to_string(),
        }))
    }

    /// Whether `candidate` strictly improves on `best`.
    ///
    /// A number always beats a non-numeric best. Otherwise values that
    /// cannot be compared never improve.
    pub fn improves(&self, candidate: &Value, best: &Value) -> bool {
        match (candidate.is_number(), best.is_number()) {
            (true, false) => return true,
            (false, true) => return false,
            _ => {}
        }
        let ordering = match compare_values(candidate, best) {
            Some(ordering) => ordering,
            None => return false,
        };
        match self.op {
            SelectOp::Max => ordering == Ordering::Greater,
            SelectOp::Min => ordering == Ordering::Less,
        }
    }
}

impl fmt::Display for SelectionCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.op, self.field)
    }
}

/// Whether a value can take part in selection at all: numbers, strings and
/// booleans. Nulls, lists and artifact references are skipped.
pub fn is_comparable(value: &Value) -> bool {
    matches!(value, Value::Number(_) | Value::String(_) | Value::Bool(_))
}

/// Numbers compare numerically, strings lexically, nothing else compares.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
