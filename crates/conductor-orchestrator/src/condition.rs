//! Typed predicates used by decision steps and step guards.
//!
//! A [`Condition`] is evaluated against the run context: a JSON object that
//! holds the workflow inputs and, under each finished step's id, that
//! step's output. Paths are dot-separated (`fetch.status`, `items.0.id`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Why a condition could not be evaluated.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConditionError {
    #[error("path '{0}' not found in context")]
    MissingPath(String),
    #[error("value at '{path}' is not {expected}")]
    TypeMismatch { path: String, expected: &'static str },
}

/// Predicate over the run context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Always,
    Never,
    /// The path resolves to a non-null value.
    Exists { path: String },
    /// The path resolves to a truthy value; a missing path is false.
    Truthy { path: String },
    Equals { path: String, value: Value },
    NotEquals { path: String, value: Value },
    GreaterThan { path: String, value: Value },
    LessThan { path: String, value: Value },
    /// Substring, array element or object key.
    Contains { path: String, value: Value },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    pub fn equals(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Equals {
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn greater_than(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::GreaterThan {
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn truthy(path: impl Into<String>) -> Self {
        Condition::Truthy { path: path.into() }
    }

    pub fn negate(self) -> Self {
        Condition::Not {
            condition: Box::new(self),
        }
    }

    /// Evaluate against `context`.
    pub fn evaluate(&self, context: &Value) -> Result<bool, ConditionError> {
        match self {
            Condition::Always => Ok(true),
            Condition::Never => Ok(false),
            Condition::Exists { path } => Ok(lookup(context, path).is_some_and(|v| !v.is_null())),
            Condition::Truthy { path } => Ok(lookup(context, path).is_some_and(truthy)),
            Condition::Equals { path, value } => Ok(loose_eq(require(context, path)?, value)),
            Condition::NotEquals { path, value } => Ok(!loose_eq(require(context, path)?, value)),
            Condition::GreaterThan { path, value } => {
                compare(require(context, path)?, value, path).map(|o| o.is_gt())
            }
            Condition::LessThan { path, value } => {
                compare(require(context, path)?, value, path).map(|o| o.is_lt())
            }
            Condition::Contains { path, value } => contains(require(context, path)?, value, path),
            Condition::All { conditions } => {
                for c in conditions {
                    if !c.evaluate(context)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Any { conditions } => {
                for c in conditions {
                    if c.evaluate(context)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not { condition } => condition.evaluate(context).map(|b| !b),
        }
    }

    /// Every path the condition reads, depth first.
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Always | Condition::Never => {}
            Condition::Exists { path }
            | Condition::Truthy { path }
            | Condition::Equals { path, .. }
            | Condition::NotEquals { path, .. }
            | Condition::GreaterThan { path, .. }
            | Condition::LessThan { path, .. }
            | Condition::Contains { path, .. } => out.push(path),
            Condition::All { conditions } | Condition::Any { conditions } => {
                for c in conditions {
                    c.collect_paths(out);
                }
            }
            Condition::Not { condition } => condition.collect_paths(out),
        }
    }
}

/// Resolve a dot-separated path. Numeric segments index arrays.
pub fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(context, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn require<'a>(context: &'a Value, path: &str) -> Result<&'a Value, ConditionError> {
    lookup(context, path).ok_or_else(|| ConditionError::MissingPath(path.to_string()))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Equality that treats `1` and `1.0` as the same number.
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) if left.is_number() && right.is_number() => a == b,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value, path: &str) -> Result<std::cmp::Ordering, ConditionError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b))
            .ok_or_else(|| mismatch(path, "a comparable number")),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(mismatch(path, "comparable with the given value")),
    }
}

fn contains(haystack: &Value, needle: &Value, path: &str) -> Result<bool, ConditionError> {
    match (haystack, needle) {
        (Value::String(s), Value::String(sub)) => Ok(s.contains(sub.as_str())),
        (Value::Array(items), _) => Ok(items.iter().any(|item| loose_eq(item, needle))),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        _ => Err(mismatch(path, "a string, array or object")),
    }
}

fn mismatch(path: &str, expected: &'static str) -> ConditionError {
    ConditionError::TypeMismatch {
        path: path.to_string(),
        expected,
    }
}
