//! Condition step evaluation
//!
//! A condition reads one field from a JSON document (the entity's current
//! state or the trigger payload) and compares it with the configured value.
//! Fields are JSONPath expressions; a bare dotted name is read as `$.name`.

use crate::workflow::types::{ConditionConfig, ConditionOperator};
use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("invalid field path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("field '{0}' is not present")]
    MissingField(String),

    #[error("cannot order {actual} against {expected}")]
    Incomparable { actual: String, expected: String },

    /// The document to evaluate against could not be obtained
    #[error("condition source unavailable: {0}")]
    SourceUnavailable(String),
}

/// JSONPath for a configured field
pub fn field_path(field: &str) -> String {
    let field = field.trim();
    if field.starts_with('$') {
        field.to_string()
    } else {
        format!("$.{}", field)
    }
}

/// First value at `field`, `None` when the path matches nothing
pub fn resolve_field<'a>(document: &'a Value, field: &str) -> Result<Option<&'a Value>, ConditionError> {
    let path = field_path(field);
    let matches = jsonpath_lib::select(document, &path).map_err(|e| ConditionError::InvalidPath {
        path: path.clone(),
        reason: format!("{:?}", e),
    })?;
    Ok(matches.into_iter().next())
}

/// Evaluate a condition against `document`
pub fn evaluate(config: &ConditionConfig, document: &Value) -> Result<bool, ConditionError> {
    let actual = resolve_field(document, &config.field)?;
    let expected = &config.value;

    let result = match config.operator {
        ConditionOperator::Equals => actual.is_some_and(|a| loose_eq(a, expected)),
        ConditionOperator::NotEquals => !actual.is_some_and(|a| loose_eq(a, expected)),
        ConditionOperator::Contains => actual.is_some_and(|a| contains(a, expected)),
        ConditionOperator::NotContains => !actual.is_some_and(|a| contains(a, expected)),
        ConditionOperator::GreaterThan | ConditionOperator::LessThan => {
            let actual = actual.ok_or_else(|| ConditionError::MissingField(config.field.clone()))?;
            let ordering = compare(actual, expected)?;
            if config.operator == ConditionOperator::GreaterThan {
                ordering == Ordering::Greater
            } else {
                ordering == Ordering::Less
            }
        }
        ConditionOperator::IsEmpty => actual.map_or(true, is_empty),
        ConditionOperator::IsNotEmpty => !actual.map_or(true, is_empty),
    };
    Ok(result)
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

pub(crate) fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_datetime(value: &Value) -> Option<DateTime<FixedOffset>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
}

/// Equality that ignores string case and compares numbers by value
pub(crate) fn loose_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            match (as_number(actual), as_number(expected)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        (Value::Bool(a), Value::String(b)) | (Value::String(b), Value::Bool(a)) => {
            b.trim().eq_ignore_ascii_case(if *a { "true" } else { "false" })
        }
        _ => actual == expected,
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(haystack) => match expected {
            Value::String(needle) => haystack.to_lowercase().contains(&needle.to_lowercase()),
            other => haystack.contains(&other.to_string()),
        },
        Value::Array(items) => items.iter().any(|item| loose_eq(item, expected)),
        Value::Object(map) => expected.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

fn compare(actual: &Value, expected: &Value) -> Result<Ordering, ConditionError> {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        if let Some(ordering) = a.partial_cmp(&b) {
            return Ok(ordering);
        }
    }
    if let (Some(a), Some(b)) = (as_datetime(actual), as_datetime(expected)) {
        return Ok(a.cmp(&b));
    }
    Err(ConditionError::Incomparable {
        actual: actual.to_string(),
        expected: expected.to_string(),
    })
}
