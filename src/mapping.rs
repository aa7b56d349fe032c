//! Typed field mapping from source rows to Salesforce records.
//!
//! A [`FieldMap`] renames fields and applies a fixed set of value
//! transforms. Fields with no mapping are dropped. Transforms are data, so a
//! mapping can be loaded from JSON or TOML and never evaluates text.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::salesforce::Record;

// ─────────────────────────────────────────────────────────────────────────────
// Transform
// ─────────────────────────────────────────────────────────────────────────────

/// A value conversion applied while mapping one field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    #[default]
    Identity,
    Trim,
    Uppercase,
    Lowercase,
    /// `true/yes/y/1` and `false/no/n/0/""`, case-insensitive; anything else is null.
    ToBoolean,
    /// Integer if it parses as one, else float; unparseable text is null.
    ToNumber,
    ToText,
    /// Keeps the `YYYY-MM-DD` prefix of a date or datetime; non-dates are null.
    DateOnly,
    /// Replaces null or blank text with the given value.
    DefaultIfEmpty(Value),
    /// Keeps at most this many characters.
    Truncate(usize),
    /// Applies each transform in order.
    Chain(Vec<Transform>),
}

impl Transform {
    pub fn apply(&self, value: &Value) -> Value {
        match self {
            Transform::Identity => value.clone(),
            Transform::Trim => map_str(value, |s| s.trim().to_string()),
            Transform::Uppercase => map_str(value, str::to_uppercase),
            Transform::Lowercase => map_str(value, str::to_lowercase),
            Transform::ToBoolean => to_boolean(value),
            Transform::ToNumber => to_number(value),
            Transform::ToText => match value {
                Value::Null | Value::String(_) => value.clone(),
                Value::Bool(b) => Value::String(b.to_string()),
                Value::Number(n) => Value::String(n.to_string()),
                other => Value::String(other.to_string()),
            },
            Transform::DateOnly => match value {
                Value::String(s) => date_prefix(s)
                    .map(|d| Value::String(d.to_string()))
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            },
            Transform::DefaultIfEmpty(default) => match value {
                Value::Null => default.clone(),
                Value::String(s) if s.trim().is_empty() => default.clone(),
                other => other.clone(),
            },
            Transform::Truncate(max) => map_str(value, |s| s.chars().take(*max).collect()),
            Transform::Chain(steps) => steps
                .iter()
                .fold(value.clone(), |acc, step| step.apply(&acc)),
        }
    }
}

fn map_str(value: &Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        other => other.clone(),
    }
}

fn to_boolean(value: &Value) -> Value {
    match value {
        Value::Bool(_) => value.clone(),
        Value::Number(n) => Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Value::Bool(true),
            "false" | "no" | "n" | "0" | "" => Value::Bool(false),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn to_number(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::Bool(b) => Value::Number(Number::from(u8::from(*b))),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Value::Number(Number::from(i))
            } else {
                s.parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        _ => Value::Null,
    }
}

/// Returns the leading `YYYY-MM-DD` when it is a plausible calendar date.
fn date_prefix(s: &str) -> Option<&str> {
    let candidate = s.trim().get(..10)?;
    let bytes = candidate.as_bytes();
    let digits_at = |range: std::ops::Range<usize>| bytes[range].iter().all(u8::is_ascii_digit);
    let shaped = digits_at(0..4)
        && bytes[4] == b'-'
        && digits_at(5..7)
        && bytes[7] == b'-'
        && digits_at(8..10);
    if !shaped {
        return None;
    }

    let month: u8 = candidate[5..7].parse().ok()?;
    let day: u8 = candidate[8..10].parse().ok()?;
    if (1..=12).contains(&month) && (1..=31).contains(&day) {
        Some(candidate)
    } else {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FieldMap
// ─────────────────────────────────────────────────────────────────────────────

/// Maps one source field to one Salesforce field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub transform: Transform,
}

impl FieldMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            transform: Transform::Identity,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }
}

/// Ordered set of field mappings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMap {
    pub mappings: Vec<FieldMapping>,
}

impl FieldMap {
    pub fn new(mappings: Vec<FieldMapping>) -> Self {
        Self { mappings }
    }

    /// Builds the Salesforce record for one source row.
    ///
    /// Only fields present in `row` are mapped; a source may feed several
    /// targets. A later mapping to the same target wins.
    pub fn apply(&self, row: &Record) -> Record {
        let mut out = Record::new();
        for mapping in &self.mappings {
            if let Some(value) = row.get(&mapping.source) {
                out.insert(mapping.target.clone(), mapping.transform.apply(value));
            }
        }
        out
    }

    pub fn apply_all(&self, rows: &[Record]) -> Vec<Record> {
        rows.iter().map(|row| self.apply(row)).collect()
    }
}
