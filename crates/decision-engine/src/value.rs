//! Typed values compared by conditions.
//!
//! Context fields and expected condition values are both reduced to this
//! closed set so operators can match exhaustively instead of inspecting
//! arbitrary JSON.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// A resolved or expected value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<String>),
}

/// Declared type of a condition's expected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    Auto,
    String,
    Number,
    Boolean,
    List,
}

impl Value {
    /// String representation used by the textual operators.
    ///
    /// Returns `None` for `Null`, which never matches textually.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(Cow::Borrowed(if *b { "true" } else { "false" })),
            Value::Number(n) => Some(Cow::Owned(format_number(*n))),
            Value::String(s) => Some(Cow::Borrowed(s.as_str())),
            Value::List(items) => Some(Cow::Owned(items.join(","))),
        }
    }

    /// Numeric interpretation; strings are parsed after trimming.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) if n.is_finite() => Some(*n),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    /// List interpretation. A scalar string is split on commas.
    pub fn as_list(&self) -> Option<Cow<'_, [String]>> {
        match self {
            Value::List(items) => Some(Cow::Borrowed(items.as_slice())),
            Value::String(s) => Some(Cow::Owned(
                s.split(',')
                    .map(|part| part.trim().to_string())
                    .filter(|part| !part.is_empty())
                    .collect(),
            )),
            Value::Null => None,
            other => other.as_text().map(|t| Cow::Owned(vec![t.into_owned()])),
        }
    }

    /// Whether a contextual factor counts as present and active.
    ///
    /// Active means boolean true, one of the strings "true"/"yes"/"1", or
    /// a positive number.
    pub fn is_active(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Number(n) => *n > 0.0,
            Value::String(s) => {
                matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1")
            }
            Value::Null | Value::List(_) => false,
        }
    }

    /// Coerces the value to the declared type. `None` if it cannot be.
    pub fn coerce(&self, value_type: ValueType) -> Option<Value> {
        match value_type {
            ValueType::Auto => Some(self.clone()),
            ValueType::String => self.as_text().map(|t| Value::String(t.into_owned())),
            ValueType::Number => self.as_f64().map(Value::Number),
            ValueType::Boolean => match self {
                Value::Bool(b) => Some(Value::Bool(*b)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "yes" | "1" => Some(Value::Bool(true)),
                    "false" | "no" | "0" => Some(Value::Bool(false)),
                    _ => None,
                },
                Value::Number(n) => Some(Value::Bool(*n != 0.0)),
                _ => None,
            },
            ValueType::List => self.as_list().map(|l| Value::List(l.into_owned())),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("null"),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| match item {
                        serde_json::Value::String(s) => s,
                        other => Value::from(other).to_string(),
                    })
                    .collect(),
            ),
            obj @ serde_json::Value::Object(_) => Value::String(obj.to_string()),
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(value: &serde_json::Value) -> Self {
        Value::from(value.clone())
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    serde_json::json!(n as i64)
                } else {
                    serde_json::Number::from_f64(n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            Value::String(s) => serde_json::Value::String(s),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::String).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::List(items)
    }
}

impl From<Vec<&str>> for Value {
    fn from(items: Vec<&str>) -> Self {
        Value::List(items.into_iter().map(str::to_string).collect())
    }
}
