use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static NUMERIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?\d+(\.\d+)?$").expect("numeric pattern is valid"));

/// Textual spellings that upstream feeds use for "no value".
const NULL_SPELLINGS: [&str; 2] = ["nan", "none"];

/// A scalar field value carried by a [`crate::record::Record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Converts an arbitrary JSON value into a scalar.
    ///
    /// Arrays and objects are flattened into their compact JSON text with
    /// sorted object keys, so nested upstream structures compare stably.
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Integer(i),
                None => FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => FieldValue::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => FieldValue::Text(value.to_string()),
        }
    }

    /// Coerces the value into the representation written to the store.
    ///
    /// Returns `None` when the value must be written as an absent attribute:
    /// nulls, blank or null-spelled strings, and non-finite floats.
    /// Numeric-looking strings become numbers and integral floats become
    /// integers.
    pub fn normalize_for_store(&self) -> Option<FieldValue> {
        match self {
            FieldValue::Null => None,
            FieldValue::Bool(b) => Some(FieldValue::Bool(*b)),
            FieldValue::Integer(i) => Some(FieldValue::Integer(*i)),
            FieldValue::Float(f) => normalize_float(*f),
            FieldValue::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() || NULL_SPELLINGS.contains(&trimmed.to_lowercase().as_str())
                {
                    return None;
                }
                if NUMERIC_RE.is_match(trimmed) {
                    if !trimmed.contains('.') {
                        if let Ok(i) = trimmed.parse::<i64>() {
                            return Some(FieldValue::Integer(i));
                        }
                    }
                    if let Ok(f) = trimmed.parse::<f64>() {
                        return normalize_float(f);
                    }
                }
                Some(FieldValue::Text(trimmed.to_string()))
            }
        }
    }

    /// The token the fingerprinter hashes for this value.
    ///
    /// Every "absent" spelling maps to the empty token and text has its
    /// internal whitespace collapsed.
    pub fn canonical_token(&self) -> String {
        match self.normalize_for_store() {
            None => String::new(),
            Some(FieldValue::Text(s)) => s.split_whitespace().collect::<Vec<_>>().join(" "),
            Some(other) => other.to_string(),
        }
    }
}

fn normalize_float(f: f64) -> Option<FieldValue> {
    if !f.is_finite() {
        return None;
    }
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        return Some(FieldValue::Integer(f as i64));
    }
    Some(FieldValue::Float(f))
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Integer(i) => write!(f, "{i}"),
            FieldValue::Float(x) => write!(f, "{x}"),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}
