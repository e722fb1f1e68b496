//! Closed column-type system: classifies JSON payload values into one of the
//! eight OLAP-representable types, coerces loosely-typed values into them,
//! and parses an OLAP column declaration back into the same closed set.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static DATETIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}$").unwrap());
static LOW_CARDINALITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^LowCardinality\((.+)\)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Int,
    Float,
    String,
    DateTime,
    IntArray,
    FloatArray,
    StringArray,
    DateTimeArray,
}

impl ColumnType {
    /// The fixed OLAP column type this classification maps to on write.
    /// `Int` is widened to `Float64` to avoid range-truncation surprises
    /// when an attribute's observed values later exceed an i64 that was
    /// inferred too narrowly from the first sample.
    pub fn olap_type(self) -> &'static str {
        match self {
            ColumnType::Int => "Float64",
            ColumnType::Float => "Float64",
            ColumnType::String => "String",
            ColumnType::DateTime => "Nullable(DateTime)",
            ColumnType::IntArray => "Array(Int64)",
            ColumnType::FloatArray => "Array(Float64)",
            ColumnType::StringArray => "Array(String)",
            ColumnType::DateTimeArray => "Array(DateTime)",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("value does not match target column type")]
pub struct MismatchError;

/// Classifies a JSON value into the closed type set.
pub fn classify(v: &Value) -> ColumnType {
    match v {
        Value::Number(n) => {
            if n.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false) {
                ColumnType::Int
            } else {
                ColumnType::Float
            }
        }
        Value::String(s) => {
            if DATETIME_RE.is_match(s) {
                ColumnType::DateTime
            } else {
                ColumnType::String
            }
        }
        Value::Array(items) => classify_array(items),
        _ => ColumnType::String,
    }
}

fn classify_array(items: &[Value]) -> ColumnType {
    if items.is_empty() {
        return ColumnType::StringArray;
    }
    let mut counts = [0usize; 4]; // String, Float, Int, DateTime, in tie-break priority order
    for item in items {
        match classify(item) {
            ColumnType::String => counts[0] += 1,
            ColumnType::Float => counts[1] += 1,
            ColumnType::Int => counts[2] += 1,
            ColumnType::DateTime => counts[3] += 1,
            _ => counts[0] += 1, // nested arrays collapse to string, there is no array-of-array type
        }
    }
    let max = *counts.iter().max().unwrap();
    // Ties resolve String > Float > Int > DateTime, which is exactly the
    // iteration order above, so the first index hitting `max` wins.
    match counts.iter().position(|&c| c == max).unwrap() {
        0 => ColumnType::StringArray,
        1 => ColumnType::FloatArray,
        2 => ColumnType::IntArray,
        _ => ColumnType::DateTimeArray,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Int(i64),
    Float(f64),
    String(String),
    DateTime(String),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    StringArray(Vec<String>),
    DateTimeArray(Vec<String>),
}

/// Coerces a JSON value into `target`, performing the minimum work needed
/// (numeric string -> number, canonical-format string -> datetime). Returns
/// `MismatchError` when no reasonable coercion exists.
pub fn coerce(value: &Value, target: ColumnType) -> Result<TypedValue, MismatchError> {
    match target {
        ColumnType::Int => value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse::<i64>().ok()))
            .map(TypedValue::Int)
            .ok_or(MismatchError),
        ColumnType::Float => value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.parse::<f64>().ok()))
            .map(TypedValue::Float)
            .ok_or(MismatchError),
        ColumnType::String => Some(TypedValue::String(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }))
        .ok_or(MismatchError),
        ColumnType::DateTime => value
            .as_str()
            .filter(|s| DATETIME_RE.is_match(s))
            .map(|s| TypedValue::DateTime(s.to_string()))
            .ok_or(MismatchError),
        ColumnType::IntArray => coerce_array(value, ColumnType::Int).map(|v| {
            TypedValue::IntArray(
                v.into_iter()
                    .filter_map(|tv| match tv {
                        TypedValue::Int(i) => Some(i),
                        _ => None,
                    })
                    .collect(),
            )
        }),
        ColumnType::FloatArray => coerce_array(value, ColumnType::Float).map(|v| {
            TypedValue::FloatArray(
                v.into_iter()
                    .filter_map(|tv| match tv {
                        TypedValue::Float(f) => Some(f),
                        _ => None,
                    })
                    .collect(),
            )
        }),
        ColumnType::StringArray => coerce_array(value, ColumnType::String).map(|v| {
            TypedValue::StringArray(
                v.into_iter()
                    .filter_map(|tv| match tv {
                        TypedValue::String(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
            )
        }),
        ColumnType::DateTimeArray => coerce_array(value, ColumnType::DateTime).map(|v| {
            TypedValue::DateTimeArray(
                v.into_iter()
                    .filter_map(|tv| match tv {
                        TypedValue::DateTime(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
            )
        }),
    }
}

fn coerce_array(value: &Value, elem_type: ColumnType) -> Result<Vec<TypedValue>, MismatchError> {
    let items = value.as_array().ok_or(MismatchError)?;
    items.iter().map(|v| coerce(v, elem_type)).collect()
}

/// Parses an OLAP column type declaration (e.g. `Nullable(DateTime)`,
/// `LowCardinality(String)`, `Array(Float64)`) back into the closed set.
pub fn which_type(declared: &str) -> (ColumnType, bool) {
    let stripped = LOW_CARDINALITY_RE
        .captures(declared)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| declared.to_string());

    if let Some(inner) = stripped
        .strip_prefix("Nullable(")
        .and_then(|s| s.strip_suffix(')'))
    {
        return (base_type(inner), true);
    }
    (base_type(&stripped), false)
}

fn base_type(decl: &str) -> ColumnType {
    if let Some(inner) = decl.strip_prefix("Array(").and_then(|s| s.strip_suffix(')')) {
        return match inner {
            "Int64" | "Int32" => ColumnType::IntArray,
            "Float64" | "Float32" => ColumnType::FloatArray,
            "DateTime" => ColumnType::DateTimeArray,
            _ => ColumnType::StringArray,
        };
    }
    match decl {
        "Int64" | "Int32" | "Int16" | "Int8" => ColumnType::Int,
        "Float64" | "Float32" => ColumnType::Float,
        "DateTime" => ColumnType::DateTime,
        _ => ColumnType::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_integer_literal() {
        assert_eq!(classify(&json!(42)), ColumnType::Int);
    }

    #[test]
    fn classify_integer_valued_float() {
        assert_eq!(classify(&json!(42.0)), ColumnType::Int);
    }

    #[test]
    fn classify_non_integer_number() {
        assert_eq!(classify(&json!(42.5)), ColumnType::Float);
    }

    #[test]
    fn classify_canonical_datetime_string() {
        assert_eq!(classify(&json!("2024-01-02 10:00:00")), ColumnType::DateTime);
    }

    #[test]
    fn classify_plain_string() {
        assert_eq!(classify(&json!("US")), ColumnType::String);
    }

    #[test]
    fn classify_array_majority_vote() {
        assert_eq!(classify(&json!([1, 2, "x"])), ColumnType::IntArray);
    }

    #[test]
    fn classify_array_tie_prefers_string() {
        // one Int, one String -> tie -> String wins per the resolution order
        assert_eq!(classify(&json!([1, "a"])), ColumnType::StringArray);
    }

    #[test]
    fn olap_type_widens_int_to_float64() {
        assert_eq!(ColumnType::Int.olap_type(), "Float64");
    }

    #[test]
    fn coerce_numeric_string_to_int() {
        assert_eq!(coerce(&json!("42"), ColumnType::Int).unwrap(), TypedValue::Int(42));
    }

    #[test]
    fn coerce_rejects_non_datetime_string() {
        assert!(coerce(&json!("not-a-date"), ColumnType::DateTime).is_err());
    }

    #[test]
    fn which_type_strips_low_cardinality_and_nullable() {
        assert_eq!(which_type("LowCardinality(String)"), (ColumnType::String, false));
        assert_eq!(which_type("Nullable(DateTime)"), (ColumnType::DateTime, true));
        assert_eq!(which_type("Array(Float64)"), (ColumnType::FloatArray, false));
    }
}
