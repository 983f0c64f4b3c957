//! Value coercion helpers shared by the builder, criteria and formula engines.
//!
//! Control values are plain `serde_json::Value`s so a form snapshot can be
//! handed to the host without conversion.

use serde_json::{Number, Value};

/// Largest integer an f64 represents exactly (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Look up `name` in a record, treating `null` the same as a missing key.
pub fn present<'a>(record: &'a Value, name: &str) -> Option<&'a Value> {
    record.as_object()?.get(name).filter(|v| !v.is_null())
}

/// Numeric reading of a control value.
///
/// `null`, empty strings and anything non-numeric read as `0`; booleans read as
/// `1`/`0`; numeric strings are parsed.
pub fn coerce_number(value: &Value) -> f64 {
    let n = match value {
        Value::Null => 0.0,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                0.0
            } else {
                s.parse::<f64>().unwrap_or(0.0)
            }
        }
        Value::Array(_) | Value::Object(_) => 0.0,
    };
    if n.is_finite() {
        n
    } else {
        0.0
    }
}

/// String reading used for criteria comparison.
///
/// Integral numbers drop their fraction so `1`, `1.0` and `"1"` compare equal.
pub fn coerce_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < MAX_SAFE_INTEGER => {
                format!("{}", f as i64)
            }
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// JSON value for a computed number. Integral results are stored as integers.
pub fn number_value(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        return Value::from(n as i64);
    }
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

/// Equality used by formula write-back: numbers compare numerically.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y || (x.is_nan() && y.is_nan()),
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Walk a dotted path through a record returned by a lookup resolver.
pub fn project<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_number() {
        assert_eq!(coerce_number(&json!(null)), 0.0);
        assert_eq!(coerce_number(&json!("")), 0.0);
        assert_eq!(coerce_number(&json!(" 12.5 ")), 12.5);
        assert_eq!(coerce_number(&json!("abc")), 0.0);
        assert_eq!(coerce_number(&json!(true)), 1.0);
        assert_eq!(coerce_number(&json!([1, 2])), 0.0);
        assert_eq!(coerce_number(&json!("inf")), 0.0);
    }

    #[test]
    fn test_coerce_string_normalises_numbers() {
        assert_eq!(coerce_string(&json!(1)), "1");
        assert_eq!(coerce_string(&json!(1.0)), "1");
        assert_eq!(coerce_string(&json!(1.5)), "1.5");
        assert_eq!(coerce_string(&json!("x")), "x");
        assert_eq!(coerce_string(&json!(null)), "");
        assert_eq!(coerce_string(&json!(false)), "false");
    }

    #[test]
    fn test_number_value() {
        assert_eq!(number_value(11.0), json!(11));
        assert_eq!(number_value(2.5), json!(2.5));
        assert_eq!(number_value(f64::NAN), Value::Null);
        assert_eq!(number_value(f64::INFINITY), Value::Null);
    }

    #[test]
    fn test_values_equal_is_numeric() {
        assert!(values_equal(&json!(11), &json!(11.0)));
        assert!(!values_equal(&json!(11), &json!("11")));
        assert!(values_equal(&json!(null), &json!(null)));
    }

    #[test]
    fn test_project() {
        let record = json!({"plan": {"prices": [10, 20]}, "unit_price": 7});
        assert_eq!(project(&record, "unit_price"), Some(&json!(7)));
        assert_eq!(project(&record, "plan.prices.1"), Some(&json!(20)));
        assert_eq!(project(&record, "plan.missing"), None);
        assert_eq!(project(&json!(null), "x"), None);
    }

    #[test]
    fn test_present_treats_null_as_missing() {
        let record = json!({"a": 1, "b": null});
        assert_eq!(present(&record, "a"), Some(&json!(1)));
        assert_eq!(present(&record, "b"), None);
        assert_eq!(present(&json!("scalar"), "a"), None);
    }
}
