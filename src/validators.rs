//! Leaf validators.
//!
//! Validators are plain data so they round-trip through the schema format.
//! All validators except `Required` pass on empty values; emptiness is the
//! concern of `Required` alone.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("static email pattern"));

/// A single validation rule attached to a leaf control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Validator {
    Required,
    MinLength { value: usize },
    MaxLength { value: usize },
    Min { value: f64 },
    Max { value: f64 },
    /// Whole-value match; the pattern is anchored on both ends.
    Pattern { value: String },
    Email,
}

/// A failed validator, surfaced per field to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("value is required")]
    Required,

    #[error("must be at least {min} characters (got {actual})")]
    MinLength { min: usize, actual: usize },

    #[error("must be at most {max} characters (got {actual})")]
    MaxLength { max: usize, actual: usize },

    #[error("must be at least {min} (got {actual})")]
    Min { min: f64, actual: f64 },

    #[error("must be at most {max} (got {actual})")]
    Max { max: f64, actual: f64 },

    #[error("does not match pattern {pattern}")]
    Pattern { pattern: String },

    #[error("not a valid email address")]
    Email,
}

impl Validator {
    /// Run this validator against a value.
    pub fn check(&self, value: &Value) -> Result<(), ValidationError> {
        match self {
            Validator::Required => {
                if is_empty(value) {
                    Err(ValidationError::Required)
                } else {
                    Ok(())
                }
            }
            _ if is_empty(value) => Ok(()),
            Validator::MinLength { value: min } => match length(value) {
                Some(actual) if actual < *min => Err(ValidationError::MinLength {
                    min: *min,
                    actual,
                }),
                _ => Ok(()),
            },
            Validator::MaxLength { value: max } => match length(value) {
                Some(actual) if actual > *max => Err(ValidationError::MaxLength {
                    max: *max,
                    actual,
                }),
                _ => Ok(()),
            },
            Validator::Min { value: min } => match numeric(value) {
                Some(actual) if actual < *min => Err(ValidationError::Min { min: *min, actual }),
                _ => Ok(()),
            },
            Validator::Max { value: max } => match numeric(value) {
                Some(actual) if actual > *max => Err(ValidationError::Max { max: *max, actual }),
                _ => Ok(()),
            },
            Validator::Pattern { value: pattern } => {
                let text = as_text(value);
                // Patterns are checked when the form is opened; a pattern that
                // still fails to compile here rejects the value.
                match Regex::new(&format!("^(?:{pattern})$")) {
                    Ok(re) if re.is_match(&text) => Ok(()),
                    _ => Err(ValidationError::Pattern {
                        pattern: pattern.clone(),
                    }),
                }
            }
            Validator::Email => {
                if EMAIL_RE.is_match(&as_text(value)) {
                    Ok(())
                } else {
                    Err(ValidationError::Email)
                }
            }
        }
    }

    /// Compile-check for pattern validators.
    pub(crate) fn verify(&self) -> Result<(), String> {
        match self {
            Validator::Pattern { value } => Regex::new(&format!("^(?:{value})$"))
                .map(|_| ())
                .map_err(|e| e.to_string()),
            _ => Ok(()),
        }
    }
}

/// Run every validator, collecting all failures.
pub fn run_validators(validators: &[Validator], value: &Value) -> Vec<ValidationError> {
    validators
        .iter()
        .filter_map(|v| v.check(value).err())
        .collect()
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
