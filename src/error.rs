//! Error types for the form core.
//!
//! - `SchemaError`: malformed field schemas, raised at build time.
//! - `FormError`: host API misuse (unknown path, wrong control kind).
//! - `FormulaError`: resolution/evaluation failures. A failed recompute
//!   logs it and writes `null`; only `Form::resolve` returns it directly.

use thiserror::Error;

/// A developer-time mistake in the field schema list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("{kind} field '{label}' at '{scope}' has no name")]
    MissingName {
        kind: String,
        label: String,
        scope: String,
    },

    #[error("duplicate field name '{name}' in scope '{scope}'")]
    DuplicateName { name: String, scope: String },

    #[error("field '{field}' references unknown lookup resolver '{resolver}'")]
    UnknownLookup { field: String, resolver: String },

    #[error("field '{field}' has an invalid pattern validator: {reason}")]
    InvalidPattern { field: String, reason: String },

    #[error("failed to parse schema: {0}")]
    Parse(String),
}

/// Errors returned by `Form` operations.
#[derive(Debug, Error)]
pub enum FormError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("no control at path '{0}'")]
    UnknownPath(String),

    #[error("control at '{0}' is not a leaf")]
    NotALeaf(String),

    #[error("control at '{0}' is not a repeating array")]
    NotAnArray(String),

    #[error("row index {index} out of bounds for '{path}' ({len} rows)")]
    RowOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },
}

/// Why a single formula recompute produced `null`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("substituted expression contains unsafe characters: {0:?}")]
    UnsafeExpression(String),

    #[error("failed to parse expression {expr:?}: {reason}")]
    Parse { expr: String, reason: String },

    #[error("expression evaluated to a non-finite number")]
    NonFinite,

    #[error("lookup '{resolver}' failed: {reason}")]
    Lookup { resolver: String, reason: String },

    #[error("lookup '{resolver}' timed out after {timeout_ms}ms")]
    LookupTimeout { resolver: String, timeout_ms: u64 },
}
