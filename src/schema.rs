//! Field schemas: the declarative description of one form element.
//!
//! Schemas are immutable input produced by an external form designer and
//! exchanged as JSON or YAML.
//!
//! ```yaml
//! - name: type
//!   kind: input
//!   input: select
//! - name: vat_number
//!   kind: input
//!   required: true
//!   criteria: { key: type, value: company }
//! - name: items
//!   kind: array
//!   children:
//!     - { name: qty, kind: input, input: number }
//!     - { name: price, kind: input, input: number }
//! - name: total
//!   kind: input
//!   input: number
//!   formula: "{items.qty*items.price}"
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SchemaError;
use crate::validators::Validator;

/// Structural kind of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Input,
    Group,
    Array,
    /// Headings, separators, help text. Never produces a control.
    Display,
}

impl FieldKind {
    fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Input => "input",
            FieldKind::Group => "group",
            FieldKind::Array => "array",
            FieldKind::Display => "display",
        }
    }
}

/// Input widget of a leaf field. Only matters for the empty-value policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    #[default]
    Text,
    Number,
    Select,
    Radio,
    Checkbox,
    Password,
    Date,
    Textarea,
}

impl InputKind {
    /// Default empty-value policy for this widget.
    pub fn empty_policy(&self) -> ValueEmptyPolicy {
        match self {
            InputKind::Checkbox | InputKind::Radio => ValueEmptyPolicy::EmptyString,
            InputKind::Password => ValueEmptyPolicy::AlwaysBlank,
            _ => ValueEmptyPolicy::UseSchemaDefault,
        }
    }
}

/// What a leaf starts with when no value is supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueEmptyPolicy {
    /// Unset resolves to `""` so bound widgets never see `null`.
    EmptyString,
    /// Unset resolves to `null`.
    UseSchemaDefault,
    /// Always `""`, whatever the data says. Secrets are never reflected back.
    AlwaysBlank,
}

impl ValueEmptyPolicy {
    pub fn empty_value(&self) -> Value {
        match self {
            ValueEmptyPolicy::EmptyString | ValueEmptyPolicy::AlwaysBlank => {
                Value::String(String::new())
            }
            ValueEmptyPolicy::UseSchemaDefault => Value::Null,
        }
    }
}

/// Activation rule: the field is active while sibling `key` matches `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criteria {
    pub key: String,
    pub value: Value,
}

/// One form element.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSchema {
    /// Unique within the parent scope; empty only for display fields.
    pub name: String,
    pub kind: FieldKind,
    pub input: InputKind,
    pub label: String,
    pub default_value: Option<Value>,
    pub required: bool,
    pub validators: Vec<Validator>,
    pub children: Vec<Arc<FieldSchema>>,
    /// `{expression}` over other field paths.
    pub formula: Option<String>,
    pub criteria: Option<Criteria>,
    /// Name of a host-registered lookup resolver.
    pub lookup: Option<String>,
    /// Initial row count for arrays when neither data nor fallback has rows.
    pub default_rows: Option<usize>,
    /// Overrides the input kind's empty-value policy.
    pub empty_policy: Option<ValueEmptyPolicy>,
}

impl FieldSchema {
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Input,
            ..Default::default()
        }
    }

    pub fn group(name: impl Into<String>, children: Vec<FieldSchema>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Group,
            children: children.into_iter().map(Arc::new).collect(),
            ..Default::default()
        }
    }

    pub fn array(name: impl Into<String>, children: Vec<FieldSchema>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Array,
            children: children.into_iter().map(Arc::new).collect(),
            ..Default::default()
        }
    }

    pub fn display(label: impl Into<String>) -> Self {
        Self {
            kind: FieldKind::Display,
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: InputKind) -> Self {
        self.input = input;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = Some(formula.into());
        self
    }

    pub fn with_criteria(mut self, key: impl Into<String>, value: Value) -> Self {
        self.criteria = Some(Criteria {
            key: key.into(),
            value,
        });
        self
    }

    pub fn with_lookup(mut self, resolver: impl Into<String>) -> Self {
        self.lookup = Some(resolver.into());
        self
    }

    pub fn with_default_rows(mut self, rows: usize) -> Self {
        self.default_rows = Some(rows);
        self
    }

    /// Empty-value policy, resolved once from the override or the input kind.
    pub fn empty_policy(&self) -> ValueEmptyPolicy {
        self.empty_policy.unwrap_or_else(|| self.input.empty_policy())
    }

    /// Validators a leaf carries while active: `Required` first when flagged.
    pub fn active_validators(&self) -> Vec<Validator> {
        let mut validators = Vec::with_capacity(self.validators.len() + 1);
        if self.required {
            validators.push(Validator::Required);
        }
        validators.extend(self.validators.iter().cloned());
        validators
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == FieldKind::Input
    }
}

/// Parse a schema list from JSON.
pub fn parse_schema_json(json: &str) -> Result<Vec<Arc<FieldSchema>>, SchemaError> {
    serde_json::from_str(json).map_err(|e| SchemaError::Parse(e.to_string()))
}

/// Parse a schema list from YAML.
pub fn parse_schema_yaml(yaml: &str) -> Result<Vec<Arc<FieldSchema>>, SchemaError> {
    serde_yaml::from_str(yaml).map_err(|e| SchemaError::Parse(e.to_string()))
}

/// Structural checks: names present and unique per scope, patterns compile.
///
/// `has_lookup` decides whether a named lookup resolver is available.
pub fn validate_schemas(
    schemas: &[Arc<FieldSchema>],
    has_lookup: &dyn Fn(&str) -> bool,
) -> Result<(), SchemaError> {
    validate_scope(schemas, "", has_lookup)
}

fn validate_scope(
    schemas: &[Arc<FieldSchema>],
    scope: &str,
    has_lookup: &dyn Fn(&str) -> bool,
) -> Result<(), SchemaError> {
    let mut seen = HashSet::new();
    let scope_label = if scope.is_empty() { "<root>" } else { scope };

    for schema in schemas {
        if schema.kind == FieldKind::Display {
            continue;
        }
        if schema.name.is_empty() {
            return Err(SchemaError::MissingName {
                kind: schema.kind.as_str().to_string(),
                label: schema.label.clone(),
                scope: scope_label.to_string(),
            });
        }
        if !seen.insert(schema.name.as_str()) {
            return Err(SchemaError::DuplicateName {
                name: schema.name.clone(),
                scope: scope_label.to_string(),
            });
        }

        let path = if scope.is_empty() {
            schema.name.clone()
        } else {
            format!("{scope}.{}", schema.name)
        };

        if let Some(resolver) = &schema.lookup {
            if !has_lookup(resolver) {
                return Err(SchemaError::UnknownLookup {
                    field: path,
                    resolver: resolver.clone(),
                });
            }
        }
        for validator in &schema.validators {
            validator
                .verify()
                .map_err(|reason| SchemaError::InvalidPattern {
                    field: path.clone(),
                    reason,
                })?;
        }

        if matches!(schema.kind, FieldKind::Group | FieldKind::Array) {
            validate_scope(&schema.children, &path, has_lookup)?;
        }
    }
    Ok(())
}
