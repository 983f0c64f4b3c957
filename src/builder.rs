//! Control Tree Builder
//!
//! Turns an ordered list of field schemas plus a data record (and a fallback
//! record, typically previous or cloned data) into a live control tree.
//!
//! Leaf values resolve in order of precedence:
//! 1. `data[name]`
//! 2. `fallback[name]`
//! 3. the schema's `default_value`
//! 4. the empty value of the schema's `ValueEmptyPolicy`
//!
//! `null` counts as missing at every step. Password-like fields ignore all of
//! the above and always start blank.

use std::sync::Arc;

use serde_json::Value;

use crate::error::SchemaError;
use crate::schema::{validate_schemas, FieldKind, FieldSchema, ValueEmptyPolicy};
use crate::tree::{
    ArrayControl, Control, ControlId, ControlTree, GroupControl, LeafControl, RowKey, Segment,
};
use crate::value::present;

const EMPTY: &Value = &Value::Null;

/// Build a control tree. Inputs are never mutated.
pub fn build(
    schemas: &[Arc<FieldSchema>],
    data: &Value,
    fallback: &Value,
) -> Result<ControlTree, SchemaError> {
    validate_schemas(schemas, &|_| true)?;

    let mut tree = ControlTree::new(schemas.to_vec());
    let root = tree.root();
    populate(&mut tree, root, schemas, data, fallback);
    Ok(tree)
}

/// Append one row to the array control `array`, seeded from `data`/`fallback`.
///
/// Returns the row's group id.
pub fn build_row(
    tree: &mut ControlTree,
    array: ControlId,
    schema: &FieldSchema,
    data: &Value,
    fallback: &Value,
) -> (RowKey, ControlId) {
    let key = RowKey::new();
    let group = tree.insert(
        array,
        Segment::Row(key),
        None,
        Control::Group(GroupControl {
            children: Default::default(),
            schemas: schema.children.clone(),
        }),
    );
    populate(tree, group, &schema.children, data, fallback);
    (key, group)
}

/// Value a leaf starts with.
pub fn resolve_leaf_value(schema: &FieldSchema, data: &Value, fallback: &Value) -> Value {
    let policy = schema.empty_policy();
    if policy == ValueEmptyPolicy::AlwaysBlank {
        return policy.empty_value();
    }
    present(data, &schema.name)
        .or_else(|| present(fallback, &schema.name))
        .or_else(|| schema.default_value.as_ref().filter(|v| !v.is_null()))
        .cloned()
        .unwrap_or_else(|| policy.empty_value())
}

/// Number of rows an array starts with.
pub fn initial_row_count(schema: &FieldSchema, data: &Value, fallback: &Value) -> usize {
    present(data, &schema.name)
        .and_then(Value::as_array)
        .or_else(|| present(fallback, &schema.name).and_then(Value::as_array))
        .map(Vec::len)
        .or(schema.default_rows)
        .unwrap_or(1)
}

fn populate(
    tree: &mut ControlTree,
    group: ControlId,
    schemas: &[Arc<FieldSchema>],
    data: &Value,
    fallback: &Value,
) {
    for schema in schemas {
        match schema.kind {
            FieldKind::Display => {}

            FieldKind::Group => {
                let child_data = present(data, &schema.name).unwrap_or(EMPTY);
                let child_fallback = present(fallback, &schema.name).unwrap_or(EMPTY);
                let id = tree.insert(
                    group,
                    Segment::Name(schema.name.clone()),
                    Some(schema.clone()),
                    Control::Group(GroupControl {
                        children: Default::default(),
                        schemas: schema.children.clone(),
                    }),
                );
                populate(tree, id, &schema.children, child_data, child_fallback);
            }

            FieldKind::Array => {
                let rows = initial_row_count(schema, data, fallback);
                let data_rows = present(data, &schema.name).and_then(Value::as_array);
                let fallback_rows = present(fallback, &schema.name).and_then(Value::as_array);
                let id = tree.insert(
                    group,
                    Segment::Name(schema.name.clone()),
                    Some(schema.clone()),
                    Control::Array(ArrayControl::default()),
                );
                for i in 0..rows {
                    let row_data = data_rows.and_then(|r| r.get(i)).unwrap_or(EMPTY);
                    let row_fallback = fallback_rows.and_then(|r| r.get(i)).unwrap_or(EMPTY);
                    build_row(tree, id, schema, row_data, row_fallback);
                }
            }

            FieldKind::Input => {
                tree.insert(
                    group,
                    Segment::Name(schema.name.clone()),
                    Some(schema.clone()),
                    Control::Leaf(LeafControl {
                        value: resolve_leaf_value(schema, data, fallback),
                        validators: schema.active_validators(),
                        active: true,
                    }),
                );
            }
        }
    }
}
