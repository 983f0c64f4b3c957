//! Criteria Activation Engine
//!
//! A field declaring `criteria: {key, value}` is active while its sibling
//! `key` matches `value`. Deactivation silences the whole subtree: every
//! descendant leaf loses its validators and has its value reset to `""`.
//! Activation re-attaches validators and re-enters nested criteria, so a
//! subtree only comes back as far as its own conditions allow.
//!
//! Matching coerces both sides to strings (`1`, `1.0` and `"1"` are equal).
//! An array sibling matches when any element matches; an array criteria value
//! matches when the sibling equals any element. A key that does not exist in
//! the group fails closed.
//!
//! The engine only mutates the tree and reports what it did; the caller turns
//! value resets into change notifications. Validator toggles never notify.

use serde_json::Value;

use crate::schema::{Criteria, FieldKind, FieldSchema};
use crate::tree::{Control, ControlId, ControlTree};
use crate::value::coerce_string;

/// Side effects of a criteria pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CriteriaOutcome {
    /// Leaves whose value was reset, with the value they held before.
    pub resets: Vec<(ControlId, Value)>,
    /// Leaves whose active flag flipped, with the new flag.
    pub toggled: Vec<(ControlId, bool)>,
}

impl CriteriaOutcome {
    pub fn is_empty(&self) -> bool {
        self.resets.is_empty() && self.toggled.is_empty()
    }
}

/// Evaluate `schema`'s criteria against its siblings in `group`, activating or
/// deactivating the field's subtree. Fields without criteria are always active.
pub fn evaluate_criteria(
    tree: &mut ControlTree,
    schema: &FieldSchema,
    group: ControlId,
    out: &mut CriteriaOutcome,
) -> bool {
    let matched = match &schema.criteria {
        Some(criteria) => criteria_matches(tree, criteria, group),
        None => true,
    };
    if matched {
        activate(tree, schema, group, out);
    } else {
        deactivate(tree, schema, group, out);
    }
    matched
}

/// Full pass over the scope at `group`: every schema with criteria is
/// evaluated, groups and array rows without criteria are walked into.
pub fn apply_criteria(tree: &mut ControlTree, group: ControlId, out: &mut CriteriaOutcome) {
    let Some(schemas) = tree.group(group).map(|g| g.schemas.clone()) else {
        return;
    };
    for schema in schemas {
        if schema.kind == FieldKind::Display {
            continue;
        }
        if schema.criteria.is_some() {
            evaluate_criteria(tree, &schema, group, out);
            continue;
        }
        let Some(id) = tree.child(group, &schema.name) else {
            continue;
        };
        match schema.kind {
            FieldKind::Group => apply_criteria(tree, id, out),
            FieldKind::Array => {
                for row in row_groups(tree, id) {
                    apply_criteria(tree, row, out);
                }
            }
            _ => {}
        }
    }
}

/// Does the sibling named by `criteria.key` match `criteria.value`?
pub fn criteria_matches(tree: &ControlTree, criteria: &Criteria, group: ControlId) -> bool {
    let Some(leaf) = tree
        .child(group, &criteria.key)
        .and_then(|id| tree.leaf(id))
    else {
        return false;
    };

    let expected: Vec<String> = match &criteria.value {
        Value::Array(options) => options.iter().map(coerce_string).collect(),
        single => vec![coerce_string(single)],
    };
    match &leaf.value {
        Value::Array(items) => items
            .iter()
            .any(|item| expected.contains(&coerce_string(item))),
        single => expected.contains(&coerce_string(single)),
    }
}

/// Re-attach validators to the field's leaves and mark them active, re-entering
/// nested criteria on the way down.
pub fn activate(
    tree: &mut ControlTree,
    schema: &FieldSchema,
    group: ControlId,
    out: &mut CriteriaOutcome,
) {
    let Some(id) = tree.child(group, &schema.name) else {
        return;
    };
    match schema.kind {
        FieldKind::Input => {
            if let Some(leaf) = tree.leaf_mut(id) {
                leaf.validators = schema.active_validators();
                if !leaf.active {
                    leaf.active = true;
                    out.toggled.push((id, true));
                }
            }
        }
        FieldKind::Group => activate_scope(tree, id, out),
        FieldKind::Array => {
            for row in row_groups(tree, id) {
                activate_scope(tree, row, out);
            }
        }
        FieldKind::Display => {}
    }
}

/// Clear validators, reset values to `""` and mark every leaf of the field's
/// subtree inactive.
pub fn deactivate(
    tree: &mut ControlTree,
    schema: &FieldSchema,
    group: ControlId,
    out: &mut CriteriaOutcome,
) {
    let Some(id) = tree.child(group, &schema.name) else {
        return;
    };
    let blank = Value::String(String::new());
    for leaf_id in tree.leaves(id) {
        let Some(leaf) = tree.leaf_mut(leaf_id) else {
            continue;
        };
        leaf.validators.clear();
        if leaf.active {
            leaf.active = false;
            out.toggled.push((leaf_id, false));
        }
        if leaf.value != blank {
            let old = std::mem::replace(&mut leaf.value, blank.clone());
            out.resets.push((leaf_id, old));
        }
    }
}

fn activate_scope(tree: &mut ControlTree, group: ControlId, out: &mut CriteriaOutcome) {
    let Some(schemas) = tree.group(group).map(|g| g.schemas.clone()) else {
        return;
    };
    for schema in schemas {
        if schema.kind == FieldKind::Display {
            continue;
        }
        if schema.criteria.is_some() {
            evaluate_criteria(tree, &schema, group, out);
        } else {
            activate(tree, &schema, group, out);
        }
    }
}

fn row_groups(tree: &ControlTree, array: ControlId) -> Vec<ControlId> {
    match tree.node(array).map(|n| &n.control) {
        Some(Control::Array(array)) => array.rows.iter().map(|r| r.group).collect(),
        _ => Vec::new(),
    }
}
