//! Live control tree.
//!
//! Controls live in an arena keyed by `ControlId`. Ids are never reused, so a
//! stale id held by an in-flight recompute simply stops resolving once its
//! control has been removed.
//!
//! Paths are dotted from the root; rows of a repeating array are addressed by
//! position (`items.0.qty`) while their identity is the stable `RowKey`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::schema::FieldSchema;
use crate::validators::{run_validators, ValidationError, Validator};

// ============================================================================
// Identifiers
// ============================================================================

/// Arena handle of a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ControlId(u64);

/// Synthetic row identity, independent of the row's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowKey(Uuid);

impl RowKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RowKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Controls
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct LeafControl {
    pub value: Value,
    pub validators: Vec<Validator>,
    pub active: bool,
}

impl LeafControl {
    pub fn errors(&self) -> Vec<ValidationError> {
        if !self.active {
            return Vec::new();
        }
        run_validators(&self.validators, &self.value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroupControl {
    pub children: BTreeMap<String, ControlId>,
    /// Field schemas of this scope, in declaration order.
    pub schemas: Vec<Arc<FieldSchema>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Row {
    pub key: RowKey,
    pub group: ControlId,
}

#[derive(Debug, Clone, Default)]
pub struct ArrayControl {
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone)]
pub enum Control {
    Leaf(LeafControl),
    Group(GroupControl),
    Array(ArrayControl),
}

/// Position of a node under its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Root,
    Name(String),
    Row(RowKey),
}

#[derive(Debug, Clone)]
pub struct ControlNode {
    pub parent: Option<ControlId>,
    pub segment: Segment,
    /// Originating schema; `None` for the root and for row groups.
    pub schema: Option<Arc<FieldSchema>>,
    pub control: Control,
}

// ============================================================================
// Tree
// ============================================================================

#[derive(Debug, Clone)]
pub struct ControlTree {
    nodes: HashMap<ControlId, ControlNode>,
    root: ControlId,
    next_id: u64,
}

impl ControlTree {
    /// Empty tree whose root group declares `schemas`.
    pub fn new(schemas: Vec<Arc<FieldSchema>>) -> Self {
        let root = ControlId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            ControlNode {
                parent: None,
                segment: Segment::Root,
                schema: None,
                control: Control::Group(GroupControl {
                    children: BTreeMap::new(),
                    schemas,
                }),
            },
        );
        Self {
            nodes,
            root,
            next_id: 1,
        }
    }

    pub fn root(&self) -> ControlId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: ControlId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: ControlId) -> Option<&ControlNode> {
        self.nodes.get(&id)
    }

    /// Add a node under `parent`, registering it with the parent group's
    /// children (by name) or the parent array's rows (appended).
    pub fn insert(
        &mut self,
        parent: ControlId,
        segment: Segment,
        schema: Option<Arc<FieldSchema>>,
        control: Control,
    ) -> ControlId {
        let id = ControlId(self.next_id);
        self.next_id += 1;

        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            match (&mut parent_node.control, &segment) {
                (Control::Group(group), Segment::Name(name)) => {
                    group.children.insert(name.clone(), id);
                }
                (Control::Array(array), Segment::Row(key)) => {
                    array.rows.push(Row {
                        key: *key,
                        group: id,
                    });
                }
                _ => {}
            }
        }

        self.nodes.insert(
            id,
            ControlNode {
                parent: Some(parent),
                segment,
                schema,
                control,
            },
        );
        id
    }

    pub fn leaf(&self, id: ControlId) -> Option<&LeafControl> {
        match &self.nodes.get(&id)?.control {
            Control::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    pub fn leaf_mut(&mut self, id: ControlId) -> Option<&mut LeafControl> {
        match &mut self.nodes.get_mut(&id)?.control {
            Control::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    pub fn group(&self, id: ControlId) -> Option<&GroupControl> {
        match &self.nodes.get(&id)?.control {
            Control::Group(group) => Some(group),
            _ => None,
        }
    }

    pub fn array(&self, id: ControlId) -> Option<&ArrayControl> {
        match &self.nodes.get(&id)?.control {
            Control::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn array_mut(&mut self, id: ControlId) -> Option<&mut ArrayControl> {
        match &mut self.nodes.get_mut(&id)?.control {
            Control::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn schema(&self, id: ControlId) -> Option<&Arc<FieldSchema>> {
        self.nodes.get(&id)?.schema.as_ref()
    }

    pub fn parent(&self, id: ControlId) -> Option<ControlId> {
        self.nodes.get(&id)?.parent
    }

    /// Named child of a group.
    pub fn child(&self, group: ControlId, name: &str) -> Option<ControlId> {
        self.group(group)?.children.get(name).copied()
    }

    /// Resolve a dotted path relative to `base`.
    pub fn find(&self, base: ControlId, path: &str) -> Option<ControlId> {
        if path.is_empty() {
            return Some(base);
        }
        let mut current = base;
        for segment in path.split('.') {
            current = match &self.nodes.get(&current)?.control {
                Control::Group(group) => *group.children.get(segment)?,
                Control::Array(array) => array.rows.get(segment.parse::<usize>().ok()?)?.group,
                Control::Leaf(_) => return None,
            };
        }
        Some(current)
    }

    /// Dotted path of `id` from the root (rows by current position).
    pub fn path_of(&self, id: ControlId) -> String {
        let mut segments = Vec::new();
        let mut current = id;
        while let Some(node) = self.nodes.get(&current) {
            match &node.segment {
                Segment::Root => break,
                Segment::Name(name) => segments.push(name.clone()),
                Segment::Row(key) => {
                    let index = node
                        .parent
                        .and_then(|p| self.row_index(p, *key))
                        .map(|i| i.to_string())
                        .unwrap_or_else(|| key.to_string());
                    segments.push(index);
                }
            }
            match node.parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        segments.reverse();
        segments.join(".")
    }

    pub fn row_index(&self, array: ControlId, key: RowKey) -> Option<usize> {
        self.array(array)?.rows.iter().position(|r| r.key == key)
    }

    /// Row key owning `id`, if `id` lives inside a repeating row.
    pub fn enclosing_row(&self, id: ControlId) -> Option<RowKey> {
        let mut current = Some(id);
        while let Some(cid) = current {
            let node = self.nodes.get(&cid)?;
            if let Segment::Row(key) = node.segment {
                return Some(key);
            }
            current = node.parent;
        }
        None
    }

    /// True when `id` is the group of a repeating row.
    pub fn is_row(&self, id: ControlId) -> bool {
        self.nodes
            .get(&id)
            .is_some_and(|node| matches!(node.segment, Segment::Row(_)))
    }

    /// Parents of `id`, nearest first, up to and including the root.
    pub fn ancestors(&self, id: ControlId) -> Vec<ControlId> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(cid) = current {
            out.push(cid);
            current = self.parent(cid);
        }
        out
    }

    /// True when `id` is `ancestor` or lies beneath it.
    pub fn is_within(&self, id: ControlId, ancestor: ControlId) -> bool {
        id == ancestor || self.ancestors(id).contains(&ancestor)
    }

    /// `id` and everything beneath it, parents before children.
    pub fn descendants(&self, id: ControlId) -> Vec<ControlId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(cid) = stack.pop() {
            let Some(node) = self.nodes.get(&cid) else {
                continue;
            };
            out.push(cid);
            match &node.control {
                Control::Group(group) => stack.extend(group.children.values().rev()),
                Control::Array(array) => stack.extend(array.rows.iter().rev().map(|r| r.group)),
                Control::Leaf(_) => {}
            }
        }
        out
    }

    /// Leaf ids beneath `id` (inclusive).
    pub fn leaves(&self, id: ControlId) -> Vec<ControlId> {
        self.descendants(id)
            .into_iter()
            .filter(|cid| self.leaf(*cid).is_some())
            .collect()
    }

    /// Drop `id` and its subtree from the arena. The caller detaches it from
    /// its parent first. Returns the removed ids.
    pub fn remove_subtree(&mut self, id: ControlId) -> Vec<ControlId> {
        let removed = self.descendants(id);
        for cid in &removed {
            self.nodes.remove(cid);
        }
        removed
    }

    /// Plain nested record of the subtree at `id`.
    pub fn snapshot(&self, id: ControlId) -> Value {
        let Some(node) = self.nodes.get(&id) else {
            return Value::Null;
        };
        match &node.control {
            Control::Leaf(leaf) => leaf.value.clone(),
            Control::Group(group) => {
                let mut map = Map::new();
                for (name, child) in &group.children {
                    map.insert(name.clone(), self.snapshot(*child));
                }
                Value::Object(map)
            }
            Control::Array(array) => {
                Value::Array(array.rows.iter().map(|r| self.snapshot(r.group)).collect())
            }
        }
    }
}
