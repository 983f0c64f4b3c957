//! Row/Array Manager
//!
//! Rows of a repeating array are added, removed and reordered on a live form.
//! Every structural change emits a shape event and triggers formulas that
//! aggregate over the array.
//!
//! Removal is synchronous end to end: the row's formulas are released (their
//! in-flight recomputes aborted) before its controls leave the tree, so no
//! later `settle()` can write into it.

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use crate::builder::build_row;
use crate::error::FormError;
use crate::form::Form;
use crate::tree::{ControlId, RowKey};

impl Form {
    /// Append a row built from empty data (schema defaults).
    pub fn add_row(&mut self, array_path: &str) -> Result<RowKey, FormError> {
        self.add_row_with(array_path, &Value::Null)
    }

    /// Append a row seeded from `data`.
    pub fn add_row_with(&mut self, array_path: &str, data: &Value) -> Result<RowKey, FormError> {
        let array = self.array_control(array_path)?;
        let schema = self
            .tree
            .schema(array)
            .cloned()
            .ok_or_else(|| FormError::NotAnArray(array_path.to_string()))?;

        let (key, group) = build_row(&mut self.tree, array, &schema, data, &Value::Null);
        self.run_criteria();

        let attached = self.graph.attach_subtree(&self.tree, group);
        for id in attached {
            self.schedule(id);
        }
        self.notify_shape(array);

        debug!(array = array_path, row = %key, "row added");
        Ok(key)
    }

    /// Remove the row at `index`, releasing its formulas and subscriptions.
    pub fn remove_row(&mut self, array_path: &str, index: usize) -> Result<RowKey, FormError> {
        let array = self.array_control(array_path)?;
        let len = self.row_len(array);
        if index >= len {
            return Err(FormError::RowOutOfBounds {
                path: array_path.to_string(),
                index,
                len,
            });
        }

        let Some(rows) = self.tree.array_mut(array) else {
            return Err(FormError::NotAnArray(array_path.to_string()));
        };
        let row = rows.rows.remove(index);

        let removed: HashSet<ControlId> = self.tree.descendants(row.group).into_iter().collect();
        let released = self.graph.release_controls(&removed);
        self.tree.remove_subtree(row.group);
        self.notify_shape(array);

        debug!(
            array = array_path,
            row = %row.key,
            controls = removed.len(),
            formulas = released.len(),
            "row removed"
        );
        Ok(row.key)
    }

    /// Move the row at `from` to position `to`. Row identity and formulas are
    /// kept; only positions change.
    pub fn move_row(&mut self, array_path: &str, from: usize, to: usize) -> Result<(), FormError> {
        let array = self.array_control(array_path)?;
        let len = self.row_len(array);
        for index in [from, to] {
            if index >= len {
                return Err(FormError::RowOutOfBounds {
                    path: array_path.to_string(),
                    index,
                    len,
                });
            }
        }
        if from == to {
            return Ok(());
        }
        if let Some(rows) = self.tree.array_mut(array) {
            let row = rows.rows.remove(from);
            rows.rows.insert(to, row);
        }
        self.notify_shape(array);
        Ok(())
    }

    /// Stable row keys, in current order.
    pub fn row_keys(&self, array_path: &str) -> Result<Vec<RowKey>, FormError> {
        let array = self.array_control(array_path)?;
        Ok(self
            .tree
            .array(array)
            .map(|a| a.rows.iter().map(|r| r.key).collect())
            .unwrap_or_default())
    }

    pub fn row_count(&self, array_path: &str) -> Result<usize, FormError> {
        let array = self.array_control(array_path)?;
        Ok(self.row_len(array))
    }

    /// Current position of the row `key`.
    pub fn row_index(&self, array_path: &str, key: RowKey) -> Result<Option<usize>, FormError> {
        let array = self.array_control(array_path)?;
        Ok(self.tree.row_index(array, key))
    }

    fn array_control(&self, path: &str) -> Result<ControlId, FormError> {
        let id = self.control(path)?;
        match self.tree.array(id) {
            Some(_) => Ok(id),
            None => Err(FormError::NotAnArray(path.to_string())),
        }
    }

    fn row_len(&self, array: ControlId) -> usize {
        self.tree.array(array).map_or(0, |a| a.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::FormConfig;
    use crate::error::FormError;
    use crate::form::Form;
    use crate::formula::LookupRegistry;
    use crate::schema::FieldSchema;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn items_form(data: Value) -> Form {
        let schemas: Vec<Arc<FieldSchema>> = vec![
            FieldSchema::array(
                "items",
                vec![
                    FieldSchema::input("qty").with_default(json!(1)),
                    FieldSchema::input("price").with_default(json!(0)),
                    FieldSchema::input("line").with_formula("{qty * price}"),
                ],
            ),
            FieldSchema::input("total").with_formula("{items.qty * items.price}"),
        ]
        .into_iter()
        .map(Arc::new)
        .collect();
        Form::open(
            &schemas,
            &data,
            &Value::Null,
            LookupRegistry::new(),
            FormConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_add_row_with_seed_and_defaults() {
        let mut form = items_form(json!({"items": [{"qty": 2, "price": 3}]}));
        form.settle().await;
        assert_eq!(form.get("total").unwrap(), json!(6));

        form.add_row("items").unwrap();
        form.add_row_with("items", &json!({"qty": 4, "price": 5})).unwrap();
        form.settle().await;

        assert_eq!(form.row_count("items").unwrap(), 3);
        assert_eq!(form.get("items.1").unwrap(), json!({"qty": 1, "price": 0, "line": 0}));
        assert_eq!(form.get("items.2.line").unwrap(), json!(20));
        assert_eq!(form.get("total").unwrap(), json!(26));
    }

    #[tokio::test]
    async fn test_remove_row_releases_formulas() {
        let mut form = items_form(json!({
            "items": [{"qty": 2, "price": 3}, {"qty": 1, "price": 5}]
        }));
        form.settle().await;
        let formulas = form.formula_count();
        let subscriptions = form.subscription_count();

        let keys = form.row_keys("items").unwrap();
        let removed = form.remove_row("items", 0).unwrap();
        assert_eq!(removed, keys[0]);
        assert_eq!(form.formula_count(), formulas - 1);
        assert!(form.subscription_count() < subscriptions);

        form.settle().await;
        assert_eq!(form.get("total").unwrap(), json!(5));
        assert_eq!(form.row_keys("items").unwrap(), vec![keys[1]]);
    }

    #[tokio::test]
    async fn test_move_row_keeps_identity() {
        let mut form = items_form(json!({"items": [{"qty": 1}, {"qty": 2}, {"qty": 3}]}));
        let keys = form.row_keys("items").unwrap();

        form.move_row("items", 0, 2).unwrap();
        assert_eq!(form.row_keys("items").unwrap(), vec![keys[1], keys[2], keys[0]]);
        assert_eq!(form.row_index("items", keys[0]).unwrap(), Some(2));
        assert_eq!(form.get("items.2.qty").unwrap(), json!(1));
    }

    #[test]
    fn test_row_errors() {
        let mut form = items_form(json!({"items": [{}]}));
        assert!(matches!(
            form.remove_row("items", 3),
            Err(FormError::RowOutOfBounds { index: 3, len: 1, .. })
        ));
        assert!(matches!(form.add_row("total"), Err(FormError::NotAnArray(_))));
        assert!(matches!(form.add_row("nope"), Err(FormError::UnknownPath(_))));
        assert!(matches!(form.move_row("items", 0, 1), Err(FormError::RowOutOfBounds { .. })));
    }
}
