//! Path resolution for formulas.
//!
//! Resolution is split in two so nothing holds the tree across an await:
//!
//! 1. `plan_token` walks the tree synchronously and turns a path into
//!    operands: ready numbers, or pending lookups carrying the raw value and
//!    the record path to project.
//! 2. `resolve_operand` awaits the lookups.
//!
//! A path is tried as a direct address under the formula's scope, then under
//! each enclosing group up to the nearest row, then under the root. Failing
//! that it is split into `root.rest`: a root with a lookup resolver projects
//! `rest` through the looked-up record, a root that is a repeating array
//! yields one operand per row (a column).

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::FormulaError;
use crate::formula::expr;
use crate::formula::graph::{Formula, FormulaId};
use crate::tree::{Control, ControlId, ControlTree};
use crate::value::{coerce_number, coerce_string, project};

// ============================================================================
// Lookup resolvers
// ============================================================================

/// Host-supplied async lookup, typically a remote fetch keyed by an option
/// value. Must be idempotent for a given input; `Ok(None)` means no record.
#[async_trait]
pub trait LookupResolver: Send + Sync {
    async fn resolve(&self, raw: &Value) -> anyhow::Result<Option<Value>>;
}

/// Named lookup resolvers, injected into the form at construction.
#[derive(Clone, Default)]
pub struct LookupRegistry {
    resolvers: HashMap<String, Arc<dyn LookupResolver>>,
}

impl LookupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolver under `name` (builder style).
    pub fn with(mut self, name: impl Into<String>, resolver: Arc<dyn LookupResolver>) -> Self {
        self.insert(name, resolver);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, resolver: Arc<dyn LookupResolver>) {
        self.resolvers.insert(name.into(), resolver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LookupResolver>> {
        self.resolvers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolvers.contains_key(name)
    }
}

impl fmt::Debug for LookupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.resolvers.keys().collect();
        names.sort();
        f.debug_struct("LookupRegistry")
            .field("resolvers", &names)
            .finish()
    }
}

/// In-memory lookup table keyed by the string form of the raw value.
#[derive(Debug, Clone, Default)]
pub struct StaticLookup {
    records: HashMap<String, Value>,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, record: Value) -> Self {
        self.records.insert(key.into(), record);
        self
    }

    /// Build from a JSON object `{ key: record, ... }`.
    pub fn from_value(table: &Value) -> Self {
        let records = table
            .as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Self { records }
    }
}

#[async_trait]
impl LookupResolver for StaticLookup {
    async fn resolve(&self, raw: &Value) -> anyhow::Result<Option<Value>> {
        Ok(self.records.get(&coerce_string(raw)).cloned())
    }
}

// ============================================================================
// Plans
// ============================================================================

/// A number, or a lookup still to be awaited.
#[derive(Clone)]
pub enum Operand {
    Ready(f64),
    Lookup {
        resolver_name: String,
        resolver: Arc<dyn LookupResolver>,
        raw: Value,
        rest: String,
    },
}

impl fmt::Debug for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Ready(n) => f.debug_tuple("Ready").field(n).finish(),
            Operand::Lookup {
                resolver_name,
                raw,
                rest,
                ..
            } => f
                .debug_struct("Lookup")
                .field("resolver", resolver_name)
                .field("raw", raw)
                .field("rest", rest)
                .finish(),
        }
    }
}

/// Resolution plan of one path token.
#[derive(Debug, Clone)]
pub enum TokenPlan {
    Scalar(Operand),
    /// One operand per row of the repeating array `array`.
    Column { array: ControlId, cells: Vec<Operand> },
}

/// Locate `path` from `scope` outward through each enclosing group, stopping
/// at the nearest row, then fall back to the root.
pub fn locate(tree: &ControlTree, scope: ControlId, path: &str) -> Option<ControlId> {
    let root = tree.root();
    let mut current = Some(scope);
    while let Some(id) = current {
        if let Some(found) = tree.find(id, path) {
            return Some(found);
        }
        if id == root {
            return None;
        }
        if tree.is_row(id) {
            break;
        }
        current = tree.parent(id);
    }
    tree.find(root, path)
}

/// Plan the resolution of `path` relative to `scope`.
pub fn plan_token(
    tree: &ControlTree,
    lookups: &LookupRegistry,
    scope: ControlId,
    path: &str,
) -> TokenPlan {
    if let Some(id) = locate(tree, scope, path) {
        let n = tree.leaf(id).map(|l| coerce_number(&l.value)).unwrap_or(0.0);
        return TokenPlan::Scalar(Operand::Ready(n));
    }

    let Some((root, rest)) = path.split_once('.') else {
        debug!(path, "formula path does not resolve");
        return TokenPlan::Scalar(Operand::Ready(0.0));
    };
    let Some(root_id) = locate(tree, scope, root) else {
        debug!(path, "formula root does not resolve");
        return TokenPlan::Scalar(Operand::Ready(0.0));
    };

    if let Some(operand) = lookup_operand(tree, lookups, root_id, rest) {
        return TokenPlan::Scalar(operand);
    }

    match tree.node(root_id).map(|n| &n.control) {
        Some(Control::Array(array)) => TokenPlan::Column {
            array: root_id,
            cells: array
                .rows
                .iter()
                .map(|row| plan_in_row(tree, lookups, row.group, rest))
                .collect(),
        },
        _ => TokenPlan::Scalar(Operand::Ready(0.0)),
    }
}

/// Operand for `rest` inside one row. Nested repeating arrays are not
/// aggregated; such a segment reads as `0`.
fn plan_in_row(
    tree: &ControlTree,
    lookups: &LookupRegistry,
    row: ControlId,
    rest: &str,
) -> Operand {
    if let Some(id) = tree.find(row, rest) {
        return Operand::Ready(tree.leaf(id).map(|l| coerce_number(&l.value)).unwrap_or(0.0));
    }
    rest.split_once('.')
        .and_then(|(root, inner)| {
            let root_id = tree.child(row, root)?;
            lookup_operand(tree, lookups, root_id, inner)
        })
        .unwrap_or(Operand::Ready(0.0))
}

/// Lookup operand when `root_id` is a leaf whose schema names a resolver.
/// An empty raw value short-circuits to `0` without calling the resolver.
fn lookup_operand(
    tree: &ControlTree,
    lookups: &LookupRegistry,
    root_id: ControlId,
    rest: &str,
) -> Option<Operand> {
    let resolver_name = tree.schema(root_id)?.lookup.clone()?;
    let leaf = tree.leaf(root_id)?;
    if leaf.value.is_null() || leaf.value == Value::String(String::new()) {
        return Some(Operand::Ready(0.0));
    }
    let Some(resolver) = lookups.get(&resolver_name) else {
        debug!(resolver = %resolver_name, "lookup resolver not registered");
        return Some(Operand::Ready(0.0));
    };
    Some(Operand::Lookup {
        resolver_name,
        resolver,
        raw: leaf.value.clone(),
        rest: rest.to_string(),
    })
}

// ============================================================================
// Async resolution
// ============================================================================

/// Await an operand. Missing record segments read as `0`; resolver failures
/// and timeouts are errors.
pub async fn resolve_operand(
    operand: &Operand,
    timeout: Option<Duration>,
) -> Result<f64, FormulaError> {
    match operand {
        Operand::Ready(n) => Ok(*n),
        Operand::Lookup {
            resolver_name,
            resolver,
            raw,
            rest,
        } => {
            let call = resolver.resolve(raw);
            let result = match timeout {
                Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                    FormulaError::LookupTimeout {
                        resolver: resolver_name.clone(),
                        timeout_ms: limit.as_millis() as u64,
                    }
                })?,
                None => call.await,
            };
            let record = result.map_err(|e| FormulaError::Lookup {
                resolver: resolver_name.clone(),
                reason: e.to_string(),
            })?;
            Ok(record
                .as_ref()
                .and_then(|r| project(r, rest))
                .map(coerce_number)
                .unwrap_or(0.0))
        }
    }
}

/// Await a whole token plan, summing columns.
pub async fn resolve_plan(
    plan: &TokenPlan,
    timeout: Option<Duration>,
) -> Result<f64, FormulaError> {
    match plan {
        TokenPlan::Scalar(operand) => resolve_operand(operand, timeout).await,
        TokenPlan::Column { cells, .. } => {
            let mut sum = 0.0;
            for cell in cells {
                sum += resolve_operand(cell, timeout).await?;
            }
            Ok(sum)
        }
    }
}

// ============================================================================
// Recompute plans
// ============================================================================

/// Everything one recompute needs, captured from the tree synchronously so the
/// async part owns its inputs.
#[derive(Debug, Clone)]
pub struct RecomputePlan {
    pub formula: FormulaId,
    pub target: ControlId,
    pub expression: String,
    pub tokens: Vec<(String, TokenPlan)>,
    pub timeout: Option<Duration>,
}

/// Result of one recompute, applied back to the tree by the form.
#[derive(Debug, Clone, PartialEq)]
pub struct RecomputeOutcome {
    pub formula: FormulaId,
    pub target: ControlId,
    pub result: Result<f64, FormulaError>,
}

impl RecomputePlan {
    pub fn capture(
        tree: &ControlTree,
        lookups: &LookupRegistry,
        formula: &Formula,
        timeout: Option<Duration>,
    ) -> Self {
        let tokens = formula
            .paths
            .iter()
            .map(|path| (path.clone(), plan_token(tree, lookups, formula.scope, path)))
            .collect();
        Self {
            formula: formula.id,
            target: formula.target,
            expression: formula.expression.clone(),
            tokens,
            timeout,
        }
    }

    /// Resolve every token and evaluate. When all column tokens come from one
    /// array, top-level terms that reference a column are evaluated per row and
    /// summed while the other terms count once; otherwise each column
    /// collapses to its sum first.
    pub async fn execute(self) -> RecomputeOutcome {
        let result = self.evaluate().await;
        RecomputeOutcome {
            formula: self.formula,
            target: self.target,
            result,
        }
    }

    async fn evaluate(&self) -> Result<f64, FormulaError> {
        let arrays: BTreeSet<ControlId> = self
            .tokens
            .iter()
            .filter_map(|(_, plan)| match plan {
                TokenPlan::Column { array, .. } => Some(*array),
                TokenPlan::Scalar(_) => None,
            })
            .collect();

        let mut scalars = HashMap::new();
        for (path, plan) in &self.tokens {
            if arrays.len() == 1 && matches!(plan, TokenPlan::Column { .. }) {
                continue;
            }
            scalars.insert(path.clone(), resolve_plan(plan, self.timeout).await?);
        }
        if arrays.len() != 1 {
            return expr::evaluate(&self.expression, &scalars);
        }

        let text = expr::substitute(&self.expression, &scalars);
        if !expr::is_safe(&text) {
            return Err(FormulaError::UnsafeExpression(text));
        }

        let mut columns: Vec<(&String, Vec<f64>)> = Vec::new();
        for (path, plan) in &self.tokens {
            if let TokenPlan::Column { cells, .. } = plan {
                let mut values = Vec::with_capacity(cells.len());
                for cell in cells {
                    values.push(resolve_operand(cell, self.timeout).await?);
                }
                columns.push((path, values));
            }
        }
        let rows = columns.iter().map(|(_, cells)| cells.len()).max().unwrap_or(0);

        let mut total = 0.0;
        for (sign, term) in expr::split_terms(&self.expression) {
            let row_wise = expr::extract_paths(&term)
                .iter()
                .any(|p| columns.iter().any(|(column, _)| *column == p));
            if !row_wise {
                total += sign * expr::evaluate(&term, &scalars)?;
                continue;
            }
            for row in 0..rows {
                let mut values = scalars.clone();
                for (path, cells) in &columns {
                    values.insert((*path).clone(), cells.get(row).copied().unwrap_or(0.0));
                }
                total += sign * expr::evaluate(&term, &values)?;
            }
        }
        if total.is_finite() {
            Ok(total)
        } else {
            Err(FormulaError::NonFinite)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build;
    use crate::schema::FieldSchema;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing;

    #[async_trait]
    impl LookupResolver for Failing {
        async fn resolve(&self, _raw: &Value) -> anyhow::Result<Option<Value>> {
            anyhow::bail!("backend unavailable")
        }
    }

    struct Slow;

    #[async_trait]
    impl LookupResolver for Slow {
        async fn resolve(&self, _raw: &Value) -> anyhow::Result<Option<Value>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl LookupResolver for Counting {
        async fn resolve(&self, _raw: &Value) -> anyhow::Result<Option<Value>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(json!({"price": 4})))
        }
    }

    fn plans() -> Arc<dyn LookupResolver> {
        Arc::new(
            StaticLookup::new()
                .with("basic", json!({"unit_price": 10, "meta": {"tier": 1}}))
                .with("pro", json!({"unit_price": 25})),
        )
    }

    fn sample_tree() -> ControlTree {
        let schemas: Vec<Arc<FieldSchema>> = vec![
            FieldSchema::input("plan_id").with_lookup("plans"),
            FieldSchema::input("qty"),
            FieldSchema::array(
                "items",
                vec![
                    FieldSchema::input("qty"),
                    FieldSchema::input("price"),
                    FieldSchema::input("plan").with_lookup("plans"),
                ],
            ),
        ]
        .into_iter()
        .map(Arc::new)
        .collect();
        build(
            &schemas,
            &json!({
                "plan_id": "basic",
                "qty": 9,
                "items": [
                    {"qty": 2, "price": 3, "plan": "pro"},
                    {"qty": "1", "price": 5}
                ]
            }),
            &Value::Null,
        )
        .unwrap()
    }

    async fn resolve(
        tree: &ControlTree,
        lookups: &LookupRegistry,
        scope: ControlId,
        path: &str,
    ) -> f64 {
        resolve_plan(&plan_token(tree, lookups, scope, path), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_direct_and_lookup_resolution() {
        let tree = sample_tree();
        let lookups = LookupRegistry::new().with("plans", plans());
        let root = tree.root();

        assert_eq!(resolve(&tree, &lookups, root, "qty").await, 9.0);
        assert_eq!(resolve(&tree, &lookups, root, "plan_id.unit_price").await, 10.0);
        assert_eq!(resolve(&tree, &lookups, root, "plan_id.meta.tier").await, 1.0);
        assert_eq!(resolve(&tree, &lookups, root, "plan_id.missing").await, 0.0);
        assert_eq!(resolve(&tree, &lookups, root, "nothing.here").await, 0.0);
        assert_eq!(resolve(&tree, &lookups, root, "items.0.price").await, 3.0);
    }

    #[tokio::test]
    async fn test_array_column_sums() {
        let tree = sample_tree();
        let lookups = LookupRegistry::new().with("plans", plans());
        let root = tree.root();

        assert_eq!(resolve(&tree, &lookups, root, "items.qty").await, 3.0);
        assert_eq!(resolve(&tree, &lookups, root, "items.price").await, 8.0);
        // Row lookups: "pro" → 25, second row has no plan → 0.
        assert_eq!(resolve(&tree, &lookups, root, "items.plan.unit_price").await, 25.0);
    }

    #[tokio::test]
    async fn test_local_scope_preferred() {
        let tree = sample_tree();
        let lookups = LookupRegistry::new().with("plans", plans());
        let row = tree.find(tree.root(), "items.1").unwrap();

        assert_eq!(resolve(&tree, &lookups, row, "qty").await, 1.0);
        // Not in the row: falls back to the root.
        assert_eq!(resolve(&tree, &lookups, row, "plan_id.unit_price").await, 10.0);
    }

    #[tokio::test]
    async fn test_lookup_failure_and_timeout() {
        let tree = sample_tree();
        let root = tree.root();

        let lookups = LookupRegistry::new().with("plans", Arc::new(Failing));
        let plan = plan_token(&tree, &lookups, root, "plan_id.unit_price");
        assert!(matches!(
            resolve_plan(&plan, None).await,
            Err(FormulaError::Lookup { .. })
        ));

        let lookups = LookupRegistry::new().with("plans", Arc::new(Slow));
        let plan = plan_token(&tree, &lookups, root, "plan_id.unit_price");
        assert!(matches!(
            resolve_plan(&plan, Some(Duration::from_millis(20))).await,
            Err(FormulaError::LookupTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_raw_value_skips_resolver() {
        let schemas = vec![Arc::new(FieldSchema::input("plan").with_lookup("plans"))];
        let tree = build(&schemas, &json!({"plan": ""}), &Value::Null).unwrap();
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let lookups = LookupRegistry::new().with("plans", counting.clone());

        assert_eq!(resolve(&tree, &lookups, tree.root(), "plan.price").await, 0.0);
        assert_eq!(counting.0.load(Ordering::SeqCst), 0);
    }

    fn recompute_plan(tree: &ControlTree, expression: &str) -> RecomputePlan {
        let lookups = LookupRegistry::new();
        let paths = expr::extract_paths(expression);
        RecomputePlan {
            formula: FormulaId::from_raw(1),
            target: tree.find(tree.root(), "total").unwrap(),
            expression: expression.into(),
            tokens: paths
                .iter()
                .map(|p| (p.clone(), plan_token(tree, &lookups, tree.root(), p)))
                .collect(),
            timeout: None,
        }
    }

    fn order_tree(data: Value) -> ControlTree {
        let schemas: Vec<Arc<FieldSchema>> = vec![
            FieldSchema::array(
                "items",
                vec![FieldSchema::input("qty"), FieldSchema::input("price")],
            ),
            FieldSchema::input("shipping"),
            FieldSchema::input("total"),
        ]
        .into_iter()
        .map(Arc::new)
        .collect();
        build(&schemas, &data, &Value::Null).unwrap()
    }

    #[tokio::test]
    async fn test_row_wise_evaluation() {
        let tree = order_tree(json!({
            "items": [{"qty": 2, "price": 3}, {"qty": 1, "price": 5}]
        }));
        let plan = recompute_plan(&tree, "items.qty * items.price");
        assert_eq!(plan.execute().await.result, Ok(11.0));
    }

    #[tokio::test]
    async fn test_scalar_terms_count_once() {
        let tree = order_tree(json!({
            "items": [{"qty": 2, "price": 3}, {"qty": 1, "price": 5}],
            "shipping": 10
        }));
        let plan = recompute_plan(&tree, "items.qty + shipping");
        assert_eq!(plan.execute().await.result, Ok(13.0));
        let plan = recompute_plan(&tree, "items.qty * items.price + shipping - 1");
        assert_eq!(plan.execute().await.result, Ok(20.0));
        let plan = recompute_plan(&tree, "shipping - items.qty * items.price");
        assert_eq!(plan.execute().await.result, Ok(-1.0));

        let empty = order_tree(json!({"items": [], "shipping": 10}));
        let plan = recompute_plan(&empty, "items.qty * items.price + shipping");
        assert_eq!(plan.execute().await.result, Ok(10.0));
    }

    #[test]
    fn test_locate_walks_out_to_row() {
        let schemas: Vec<Arc<FieldSchema>> = vec![
            FieldSchema::input("qty"),
            FieldSchema::input("rate"),
            FieldSchema::array(
                "items",
                vec![
                    FieldSchema::input("qty"),
                    FieldSchema::group("calc", vec![FieldSchema::input("line")]),
                ],
            ),
        ]
        .into_iter()
        .map(Arc::new)
        .collect();
        let tree = build(
            &schemas,
            &json!({"qty": 9, "rate": 4, "items": [{"qty": 3}]}),
            &Value::Null,
        )
        .unwrap();
        let calc = tree.find(tree.root(), "items.0.calc").unwrap();

        assert_eq!(
            locate(&tree, calc, "qty"),
            tree.find(tree.root(), "items.0.qty")
        );
        assert_eq!(locate(&tree, calc, "rate"), tree.find(tree.root(), "rate"));
        assert_eq!(locate(&tree, calc, "missing"), None);
    }
}
