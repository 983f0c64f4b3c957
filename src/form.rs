//! `Form`: the live form facade.
//!
//! Owns the control tree, the computation graph and the change emitter, and
//! wires them together:
//!
//! ```text
//! set_value ─► write leaf ─► emit change ─► notify subscribers ─► schedule
//!                  │                                                 │
//!                  └─► criteria pass (resets notify as well)          ▼
//! settle().await ◄──────────────── in-flight recomputes (FuturesUnordered)
//!        │
//!        └─► write-back ─► emit change ─► notify (minus the writer itself)
//! ```
//!
//! Host actions are synchronous and only schedule work; nothing is written by
//! a formula until `settle()` drives the in-flight set. Readers always see the
//! last committed value.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::builder::build;
use crate::config::FormConfig;
use crate::criteria::{apply_criteria, CriteriaOutcome};
use crate::error::{FormError, FormulaError};
use crate::events::{ChangeEmitter, ChangeEvent, ChangeReceiver, ChangeSource, EmitterStats};
use crate::formula::resolve::{plan_token, resolve_plan};
use crate::formula::{
    ComputationGraph, DependencySubscription, FormulaId, FormulaStats, LookupRegistry,
    RecomputeOutcome, RecomputePlan, SubscriptionKind,
};
use crate::schema::{validate_schemas, FieldSchema};
use crate::tree::{ControlId, ControlTree};
use crate::validators::ValidationError;
use crate::value::{number_value, values_equal};

/// Criteria resets only ever move values to `""`, so repeated passes settle
/// quickly; this bounds them regardless.
const MAX_CRITERIA_PASSES: usize = 16;

/// Result of one `settle()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SettleReport {
    /// Recomputes completed.
    pub recomputes: usize,
    /// Recomputes that changed their target.
    pub writes: usize,
    /// `false` when the recompute limit was hit and outstanding work dropped.
    pub converged: bool,
}

#[derive(Debug)]
pub struct Form {
    pub(crate) tree: ControlTree,
    pub(crate) graph: ComputationGraph,
    lookups: LookupRegistry,
    config: FormConfig,
    emitter: ChangeEmitter,
    receiver: ChangeReceiver,
}

impl Form {
    /// Build a form from schemas, initial data and a fallback record.
    ///
    /// Lookup names in the schemas must be registered in `lookups`. Initial
    /// criteria are applied and every formula is scheduled once; call
    /// `settle()` to let them land.
    pub fn open(
        schemas: &[Arc<FieldSchema>],
        data: &Value,
        fallback: &Value,
        lookups: LookupRegistry,
        config: FormConfig,
    ) -> Result<Self, FormError> {
        validate_schemas(schemas, &|name| lookups.contains(name))?;
        let tree = build(schemas, data, fallback)?;

        let (emitter, receiver) = if config.events_enabled {
            ChangeEmitter::new(config.event_buffer)
        } else {
            ChangeEmitter::disabled()
        };

        let mut form = Self {
            tree,
            graph: ComputationGraph::new(),
            lookups,
            config,
            emitter,
            receiver,
        };

        form.run_criteria();

        let root = form.tree.root();
        let attached = form.graph.attach_subtree(&form.tree, root);
        for cycle in form.formula_cycles() {
            warn!(formulas = ?cycle, "formula dependency cycle detected");
        }
        for id in &attached {
            form.schedule(*id);
        }

        info!(
            controls = form.tree.len(),
            formulas = attached.len(),
            "form opened"
        );
        Ok(form)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Committed values as a plain nested record.
    pub fn value(&self) -> Value {
        self.tree.snapshot(self.tree.root())
    }

    /// Committed value at `path` (a leaf value, or a nested record).
    pub fn get(&self, path: &str) -> Result<Value, FormError> {
        Ok(self.tree.snapshot(self.control(path)?))
    }

    /// A leaf's active flag. Groups and arrays are active while any leaf
    /// beneath them is.
    pub fn is_active(&self, path: &str) -> Result<bool, FormError> {
        let id = self.control(path)?;
        if let Some(leaf) = self.tree.leaf(id) {
            return Ok(leaf.active);
        }
        let leaves = self.tree.leaves(id);
        Ok(leaves.is_empty()
            || leaves
                .iter()
                .any(|l| self.tree.leaf(*l).is_some_and(|leaf| leaf.active)))
    }

    /// All active leaves pass their validators.
    pub fn is_valid(&self) -> bool {
        self.tree
            .leaves(self.tree.root())
            .into_iter()
            .filter_map(|id| self.tree.leaf(id))
            .all(|leaf| leaf.errors().is_empty())
    }

    /// Validation errors keyed by leaf path. Inactive leaves never appear.
    pub fn errors(&self) -> BTreeMap<String, Vec<ValidationError>> {
        self.tree
            .leaves(self.tree.root())
            .into_iter()
            .filter_map(|id| {
                let errors = self.tree.leaf(id)?.errors();
                (!errors.is_empty()).then(|| (self.tree.path_of(id), errors))
            })
            .collect()
    }

    pub fn field_errors(&self, path: &str) -> Result<Vec<ValidationError>, FormError> {
        let id = self.control(path)?;
        self.tree
            .leaf(id)
            .map(|leaf| leaf.errors())
            .ok_or_else(|| FormError::NotALeaf(path.to_string()))
    }

    pub fn tree(&self) -> &ControlTree {
        &self.tree
    }

    pub fn config(&self) -> &FormConfig {
        &self.config
    }

    /// Receiver for change notifications. Clones share one queue.
    pub fn change_receiver(&self) -> ChangeReceiver {
        self.receiver.clone()
    }

    pub fn emitter_stats(&self) -> EmitterStats {
        self.emitter.stats()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// User edit of a leaf. Notifies dependents and re-applies criteria.
    pub fn set_value(&mut self, path: &str, value: Value) -> Result<(), FormError> {
        let id = self.control(path)?;
        if self.tree.leaf(id).is_none() {
            return Err(FormError::NotALeaf(path.to_string()));
        }
        if self.write_leaf(id, value, ChangeSource::User, None) {
            self.run_criteria();
        }
        Ok(())
    }

    /// Re-apply criteria across the whole tree.
    pub fn refresh_criteria(&mut self) {
        self.run_criteria();
    }

    /// Explicitly trigger the formula on `path`. Returns `false` when the leaf
    /// has no formula.
    pub fn recompute(&mut self, path: &str) -> Result<bool, FormError> {
        let id = self.control(path)?;
        if self.tree.leaf(id).is_none() {
            return Err(FormError::NotALeaf(path.to_string()));
        }
        match self.graph.formula_for(id).map(|f| f.id) {
            Some(fid) => {
                self.schedule(fid);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drive in-flight recomputes to completion, applying write-backs in
    /// completion order. Write-backs may schedule further recomputes; the pass
    /// ends when nothing is in flight or the configured limit is reached.
    pub async fn settle(&mut self) -> SettleReport {
        let mut report = SettleReport {
            converged: true,
            ..Default::default()
        };
        while let Some(outcome) = self.graph.next_outcome().await {
            report.recomputes += 1;
            if self.complete(outcome) {
                report.writes += 1;
            }
            if report.recomputes >= self.config.max_recomputes_per_settle
                && self.graph.in_flight() > 0
            {
                let dropped = self.graph.abort_all();
                warn!(
                    limit = self.config.max_recomputes_per_settle,
                    dropped, "settle did not converge, outstanding recomputes dropped"
                );
                report.converged = false;
                break;
            }
        }
        debug!(?report, "settled");
        report
    }

    /// Resolve a formula path against the root scope, as a formula would.
    pub async fn resolve(&self, path: &str) -> Result<f64, FormulaError> {
        let plan = plan_token(&self.tree, &self.lookups, self.tree.root(), path);
        resolve_plan(&plan, self.config.lookup_timeout).await
    }

    /// Resolve a formula path from inside the group at `scope` (e.g. a row,
    /// `items.0`), falling back to the root.
    pub async fn resolve_in(&self, scope: &str, path: &str) -> Result<f64, FormError> {
        let scope = self.control(scope)?;
        let plan = plan_token(&self.tree, &self.lookups, scope, path);
        // Lookup failures read as 0, the same as inside a formula.
        Ok(resolve_plan(&plan, self.config.lookup_timeout)
            .await
            .unwrap_or(0.0))
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn formula_stats(&self, path: &str) -> Option<FormulaStats> {
        let id = self.tree.find(self.tree.root(), path)?;
        self.graph.formula_for(id).map(|f| f.stats)
    }

    pub fn formula_count(&self) -> usize {
        self.graph.len()
    }

    pub fn subscriptions(&self) -> Vec<DependencySubscription> {
        self.graph.subscriptions()
    }

    pub fn subscription_count(&self) -> usize {
        self.graph.subscription_count()
    }

    pub fn in_flight(&self) -> usize {
        self.graph.in_flight()
    }

    /// Dependency cycles between formulas, by target path.
    pub fn formula_cycles(&self) -> Vec<Vec<String>> {
        self.graph
            .cycles(&self.tree)
            .into_iter()
            .map(|cycle| {
                cycle
                    .into_iter()
                    .filter_map(|id| self.graph.formula(id))
                    .map(|f| self.tree.path_of(f.target))
                    .collect()
            })
            .collect()
    }

    /// Release every formula and drop in-flight work. The values stay
    /// readable; nothing recomputes afterwards.
    pub fn teardown(&mut self) {
        let dropped = self.graph.abort_all();
        let ids: Vec<FormulaId> = self.graph.formulas().map(|f| f.id).collect();
        for id in &ids {
            self.graph.release(*id);
        }
        debug!(formulas = ids.len(), dropped, "form torn down");
    }

    // ========================================================================
    // Internals
    // ========================================================================

    pub(crate) fn control(&self, path: &str) -> Result<ControlId, FormError> {
        self.tree
            .find(self.tree.root(), path)
            .ok_or_else(|| FormError::UnknownPath(path.to_string()))
    }

    /// Write a leaf if the value differs. Returns whether it changed.
    fn write_leaf(
        &mut self,
        id: ControlId,
        value: Value,
        source: ChangeSource,
        origin: Option<FormulaId>,
    ) -> bool {
        let Some(leaf) = self.tree.leaf_mut(id) else {
            return false;
        };
        if values_equal(&leaf.value, &value) {
            return false;
        }
        let old = std::mem::replace(&mut leaf.value, value.clone());
        self.emitter
            .emit(ChangeEvent::value(self.tree.path_of(id), source, old, value));
        self.notify_value(id, origin);
        true
    }

    /// Value changes bubble: subscribers of the control and of every ancestor
    /// are triggered, except the formula that made the write.
    fn notify_value(&mut self, id: ControlId, origin: Option<FormulaId>) {
        let mut triggered = BTreeSet::new();
        for control in std::iter::once(id).chain(self.tree.ancestors(id)) {
            triggered.extend(
                self.graph
                    .triggered_by(control, SubscriptionKind::Value, origin),
            );
        }
        for fid in triggered {
            self.schedule(fid);
        }
    }

    /// Rows added, removed or moved on `array`.
    pub(crate) fn notify_shape(&mut self, array: ControlId) {
        let rows = self.tree.array(array).map_or(0, |a| a.rows.len());
        self.emitter
            .emit(ChangeEvent::shape(self.tree.path_of(array), rows));

        let mut triggered: BTreeSet<FormulaId> = self
            .graph
            .triggered_by(array, SubscriptionKind::Shape, None)
            .into_iter()
            .collect();
        for control in std::iter::once(array).chain(self.tree.ancestors(array)) {
            triggered.extend(self.graph.triggered_by(control, SubscriptionKind::Value, None));
        }
        for fid in triggered {
            self.schedule(fid);
        }
    }

    /// Criteria passes over the whole tree until nothing changes.
    pub(crate) fn run_criteria(&mut self) {
        let root = self.tree.root();
        for _ in 0..MAX_CRITERIA_PASSES {
            let mut out = CriteriaOutcome::default();
            apply_criteria(&mut self.tree, root, &mut out);
            if out.is_empty() {
                return;
            }
            self.publish_criteria(out);
        }
        warn!("criteria passes did not settle");
    }

    fn publish_criteria(&mut self, out: CriteriaOutcome) {
        for (id, active) in out.toggled {
            self.emitter
                .emit(ChangeEvent::activation(self.tree.path_of(id), active));
            if active {
                if let Some(fid) = self.graph.formula_for(id).map(|f| f.id) {
                    self.schedule(fid);
                }
            }
        }
        for (id, old) in out.resets {
            let new = self
                .tree
                .leaf(id)
                .map(|l| l.value.clone())
                .unwrap_or(Value::Null);
            self.emitter.emit(ChangeEvent::value(
                self.tree.path_of(id),
                ChangeSource::Criteria,
                old,
                new,
            ));
            self.notify_value(id, None);
        }
    }

    /// Start a recompute, or mark it pending if one is already in flight.
    pub(crate) fn schedule(&mut self, id: FormulaId) {
        if !self.graph.begin(id) {
            return;
        }
        let Some(formula) = self.graph.formula(id) else {
            return;
        };
        let plan = RecomputePlan::capture(
            &self.tree,
            &self.lookups,
            formula,
            self.config.lookup_timeout,
        );
        self.graph.spawn(id, plan.execute().boxed());
    }

    /// Apply one finished recompute, then run the coalesced follow-up if one
    /// is owed. Returns whether the target changed.
    fn complete(&mut self, outcome: RecomputeOutcome) -> bool {
        let formula = outcome.formula;
        let rerun = self.graph.finish(formula);
        let written = self.write_back(outcome);
        if rerun {
            self.schedule(formula);
        }
        written
    }

    fn write_back(&mut self, outcome: RecomputeOutcome) -> bool {
        let RecomputeOutcome {
            formula,
            target,
            result,
        } = outcome;

        if self.graph.formula(formula).is_none() {
            debug!(formula = ?formula, "late write-back for released formula ignored");
            return false;
        }
        let Some(leaf) = self.tree.leaf(target) else {
            debug!(formula = ?formula, "late write-back for removed control ignored");
            return false;
        };
        if !leaf.active {
            return false;
        }

        let value = match result {
            Ok(n) => number_value(n),
            Err(e) => {
                warn!(
                    formula = ?formula,
                    path = %self.tree.path_of(target),
                    error = %e,
                    "formula evaluation failed"
                );
                self.graph.record_failure(formula);
                Value::Null
            }
        };
        let changed = self.write_leaf(target, value, ChangeSource::Formula, Some(formula));
        if changed {
            self.graph.record_write(formula);
            self.run_criteria();
        }
        changed
    }
}
