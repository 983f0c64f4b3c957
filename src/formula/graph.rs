//! Computation graph: formulas, their dependency subscriptions and the set of
//! recomputes currently in flight.
//!
//! ## Debounce
//!
//! Each formula carries `running` / `pending` flags. A trigger while running
//! only marks the formula pending; when the run completes a pending formula is
//! re-run exactly once, however many triggers arrived in between.
//!
//! ## Teardown
//!
//! Releasing a formula drops its subscriptions and aborts its in-flight
//! recompute before the next poll. A write-back that still slips through is
//! discarded because the formula id no longer resolves.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use futures::future::{AbortHandle, Abortable, BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use tracing::debug;

use crate::formula::expr::{extract_expression, extract_paths, root_names};
use crate::formula::resolve::{locate, RecomputeOutcome};
use crate::tree::{ControlId, ControlTree, RowKey};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FormulaId(u64);

impl FormulaId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    /// Any value change at or beneath the control.
    Value,
    /// Rows added, removed or moved on an array control.
    Shape,
}

/// Per-formula counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FormulaStats {
    pub runs: u64,
    pub writes: u64,
    pub coalesced: u64,
    pub failures: u64,
}

#[derive(Debug, Clone)]
pub struct Formula {
    pub id: FormulaId,
    /// Leaf the result is written to.
    pub target: ControlId,
    /// Group the target lives in; paths resolve here first.
    pub scope: ControlId,
    pub row: Option<RowKey>,
    pub source: String,
    pub expression: String,
    pub paths: Vec<String>,
    pub roots: BTreeSet<String>,
    pub stats: FormulaStats,
    running: bool,
    pending: bool,
}

impl Formula {
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencySubscription {
    pub formula: FormulaId,
    pub control: ControlId,
    pub kind: SubscriptionKind,
}

// ============================================================================
// Graph
// ============================================================================

#[derive(Default)]
pub struct ComputationGraph {
    formulas: BTreeMap<FormulaId, Formula>,
    subscriptions: HashMap<(ControlId, SubscriptionKind), BTreeSet<FormulaId>>,
    by_formula: HashMap<FormulaId, Vec<(ControlId, SubscriptionKind)>>,
    by_target: HashMap<ControlId, FormulaId>,
    in_flight: FuturesUnordered<BoxFuture<'static, Option<RecomputeOutcome>>>,
    aborts: HashMap<FormulaId, AbortHandle>,
    next_id: u64,
}

impl ComputationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the formula declared on `target`'s schema and subscribe it to
    /// every root it references. Returns `None` when the leaf has no formula
    /// or the text is not of the `{expression}` form.
    pub fn attach(&mut self, tree: &ControlTree, target: ControlId) -> Option<FormulaId> {
        if let Some(existing) = self.by_target.get(&target) {
            return Some(*existing);
        }
        let source = tree.schema(target)?.formula.clone()?;
        let Some(expression) = extract_expression(&source).map(str::to_string) else {
            debug!(path = %tree.path_of(target), formula = %source, "not a formula expression");
            return None;
        };
        let scope = tree.parent(target)?;
        let paths = extract_paths(&expression);
        let roots = root_names(&paths);

        self.next_id += 1;
        let id = FormulaId(self.next_id);

        let mut subs = Vec::new();
        for root in &roots {
            let Some(control) = locate(tree, scope, root) else {
                debug!(formula = ?id, root = %root, "formula root not found, not subscribed");
                continue;
            };
            subs.push((control, SubscriptionKind::Value));
            if tree.array(control).is_some() {
                subs.push((control, SubscriptionKind::Shape));
            }
        }
        for key in &subs {
            self.subscriptions.entry(*key).or_default().insert(id);
        }

        debug!(
            formula = ?id,
            path = %tree.path_of(target),
            expression = %expression,
            subscriptions = subs.len(),
            "formula attached"
        );

        self.by_formula.insert(id, subs);
        self.by_target.insert(target, id);
        self.formulas.insert(
            id,
            Formula {
                id,
                target,
                scope,
                row: tree.enclosing_row(target),
                source,
                expression,
                paths,
                roots,
                stats: FormulaStats::default(),
                running: false,
                pending: false,
            },
        );
        Some(id)
    }

    /// Attach every formula beneath `root`.
    pub fn attach_subtree(&mut self, tree: &ControlTree, root: ControlId) -> Vec<FormulaId> {
        tree.leaves(root)
            .into_iter()
            .filter(|leaf| tree.schema(*leaf).is_some_and(|s| s.formula.is_some()))
            .filter_map(|leaf| self.attach(tree, leaf))
            .collect()
    }

    /// Drop a formula and all of its subscriptions.
    pub fn release(&mut self, id: FormulaId) -> Option<Formula> {
        let formula = self.formulas.remove(&id)?;
        for key in self.by_formula.remove(&id).unwrap_or_default() {
            if let Some(set) = self.subscriptions.get_mut(&key) {
                set.remove(&id);
                if set.is_empty() {
                    self.subscriptions.remove(&key);
                }
            }
        }
        self.by_target.remove(&formula.target);
        if let Some(handle) = self.aborts.remove(&id) {
            handle.abort();
        }
        debug!(formula = ?id, "formula released");
        Some(formula)
    }

    /// Release formulas targeting any of `controls` and drop every other
    /// subscription pointing at them.
    pub fn release_controls(&mut self, controls: &HashSet<ControlId>) -> Vec<FormulaId> {
        let doomed: Vec<FormulaId> = self
            .formulas
            .values()
            .filter(|f| controls.contains(&f.target) || controls.contains(&f.scope))
            .map(|f| f.id)
            .collect();
        for id in &doomed {
            self.release(*id);
        }

        self.subscriptions.retain(|(control, _), _| !controls.contains(control));
        for subs in self.by_formula.values_mut() {
            subs.retain(|(control, _)| !controls.contains(control));
        }
        doomed
    }

    /// Formulas subscribed to `control` for `kind`, minus `origin`.
    pub fn triggered_by(
        &self,
        control: ControlId,
        kind: SubscriptionKind,
        origin: Option<FormulaId>,
    ) -> Vec<FormulaId> {
        self.subscriptions
            .get(&(control, kind))
            .map(|set| set.iter().copied().filter(|id| Some(*id) != origin).collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Claim a run. Returns `false` when the formula is unknown or already
    /// running, in which case it is marked pending.
    pub fn begin(&mut self, id: FormulaId) -> bool {
        let Some(formula) = self.formulas.get_mut(&id) else {
            return false;
        };
        if formula.running {
            formula.pending = true;
            formula.stats.coalesced += 1;
            return false;
        }
        formula.running = true;
        formula.stats.runs += 1;
        true
    }

    /// Track a recompute future for `id`.
    pub fn spawn(&mut self, id: FormulaId, fut: BoxFuture<'static, RecomputeOutcome>) {
        let (handle, registration) = AbortHandle::new_pair();
        self.aborts.insert(id, handle);
        self.in_flight
            .push(Abortable::new(fut, registration).map(Result::ok).boxed());
    }

    /// Mark a run complete. Returns `true` when a follow-up run is owed.
    pub fn finish(&mut self, id: FormulaId) -> bool {
        let Some(formula) = self.formulas.get_mut(&id) else {
            return false;
        };
        formula.running = false;
        std::mem::take(&mut formula.pending)
    }

    pub fn record_write(&mut self, id: FormulaId) {
        if let Some(formula) = self.formulas.get_mut(&id) {
            formula.stats.writes += 1;
        }
    }

    pub fn record_failure(&mut self, id: FormulaId) {
        if let Some(formula) = self.formulas.get_mut(&id) {
            formula.stats.failures += 1;
        }
    }

    /// Next completed recompute, or `None` when nothing is in flight.
    /// Aborted recomputes are skipped.
    pub async fn next_outcome(&mut self) -> Option<RecomputeOutcome> {
        while let Some(done) = self.in_flight.next().await {
            if let Some(outcome) = done {
                self.aborts.remove(&outcome.formula);
                return Some(outcome);
            }
        }
        None
    }

    /// Drop every in-flight recompute and clear run flags.
    pub fn abort_all(&mut self) -> usize {
        let dropped = self.in_flight.len();
        self.in_flight = FuturesUnordered::new();
        self.aborts.clear();
        for formula in self.formulas.values_mut() {
            formula.running = false;
            formula.pending = false;
        }
        dropped
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn formula(&self, id: FormulaId) -> Option<&Formula> {
        self.formulas.get(&id)
    }

    pub fn formula_for(&self, target: ControlId) -> Option<&Formula> {
        self.formulas.get(self.by_target.get(&target)?)
    }

    pub fn formulas(&self) -> impl Iterator<Item = &Formula> {
        self.formulas.values()
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.values().map(BTreeSet::len).sum()
    }

    pub fn subscriptions(&self) -> Vec<DependencySubscription> {
        let mut out: Vec<_> = self
            .subscriptions
            .iter()
            .flat_map(|((control, kind), set)| {
                set.iter().map(|formula| DependencySubscription {
                    formula: *formula,
                    control: *control,
                    kind: *kind,
                })
            })
            .collect();
        out.sort_by_key(|s| (s.formula, s.control, s.kind));
        out
    }

    /// Groups of formulas that feed each other in a loop. A formula writing a
    /// control at or beneath one another formula subscribes to is an edge.
    pub fn cycles(&self, tree: &ControlTree) -> Vec<Vec<FormulaId>> {
        let mut graph: DiGraph<FormulaId, ()> = DiGraph::new();
        let index: HashMap<FormulaId, NodeIndex> = self
            .formulas
            .keys()
            .map(|id| (*id, graph.add_node(*id)))
            .collect();

        for writer in self.formulas.values() {
            for ((control, kind), readers) in &self.subscriptions {
                if *kind != SubscriptionKind::Value || !tree.is_within(writer.target, *control) {
                    continue;
                }
                for reader in readers {
                    if *reader != writer.id {
                        graph.add_edge(index[&writer.id], index[reader], ());
                    }
                }
            }
        }

        tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .map(|scc| {
                let mut ids: Vec<FormulaId> = scc.into_iter().map(|n| graph[n]).collect();
                ids.sort();
                ids
            })
            .collect()
    }
}

impl std::fmt::Debug for ComputationGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationGraph")
            .field("formulas", &self.formulas.len())
            .field("subscriptions", &self.subscription_count())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
