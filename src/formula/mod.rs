//! Computation Graph Engine
//!
//! - `expr`: `{expression}` parsing, path tokens and safe arithmetic
//! - `resolve`: path resolution, lookups and recompute plans
//! - `graph`: formulas, subscriptions, debounce and in-flight work

pub mod expr;
pub mod graph;
pub mod resolve;

pub use graph::{
    ComputationGraph, DependencySubscription, Formula, FormulaId, FormulaStats, SubscriptionKind,
};
pub use resolve::{LookupRegistry, LookupResolver, RecomputeOutcome, RecomputePlan, StaticLookup};
