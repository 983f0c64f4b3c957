//! formflow: schema-driven reactive form core
//!
//! Turns declarative field schemas plus initial data into a live control tree
//! and keeps it consistent while a host edits it:
//! - Control tree builder (data → fallback → default → empty policy)
//! - Criteria activation (conditional fields, subtree silencing)
//! - Computation graph (`{expression}` formulas, async lookups, safe
//!   arithmetic, per-formula debounce, dependency subscriptions)
//! - Row/array manager (add, remove, move rows with stable keys)
//! - Change notifications keyed by path
//!
//! Rendering, persistence and step orchestration belong to the host.
//!
//! ```ignore
//! let schemas = parse_schema_yaml(SCHEMA)?;
//! let lookups = LookupRegistry::new().with("plans", Arc::new(PlanService::new()));
//! let mut form = Form::open(&schemas, &data, &Value::Null, lookups, FormConfig::default())?;
//!
//! form.set_value("plan_id", json!("pro"))?;
//! form.settle().await;
//! println!("{}", form.value());
//! ```

pub mod builder;
pub mod config;
pub mod criteria;
pub mod error;
pub mod events;
pub mod form;
pub mod formula;
pub mod rows;
pub mod schema;
pub mod tree;
pub mod validators;
pub mod value;

// Re-export commonly used types
pub use config::FormConfig;
pub use error::{FormError, FormulaError, SchemaError};
pub use events::{ChangeEvent, ChangeKind, ChangeReceiver, ChangeSource, EmitterStats};
pub use form::{Form, SettleReport};
pub use formula::{
    DependencySubscription, FormulaStats, LookupRegistry, LookupResolver, StaticLookup,
    SubscriptionKind,
};
pub use schema::{
    parse_schema_json, parse_schema_yaml, Criteria, FieldKind, FieldSchema, InputKind,
    ValueEmptyPolicy,
};
pub use tree::{ControlId, ControlTree, RowKey};
pub use validators::{ValidationError, Validator};
