//! Lookup-backed formulas and change notifications.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use formflow::{
    ChangeKind, ChangeSource, FieldSchema, Form, FormConfig, LookupRegistry, LookupResolver,
    StaticLookup, SubscriptionKind,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn plans() -> Arc<StaticLookup> {
    Arc::new(
        StaticLookup::new()
            .with("basic", json!({"unit_price": 10, "limits": {"seats": 5}}))
            .with("pro", json!({"unit_price": 25, "limits": {"seats": 50}})),
    )
}

fn pricing_schemas() -> Vec<Arc<FieldSchema>> {
    vec![
        FieldSchema::input("plan_id").with_lookup("plans"),
        FieldSchema::input("qty").with_default(json!(1)),
        FieldSchema::input("total").with_formula("{plan_id.unit_price * qty}"),
        FieldSchema::input("seats").with_formula("{plan_id.limits.seats}"),
    ]
    .into_iter()
    .map(Arc::new)
    .collect()
}

/// Resolver that sleeps before answering.
struct Delayed {
    delay: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl LookupResolver for Delayed {
    async fn resolve(&self, raw: &Value) -> anyhow::Result<Option<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(raw.as_str().map(|s| json!({"unit_price": s.len()})))
    }
}

struct Broken;

#[async_trait]
impl LookupResolver for Broken {
    async fn resolve(&self, _raw: &Value) -> anyhow::Result<Option<Value>> {
        anyhow::bail!("pricing service unavailable")
    }
}

#[tokio::test]
async fn test_lookup_formula_follows_selection() {
    let lookups = LookupRegistry::new().with("plans", plans());
    let mut form = Form::open(
        &pricing_schemas(),
        &json!({"plan_id": "basic", "qty": 3}),
        &Value::Null,
        lookups,
        FormConfig::default(),
    )
    .unwrap();
    form.settle().await;
    assert_eq!(form.get("total").unwrap(), json!(30));
    assert_eq!(form.get("seats").unwrap(), json!(5));

    form.set_value("plan_id", json!("pro")).unwrap();
    form.settle().await;
    assert_eq!(form.get("total").unwrap(), json!(75));
    assert_eq!(form.get("seats").unwrap(), json!(50));

    // Unknown key: the record is missing, every projection reads 0.
    form.set_value("plan_id", json!("enterprise")).unwrap();
    form.settle().await;
    assert_eq!(form.get("total").unwrap(), json!(0));

    assert_eq!(form.resolve("plan_id.unit_price").await, Ok(0.0));
    assert_eq!(form.resolve("qty").await, Ok(3.0));
}

#[tokio::test]
async fn test_empty_selection_skips_resolver() {
    let delayed = Arc::new(Delayed {
        delay: Duration::from_millis(1),
        calls: AtomicUsize::new(0),
    });
    let lookups = LookupRegistry::new().with("plans", delayed.clone());
    let mut form = Form::open(
        &pricing_schemas(),
        &json!({"qty": 2}),
        &Value::Null,
        lookups,
        FormConfig::default(),
    )
    .unwrap();
    form.settle().await;

    assert_eq!(delayed.calls.load(Ordering::SeqCst), 0);
    assert_eq!(form.get("total").unwrap(), json!(0));

    form.set_value("plan_id", json!("abcd")).unwrap();
    form.settle().await;
    assert_eq!(form.get("total").unwrap(), json!(8));
    assert_eq!(delayed.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_lookup_timeout_and_failure_yield_null() {
    let slow = Arc::new(Delayed {
        delay: Duration::from_secs(30),
        calls: AtomicUsize::new(0),
    });
    let schemas: Vec<Arc<FieldSchema>> = vec![
        FieldSchema::input("plan_id").with_lookup("slow"),
        FieldSchema::input("other").with_lookup("broken"),
        FieldSchema::input("a")
            .with_default(json!(1))
            .with_formula("{plan_id.unit_price}"),
        FieldSchema::input("b")
            .with_default(json!(1))
            .with_formula("{other.unit_price}"),
    ]
    .into_iter()
    .map(Arc::new)
    .collect();
    let lookups = LookupRegistry::new()
        .with("slow", slow)
        .with("broken", Arc::new(Broken));
    let mut form = Form::open(
        &schemas,
        &json!({"plan_id": "basic", "other": "x"}),
        &Value::Null,
        lookups,
        FormConfig::default().lookup_timeout(Some(Duration::from_millis(100))),
    )
    .unwrap();

    let report = form.settle().await;
    assert!(report.converged);
    assert_eq!(form.get("a").unwrap(), Value::Null);
    assert_eq!(form.get("b").unwrap(), Value::Null);
    assert_eq!(form.formula_stats("a").unwrap().failures, 1);
    assert_eq!(form.formula_stats("b").unwrap().failures, 1);
}

#[tokio::test]
async fn test_row_formulas_prefer_row_scope() {
    let schemas: Vec<Arc<FieldSchema>> = vec![
        FieldSchema::input("discount").with_default(json!(2)),
        FieldSchema::array(
            "items",
            vec![
                FieldSchema::input("plan").with_lookup("plans"),
                FieldSchema::input("qty"),
                FieldSchema::input("line").with_formula("{plan.unit_price * qty - discount}"),
            ],
        ),
    ]
    .into_iter()
    .map(Arc::new)
    .collect();
    let lookups = LookupRegistry::new().with("plans", plans());
    let mut form = Form::open(
        &schemas,
        &json!({"items": [{"plan": "basic", "qty": 2}, {"plan": "pro", "qty": 1}]}),
        &Value::Null,
        lookups,
        FormConfig::default(),
    )
    .unwrap();
    form.settle().await;
    assert_eq!(form.get("items.0.line").unwrap(), json!(18));
    assert_eq!(form.get("items.1.line").unwrap(), json!(23));

    // A root-level edit reaches every row formula.
    form.set_value("discount", json!(0)).unwrap();
    form.settle().await;
    assert_eq!(form.get("items.1.line").unwrap(), json!(25));
    assert_eq!(form.resolve_in("items.0", "qty").await.unwrap(), 2.0);
}

#[tokio::test]
async fn test_subscriptions_cover_roots_and_shape() {
    let schemas: Vec<Arc<FieldSchema>> = vec![
        FieldSchema::array("items", vec![FieldSchema::input("qty")]),
        FieldSchema::input("count").with_formula("{items.qty}"),
    ]
    .into_iter()
    .map(Arc::new)
    .collect();
    let form = Form::open(
        &schemas,
        &json!({"items": [{"qty": 1}]}),
        &Value::Null,
        LookupRegistry::new(),
        FormConfig::default(),
    )
    .unwrap();

    let kinds: Vec<SubscriptionKind> = form.subscriptions().iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![SubscriptionKind::Value, SubscriptionKind::Shape]);
}

#[tokio::test]
async fn test_change_events() {
    let schemas: Vec<Arc<FieldSchema>> = vec![
        FieldSchema::input("kind"),
        FieldSchema::input("note").with_criteria("kind", json!("other")),
        FieldSchema::input("qty").with_default(json!(1)),
        FieldSchema::input("double").with_formula("{qty * 2}"),
        FieldSchema::array("items", vec![FieldSchema::input("name")]),
    ]
    .into_iter()
    .map(Arc::new)
    .collect();
    let mut form = Form::open(
        &schemas,
        &json!({"kind": "other", "note": "hi"}),
        &Value::Null,
        LookupRegistry::new(),
        FormConfig::default(),
    )
    .unwrap();
    let receiver = form.change_receiver();
    form.settle().await;
    receiver.drain();

    form.set_value("qty", json!(4)).unwrap();
    form.settle().await;
    let events = receiver.drain();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].path, "qty");
    assert_eq!(events[0].source, ChangeSource::User);
    assert_eq!(events[1].path, "double");
    assert_eq!(events[1].source, ChangeSource::Formula);
    assert_eq!(
        events[1].kind,
        ChangeKind::Value {
            old: json!(2),
            new: json!(8)
        }
    );

    form.set_value("kind", json!("person")).unwrap();
    let events = receiver.drain();
    assert!(events
        .iter()
        .any(|e| e.path == "note" && e.kind == ChangeKind::Activation { active: false }));
    assert!(events.iter().any(|e| e.path == "note"
        && e.source == ChangeSource::Criteria
        && e.kind
            == ChangeKind::Value {
                old: json!("hi"),
                new: json!("")
            }));

    form.add_row("items").unwrap();
    let events = receiver.drain();
    assert_eq!(events.last().unwrap().kind, ChangeKind::Shape { rows: 2 });
    assert_eq!(form.emitter_stats().dropped, 0);
}

#[tokio::test]
async fn test_quiet_config_emits_nothing() {
    let schemas = vec![Arc::new(FieldSchema::input("a"))];
    let mut form = Form::open(
        &schemas,
        &Value::Null,
        &Value::Null,
        LookupRegistry::new(),
        FormConfig::quiet(),
    )
    .unwrap();
    form.set_value("a", json!(1)).unwrap();
    assert!(form.change_receiver().drain().is_empty());
    assert_eq!(form.emitter_stats().emitted, 0);
}
