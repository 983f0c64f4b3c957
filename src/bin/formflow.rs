//! formflow CLI - open a form from files, apply edits, print the settled state
//!
//! Usage:
//!   cargo run --features cli -- --schema form.yaml --data data.json
//!   cargo run --features cli -- --schema form.json --lookups plans.json --set plan_id=pro --set items.0.qty=3

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use formflow::{
    parse_schema_json, parse_schema_yaml, Form, FormConfig, LookupRegistry, StaticLookup,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "formflow")]
#[command(about = "Evaluate a schema-driven form and print its settled state")]
struct Cli {
    /// Schema file (.json, .yaml or .yml)
    #[arg(short, long)]
    schema: PathBuf,

    /// Initial data record (JSON)
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Fallback record (JSON)
    #[arg(short, long)]
    fallback: Option<PathBuf>,

    /// Static lookup tables (JSON: {"resolver": {"key": record}})
    #[arg(short, long)]
    lookups: Option<PathBuf>,

    /// Edit to apply before settling, as path=value (value parsed as JSON,
    /// otherwise taken as a string). Repeatable.
    #[arg(long = "set", value_name = "PATH=VALUE")]
    edits: Vec<String>,

    /// Output format: json, text
    #[arg(long, default_value = "json")]
    format: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let schemas = load_schemas(&cli.schema)?;
    let data = load_json(cli.data.as_deref())?;
    let fallback = load_json(cli.fallback.as_deref())?;

    let mut lookups = LookupRegistry::new();
    if let Value::Object(tables) = load_json(cli.lookups.as_deref())? {
        for (name, table) in tables {
            lookups.insert(name, Arc::new(StaticLookup::from_value(&table)));
        }
    }

    let mut form = Form::open(&schemas, &data, &fallback, lookups, FormConfig::from_env())?;
    form.settle().await;

    for edit in &cli.edits {
        let (path, raw) = edit
            .split_once('=')
            .ok_or_else(|| anyhow!("edit '{edit}' is not of the form path=value"))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        form.set_value(path.trim(), value)?;
        form.settle().await;
    }

    let report = form.settle().await;
    let errors = form.errors();

    match cli.format.as_str() {
        "text" => {
            println!("=== Form ===");
            println!("{}", serde_json::to_string_pretty(&form.value())?);
            println!();
            println!("Valid:      {}", if form.is_valid() { "YES" } else { "NO" });
            println!("Converged:  {}", report.converged);
            for (path, errs) in &errors {
                for err in errs {
                    println!("  {path}: {err}");
                }
            }
        }
        _ => {
            let out = json!({
                "value": form.value(),
                "valid": form.is_valid(),
                "errors": errors,
                "converged": report.converged,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    Ok(())
}

fn load_schemas(path: &Path) -> Result<Vec<Arc<formflow::FieldSchema>>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading schema {}", path.display()))?;
    let schemas = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => parse_schema_yaml(&text)?,
        _ => parse_schema_json(&text)?,
    };
    Ok(schemas)
}

fn load_json(path: Option<&Path>) -> Result<Value> {
    let Some(path) = path else {
        return Ok(Value::Null);
    };
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
