use std::env;
use std::sync::Arc;

use accrual_sync::{Order, PgOrderStore, Reconciler, ReconcilerConfig, Runner};
use anyhow::{bail, Context, Result};

const DATABASE_URI_ENV: &str = "DATABASE_URI";
/// Optional comma-separated `number:owner` pairs inserted before the run.
const SEED_ORDERS_ENV: &str = "SEED_ORDERS";
const DEFAULT_LOG_DIRECTIVE: &str = "info";

#[tokio::main]
async fn main() -> Result<()> {
    init_example_tracing();

    let database_uri = env::var(DATABASE_URI_ENV)
        .with_context(|| format!("{DATABASE_URI_ENV} must point at a Postgres database"))?;
    let config = ReconcilerConfig::from_env()?;

    let store = PgOrderStore::connect(&database_uri).await?;
    store.ensure_schema().await?;
    for order in seed_orders()? {
        store.insert_order(&order).await?;
    }

    let store = Arc::new(store);
    let reconciler = Arc::new(Reconciler::from_config(config, store)?);
    let telemetry = reconciler.telemetry();

    let mut runner = Runner::new(reconciler);
    let result = runner.run_until_ctrl_c().await;

    let snapshot = telemetry.snapshot();
    println!(
        "settled {} orders ({} requeued, {} duplicates, {} fetch errors, {} store errors)",
        snapshot.settled_orders,
        snapshot.requeued_orders,
        snapshot.duplicate_outcomes,
        snapshot.fetch_errors,
        snapshot.store_errors
    );
    result
}

fn init_example_tracing() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", DEFAULT_LOG_DIRECTIVE);
    }
    accrual_sync::init_tracing();
}

fn seed_orders() -> Result<Vec<Order>> {
    let Ok(raw) = env::var(SEED_ORDERS_ENV) else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((number, owner)) if !number.is_empty() && !owner.is_empty() => {
                Ok(Order::new(number, owner))
            }
            _ => bail!("{SEED_ORDERS_ENV} entry `{entry}` is not `number:owner`"),
        })
        .collect()
}
