use std::{
    env,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use accrual_sync::{
    AccrualClient, AccrualClientOptions, MemoryOrderStore, Order, OrderStore, Reconciler,
    ReconcilerConfig,
};
use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

pub const PG_URL_ENV: &str = "ACCRUAL_SYNC_PG_URL";

pub static PG_GUARD: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Postgres URL for the opt-in database tests, if configured.
pub fn pg_url() -> Option<String> {
    match env::var(PG_URL_ENV) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_owned()),
        _ => None,
    }
}

/// Client options with short waits so retry paths finish quickly.
pub fn fast_client_options() -> AccrualClientOptions {
    AccrualClientOptions {
        request_timeout: Duration::from_secs(2),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        jitter: 0.0,
        max_retry_after: Duration::from_secs(5),
        seed: Some(7),
        ..AccrualClientOptions::default()
    }
}

pub fn fast_config(accrual_url: &str) -> Result<ReconcilerConfig> {
    ReconcilerConfig::builder()
        .accrual_url(accrual_url)
        .poll_interval(Duration::from_millis(50))
        .chunk_size(4)
        .rate_limit(2)
        .initial_backoff(Duration::from_millis(10))
        .max_backoff(Duration::from_millis(40))
        .jitter(0.0)
        .max_retry_after(Duration::from_secs(5))
        .request_timeout(Duration::from_secs(2))
        .claim_timeout(Duration::from_secs(60))
        .backoff_seed(7)
        .build()
}

pub fn memory_store(orders: &[(&str, &str)]) -> Result<Arc<MemoryOrderStore>> {
    let store = Arc::new(MemoryOrderStore::new());
    for (number, owner) in orders {
        store.insert_order(Order::new(*number, *owner))?;
    }
    Ok(store)
}

pub fn reconciler(
    config: ReconcilerConfig,
    store: Arc<dyn OrderStore>,
) -> Result<Arc<Reconciler>> {
    let client = AccrualClient::with_options(config.accrual_url().to_owned(), config.client_options())?;
    Ok(Arc::new(Reconciler::new(config, Arc::new(client), store)))
}

/// Polls `condition` every 20ms until it returns `true` or `timeout` elapses.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    loop {
        if condition().await? {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("{what} did not happen within {timeout:?}");
        }
        sleep(Duration::from_millis(20)).await;
    }
}
