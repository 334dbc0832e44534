use crate::runtime::error::PipelineStage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Relaxed counters describing what the pipeline has done so far.
#[derive(Default, Debug)]
pub struct Telemetry {
    claimed_orders: AtomicU64,
    fetched_outcomes: AtomicU64,
    settled_orders: AtomicU64,
    requeued_orders: AtomicU64,
    duplicate_outcomes: AtomicU64,
    released_claims: AtomicU64,
    fetch_errors: AtomicU64,
    store_errors: AtomicU64,
    worker_panics: AtomicU64,
}

impl Telemetry {
    pub fn record_claimed(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.claimed_orders.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_fetched(&self) {
        self.fetched_outcomes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_settled(&self) {
        self.settled_orders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeued(&self) {
        self.requeued_orders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_outcomes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self) {
        self.released_claims.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_panic(&self) {
        self.worker_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, stage: PipelineStage) {
        let counter = match stage {
            PipelineStage::Fetch => &self.fetch_errors,
            PipelineStage::Claim
            | PipelineStage::Renew
            | PipelineStage::Apply
            | PipelineStage::Release => &self.store_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            claimed_orders: self.claimed_orders.load(Ordering::Relaxed),
            fetched_outcomes: self.fetched_outcomes.load(Ordering::Relaxed),
            settled_orders: self.settled_orders.load(Ordering::Relaxed),
            requeued_orders: self.requeued_orders.load(Ordering::Relaxed),
            duplicate_outcomes: self.duplicate_outcomes.load(Ordering::Relaxed),
            released_claims: self.released_claims.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            worker_panics: self.worker_panics.load(Ordering::Relaxed),
        }
    }

    pub fn settled_orders(&self) -> u64 {
        self.settled_orders.load(Ordering::Relaxed)
    }

    pub fn claimed_orders(&self) -> u64 {
        self.claimed_orders.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub claimed_orders: u64,
    pub fetched_outcomes: u64,
    pub settled_orders: u64,
    pub requeued_orders: u64,
    pub duplicate_outcomes: u64,
    pub released_claims: u64,
    pub fetch_errors: u64,
    pub store_errors: u64,
    pub worker_panics: u64,
}

/// Spawns a background task that periodically logs settlement throughput and
/// error counters until `shutdown` fires.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    let span = tracing::Span::current();
    tokio::spawn(
        async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut last_snapshot = telemetry.snapshot();
            let mut last_tick = Instant::now();

            loop {
                select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(target: "accrual_sync::metrics", "metrics reporter shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let current = telemetry.snapshot();
                        let settled_delta = current
                            .settled_orders
                            .saturating_sub(last_snapshot.settled_orders);
                        let elapsed = last_tick.elapsed().as_secs_f64();
                        let throughput = if elapsed <= f64::EPSILON {
                            0.0
                        } else {
                            settled_delta as f64 / elapsed
                        };

                        tracing::info!(
                            target: "accrual_sync::metrics",
                            throughput = format!("{throughput:.2}"),
                            claimed = current.claimed_orders,
                            settled = current.settled_orders,
                            requeued = current.requeued_orders,
                            duplicates = current.duplicate_outcomes,
                            fetch_errors = current.fetch_errors,
                            store_errors = current.store_errors,
                            worker_panics = current.worker_panics,
                            "reconciliation metrics snapshot"
                        );

                        last_snapshot = current;
                        last_tick = Instant::now();
                    }
                }
            }
        }
        .instrument(span),
    )
}
