//! Fixed-size worker pool that turns claimed orders into fetched outcomes.
//!
//! Workers are created once per run and share a single order receiver, so the
//! pool size is the only bound on concurrent accrual requests.

use crate::accrual::{FetchError, OutcomeFetcher};
use crate::model::{Order, Outcome};
use crate::runtime::telemetry::Telemetry;
use futures::FutureExt;
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Dispatcher {
    fetcher: Arc<dyn OutcomeFetcher>,
    workers: usize,
    telemetry: Arc<Telemetry>,
}

impl Dispatcher {
    pub fn new(fetcher: Arc<dyn OutcomeFetcher>, workers: usize, telemetry: Arc<Telemetry>) -> Self {
        Self {
            fetcher,
            workers: workers.max(1),
            telemetry,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Spawns the pool. Workers exit when `shutdown` fires, when the order
    /// channel closes, or when the outcome receiver is dropped.
    pub fn spawn(
        self,
        order_rx: mpsc::Receiver<Order>,
        outcome_tx: mpsc::Sender<Outcome>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let orders = Arc::new(Mutex::new(order_rx));

        (0..self.workers)
            .map(|worker_id| {
                let worker = DispatchWorker {
                    id: worker_id,
                    fetcher: self.fetcher.clone(),
                    orders: orders.clone(),
                    outcome_tx: outcome_tx.clone(),
                    telemetry: self.telemetry.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect()
    }
}

struct DispatchWorker {
    id: usize,
    fetcher: Arc<dyn OutcomeFetcher>,
    orders: Arc<Mutex<mpsc::Receiver<Order>>>,
    outcome_tx: mpsc::Sender<Outcome>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl DispatchWorker {
    #[tracing::instrument(name = "dispatch_worker", skip_all, fields(worker = self.id))]
    async fn run(self) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                order = async { self.orders.lock().await.recv().await } => order,
            };
            let Some(order) = next else {
                break;
            };

            let outcome = self.fetch(&order.number).await;

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                sent = self.outcome_tx.send(outcome) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("dispatch worker stopped");
    }

    async fn fetch(&self, number: &str) -> Outcome {
        let result = AssertUnwindSafe(async {
            self.fetcher.fetch_outcome(number, &self.shutdown).await
        })
        .catch_unwind()
        .await;

        match result {
            Ok(Ok(report)) => {
                self.telemetry.record_fetched();
                Outcome::fetched(number, report)
            }
            Ok(Err(err)) => Outcome::failed(number, err),
            Err(panic_payload) => {
                let panic_msg = panic_message(panic_payload.as_ref());
                tracing::error!(order = number, panic = %panic_msg, "accrual fetch panicked");
                self.telemetry.record_worker_panic();
                Outcome::failed(number, FetchError::Panicked(panic_msg))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
