use super::inflight::InFlightOrders;
use crate::model::Order;
use crate::runtime::error::{ErrorReporter, PipelineError, PipelineStage};
use crate::runtime::telemetry::Telemetry;
use crate::store::OrderStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Claims pending orders on a fixed interval and hands them to the dispatcher.
///
/// A tick never claims more than the order channel can take right now, so the
/// hand-off is always non-blocking and a slow pipeline only shrinks (or skips)
/// the next claim instead of stalling the ticker.
///
/// Every tick first renews the claims of orders still in flight, and an
/// order that is still in flight is never dispatched a second time.
pub struct PendingOrderSource {
    store: Arc<dyn OrderStore>,
    order_tx: mpsc::Sender<Order>,
    chunk_size: usize,
    poll_interval: Duration,
    claim_timeout: Duration,
    telemetry: Arc<Telemetry>,
    reporter: ErrorReporter,
    in_flight: Arc<InFlightOrders>,
}

pub struct PendingOrderSourceParams {
    pub store: Arc<dyn OrderStore>,
    pub order_tx: mpsc::Sender<Order>,
    pub chunk_size: usize,
    pub poll_interval: Duration,
    pub claim_timeout: Duration,
    pub telemetry: Arc<Telemetry>,
    pub reporter: ErrorReporter,
    pub in_flight: Arc<InFlightOrders>,
}

impl PendingOrderSource {
    pub fn new(params: PendingOrderSourceParams) -> Self {
        let PendingOrderSourceParams {
            store,
            order_tx,
            chunk_size,
            poll_interval,
            claim_timeout,
            telemetry,
            reporter,
            in_flight,
        } = params;

        Self {
            store,
            order_tx,
            chunk_size: chunk_size.max(1),
            poll_interval,
            claim_timeout,
            telemetry,
            reporter,
            in_flight,
        }
    }

    /// Ticks until `shutdown` fires. The first tick runs immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        tracing::debug!("pending-order source stopped");
    }

    /// Claims one batch and forwards it. Returns the number of orders handed off.
    pub async fn tick(&self) -> usize {
        self.renew_in_flight().await;

        let limit = self.chunk_size.min(self.order_tx.capacity());
        if limit == 0 {
            tracing::debug!("order channel full; skipping claim");
            return 0;
        }

        let orders = match self
            .store
            .claim_pending_batch(limit, self.claim_timeout)
            .await
        {
            Ok(orders) => orders,
            Err(err) => {
                self.reporter
                    .report(PipelineError::new(PipelineStage::Claim, err));
                return 0;
            }
        };

        if orders.is_empty() {
            return 0;
        }
        self.telemetry.record_claimed(orders.len() as u64);
        tracing::debug!(claimed = orders.len(), limit, "claimed pending orders");

        let mut forwarded = 0;
        for order in orders {
            if !self.in_flight.insert(&order.number) {
                tracing::debug!(order = %order.number, "order still in flight; not dispatching again");
                continue;
            }
            match self.order_tx.try_send(order) {
                Ok(()) => forwarded += 1,
                Err(TrySendError::Full(order)) | Err(TrySendError::Closed(order)) => {
                    self.in_flight.remove(&order.number);
                    self.release(&order.number).await;
                }
            }
        }
        forwarded
    }

    async fn renew_in_flight(&self) {
        let numbers = self.in_flight.numbers();
        if numbers.is_empty() {
            return;
        }
        match self.store.renew_claims(&numbers).await {
            Ok(renewed) => {
                tracing::trace!(renewed, in_flight = numbers.len(), "renewed in-flight claims")
            }
            Err(err) => self
                .reporter
                .report(PipelineError::new(PipelineStage::Renew, err)),
        }
    }

    async fn release(&self, number: &str) {
        match self.store.release_claim(number).await {
            Ok(released) => {
                if released {
                    self.telemetry.record_released();
                }
                tracing::debug!(order = number, "dispatcher unavailable; released claim");
            }
            Err(err) => self.reporter.report(PipelineError::for_order(
                PipelineStage::Release,
                number,
                err,
            )),
        }
    }
}
