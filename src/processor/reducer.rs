use super::inflight::InFlightOrders;
use crate::accrual::FetchError;
use crate::model::Outcome;
use crate::runtime::error::{ErrorReporter, PipelineError, PipelineStage};
use crate::runtime::telemetry::Telemetry;
use crate::store::{ApplyResult, OrderStore};
use anyhow::Error as AnyError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Applies fetched outcomes to the store, one at a time.
///
/// Any outcome that does not end in a persisted transition releases the claim
/// immediately so the order is offered again on the next tick. Claims that
/// cannot be released fall back to the store's staleness sweep.
pub struct OutcomeReducer {
    store: Arc<dyn OrderStore>,
    telemetry: Arc<Telemetry>,
    reporter: ErrorReporter,
    in_flight: Arc<InFlightOrders>,
}

impl OutcomeReducer {
    pub fn new(
        store: Arc<dyn OrderStore>,
        telemetry: Arc<Telemetry>,
        reporter: ErrorReporter,
        in_flight: Arc<InFlightOrders>,
    ) -> Self {
        Self {
            store,
            telemetry,
            reporter,
            in_flight,
        }
    }

    /// Consumes outcomes until `shutdown` fires or every worker is gone. An
    /// apply that has already started is allowed to finish.
    pub async fn run(self, mut outcome_rx: mpsc::Receiver<Outcome>, shutdown: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                outcome = outcome_rx.recv() => outcome,
            };
            let Some(outcome) = next else {
                break;
            };
            self.reduce(outcome).await;
        }

        tracing::debug!("outcome reducer stopped");
    }

    /// Applies a single outcome. Returns the store's verdict when an apply
    /// was attempted and succeeded.
    pub async fn reduce(&self, outcome: Outcome) -> Option<ApplyResult> {
        let Outcome { number, result } = outcome;
        // The claim is still held, so the source cannot hand this order out
        // again before the store call below settles or releases it.
        self.in_flight.remove(&number);

        let report = match result {
            Ok(report) => report,
            Err(err @ (FetchError::Cancelled | FetchError::Unregistered)) => {
                tracing::debug!(order = %number, reason = %err, "no outcome yet; releasing claim");
                self.release(&number).await;
                return None;
            }
            Err(err) => {
                self.reporter.report(PipelineError::for_order(
                    PipelineStage::Fetch,
                    number.as_str(),
                    AnyError::new(err),
                ));
                self.release(&number).await;
                return None;
            }
        };

        let update = report.to_update(&number);
        match self.store.apply_outcome(&update).await {
            Ok(result) => {
                match &result {
                    ApplyResult::Requeued => {
                        self.telemetry.record_requeued();
                        tracing::debug!(order = %number, status = %update.status, "order still pending");
                    }
                    ApplyResult::Settled { owner, credited } => {
                        self.telemetry.record_settled();
                        tracing::info!(
                            order = %number,
                            owner = %owner,
                            status = %update.status,
                            credited = %credited,
                            "order settled"
                        );
                    }
                    ApplyResult::AlreadySettled => {
                        self.telemetry.record_duplicate();
                        tracing::debug!(order = %number, "outcome for settled order ignored");
                    }
                }
                Some(result)
            }
            Err(err) => {
                self.reporter.report(PipelineError::for_order(
                    PipelineStage::Apply,
                    number.as_str(),
                    err,
                ));
                self.release(&number).await;
                None
            }
        }
    }

    async fn release(&self, number: &str) {
        match self.store.release_claim(number).await {
            Ok(true) => self.telemetry.record_released(),
            Ok(false) => {}
            Err(err) => self.reporter.report(PipelineError::for_order(
                PipelineStage::Release,
                number,
                err.context("claim left for the staleness sweep"),
            )),
        }
    }
}
