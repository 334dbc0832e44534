//! Reconciliation pipeline orchestration.
//!
//! `Reconciler` owns the stage wiring for one run:
//! - `source` claims pending orders on the poll interval.
//! - `dispatcher` fetches each order's outcome on a fixed worker pool.
//! - `reducer` persists outcomes and credits balances.
//!
//! Stages are connected by bounded channels sized to the claim chunk, share
//! one run-scoped cancellation token, and report operational errors through a
//! broadcast stream instead of failing the run. The source and reducer also
//! share the run's [`InFlightOrders`], which keeps each order on one worker.

use super::dispatcher::Dispatcher;
use super::inflight::InFlightOrders;
use super::reducer::OutcomeReducer;
use super::source::{PendingOrderSource, PendingOrderSourceParams};
use crate::accrual::{AccrualClient, OutcomeFetcher};
use crate::model::{Order, Outcome};
use crate::runtime::config::ReconcilerConfig;
use crate::runtime::error::{ErrorReporter, PipelineError, DEFAULT_ERROR_CHANNEL_CAPACITY};
use crate::runtime::telemetry::{self, Telemetry};
use crate::store::OrderStore;
use anyhow::{bail, Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub struct Reconciler {
    config: ReconcilerConfig,
    fetcher: Arc<dyn OutcomeFetcher>,
    store: Arc<dyn OrderStore>,
    telemetry: Arc<Telemetry>,
    reporter: ErrorReporter,
    span: tracing::Span,
}

impl Reconciler {
    /// Wires a reconciler from explicit collaborators.
    pub fn new(
        config: ReconcilerConfig,
        fetcher: Arc<dyn OutcomeFetcher>,
        store: Arc<dyn OrderStore>,
    ) -> Self {
        let telemetry = Arc::new(Telemetry::default());
        let reporter = ErrorReporter::new(telemetry.clone(), DEFAULT_ERROR_CHANNEL_CAPACITY);
        Self {
            config,
            fetcher,
            store,
            telemetry,
            reporter,
            span: tracing::info_span!("reconciler"),
        }
    }

    /// Builds the HTTP accrual client from `config` and wires it to `store`.
    pub fn from_config(config: ReconcilerConfig, store: Arc<dyn OrderStore>) -> Result<Self> {
        let client = AccrualClient::from_config(&config).context("failed to build accrual client")?;
        Ok(Self::new(config, Arc::new(client), store))
    }

    /// Replaces the span every stage task runs inside.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Returns a clone of the telemetry handle for observability.
    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Subscribes to operational errors. Subscribers that fall behind observe
    /// `RecvError::Lagged` and skip ahead.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<PipelineError> {
        self.reporter.subscribe()
    }

    /// Runs the pipeline until `shutdown` is cancelled, then waits for every
    /// stage to wind down. Operational errors never end the run; only a stage
    /// task that panicked makes this return `Err`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        debug_assert!(
            self.config.validate().is_ok(),
            "ReconcilerConfig should have been validated at construction time"
        );

        let run_token = shutdown.child_token();
        let capacity = self.config.chunk_size().max(1);
        let (order_tx, order_rx) = mpsc::channel::<Order>(capacity);
        let (outcome_tx, outcome_rx) = mpsc::channel::<Outcome>(capacity);

        let handles = self.span.in_scope(|| {
            tracing::info!(
                poll_interval_ms = self.config.poll_interval().as_millis() as u64,
                chunk_size = self.config.chunk_size(),
                rate_limit = self.config.rate_limit(),
                "starting reconciliation pipeline"
            );
            self.spawn_stages(order_tx, order_rx, outcome_tx, outcome_rx, &run_token)
        });

        run_token.cancelled().await;
        self.span
            .in_scope(|| tracing::info!("shutting down reconciliation pipeline"));

        let mut failures = 0usize;
        for result in join_all(handles).await {
            if let Err(err) = result {
                failures += 1;
                self.span
                    .in_scope(|| tracing::error!(error = %err, "reconciliation task failed"));
            }
        }

        if failures > 0 {
            bail!("{failures} reconciliation task(s) failed");
        }

        self.span
            .in_scope(|| tracing::info!("reconciliation pipeline stopped"));
        Ok(())
    }

    fn spawn_stages(
        &self,
        order_tx: mpsc::Sender<Order>,
        order_rx: mpsc::Receiver<Order>,
        outcome_tx: mpsc::Sender<Outcome>,
        outcome_rx: mpsc::Receiver<Outcome>,
        run_token: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.rate_limit() + 3);
        let in_flight = Arc::new(InFlightOrders::new());

        let source = PendingOrderSource::new(PendingOrderSourceParams {
            store: self.store.clone(),
            order_tx,
            chunk_size: self.config.chunk_size(),
            poll_interval: self.config.poll_interval(),
            claim_timeout: self.config.claim_timeout(),
            telemetry: self.telemetry.clone(),
            reporter: self.reporter.clone(),
            in_flight: in_flight.clone(),
        });
        handles.push(tokio::spawn(
            source.run(run_token.clone()).in_current_span(),
        ));

        let dispatcher = Dispatcher::new(
            self.fetcher.clone(),
            self.config.rate_limit(),
            self.telemetry.clone(),
        );
        handles.extend(dispatcher.spawn(order_rx, outcome_tx, run_token.clone()));

        let reducer = OutcomeReducer::new(
            self.store.clone(),
            self.telemetry.clone(),
            self.reporter.clone(),
            in_flight,
        );
        handles.push(tokio::spawn(
            reducer.run(outcome_rx, run_token.clone()).in_current_span(),
        ));

        handles.push(telemetry::spawn_metrics_reporter(
            self.telemetry.clone(),
            run_token.clone(),
            self.config.metrics_interval(),
        ));

        handles
    }
}
