pub mod accrual;
pub mod model;
pub mod processor;
pub mod runtime;
pub mod store;

pub use accrual::{
    AccrualClient, AccrualClientOptions, AccrualMetricsSnapshot, DelayPolicy, FetchError,
    OutcomeFetcher,
};
pub use model::{
    AccrualReport, Balance, ExternalStatus, Order, OrderStatus, Outcome, StatusUpdate,
};
pub use processor::{Dispatcher, InFlightOrders, OutcomeReducer, PendingOrderSource, Reconciler};
pub use runtime::config::{ReconcilerConfig, ReconcilerConfigBuilder, ReconcilerConfigParams};
pub use runtime::error::{ErrorReporter, PipelineError, PipelineStage};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, spawn_metrics_reporter, Telemetry, TelemetrySnapshot};
pub use store::{ApplyResult, MemoryOrderStore, OrderStore, PgOrderStore};
