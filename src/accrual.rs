//! Accrual service client plumbing: delay policy, retrying HTTP client,
//! request metrics, and client options.

pub mod client;
pub mod delay;
pub mod metrics;
pub mod options;

pub use client::{AccrualClient, FetchError, OutcomeFetcher};
pub use delay::{sleep_with_cancellation, DelayPolicy};
pub use metrics::AccrualMetricsSnapshot;
pub use options::AccrualClientOptions;
