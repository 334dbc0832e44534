//! Lightweight counters tracking accrual requests, failures, throttling, and
//! latency so the client can expose aggregated snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct AccrualMetrics {
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    total_throttled: AtomicU64,
    total_retries: AtomicU64,
    total_latency_ns: AtomicU64,
}

impl AccrualMetrics {
    pub(crate) fn record_success(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
    }

    pub(crate) fn record_failure(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
    }

    pub(crate) fn record_throttled(&self, latency: Duration) {
        self.record_failure(latency);
        self.total_throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn add_latency(&self, latency: Duration) {
        let nanos = latency.as_nanos().min(u128::from(u64::MAX)) as u64;
        self.total_latency_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> AccrualMetricsSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_latency_ns = self.total_latency_ns.load(Ordering::Relaxed);

        let average_latency_ms = if total_requests == 0 {
            0.0
        } else {
            (total_latency_ns as f64 / total_requests as f64) / 1_000_000.0
        };

        AccrualMetricsSnapshot {
            total_requests,
            total_errors: self.total_errors.load(Ordering::Relaxed),
            total_throttled: self.total_throttled.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            average_latency_ms,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct AccrualMetricsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub total_throttled: u64,
    pub total_retries: u64,
    pub average_latency_ms: f64,
}
