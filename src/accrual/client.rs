//! HTTP client for the accrual service. Houses the `AccrualClient`, the
//! `FetchError` classification, and the `OutcomeFetcher` trait consumed by
//! dispatcher workers.

use crate::accrual::delay::{sleep_with_cancellation, DelayPolicy};
use crate::accrual::metrics::{AccrualMetrics, AccrualMetricsSnapshot};
use crate::accrual::options::AccrualClientOptions;
use crate::model::AccrualReport;
use crate::runtime::config::ReconcilerConfig;
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const ORDERS_PATH: &str = "/api/orders/";

#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    /// `429 Too Many Requests`, with the parsed `Retry-After` hint if any.
    Throttled { retry_after: Option<Duration> },
    /// `204 No Content`: the accrual service does not know the order yet.
    Unregistered,
    /// Client-side HTTP status that retrying cannot fix.
    Status { code: u16 },
    Server { code: u16 },
    Transport(String),
    Decode(String),
    Exhausted { attempts: usize, last: Box<FetchError> },
    Cancelled,
    Panicked(String),
}

impl FetchError {
    /// Whether another attempt within the same logical fetch may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Throttled { .. } | FetchError::Server { .. } | FetchError::Transport(_)
        )
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Throttled {
                retry_after: Some(hint),
            } => write!(f, "accrual service throttled the request (retry after {hint:?})"),
            FetchError::Throttled { retry_after: None } => {
                write!(f, "accrual service throttled the request")
            }
            FetchError::Unregistered => write!(f, "order is not registered with the accrual service"),
            FetchError::Status { code } => write!(f, "accrual service rejected the request with status {code}"),
            FetchError::Server { code } => write!(f, "accrual service failed with status {code}"),
            FetchError::Transport(message) => write!(f, "accrual request failed: {message}"),
            FetchError::Decode(message) => write!(f, "malformed accrual response: {message}"),
            FetchError::Exhausted { attempts, last } => {
                write!(f, "accrual request exhausted {attempts} attempts: {last}")
            }
            FetchError::Cancelled => write!(f, "accrual request cancelled"),
            FetchError::Panicked(message) => write!(f, "accrual fetch panicked: {message}"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Source of accrual outcomes, one logical (internally retried) request per order.
pub trait OutcomeFetcher: Send + Sync {
    fn fetch_outcome<'a>(
        &'a self,
        number: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<AccrualReport, FetchError>>;
}

#[derive(Debug, Clone)]
pub struct AccrualClient {
    base_url: Arc<String>,
    client: reqwest::Client,
    options: AccrualClientOptions,
    delay: DelayPolicy,
    metrics: Arc<AccrualMetrics>,
}

impl OutcomeFetcher for AccrualClient {
    fn fetch_outcome<'a>(
        &'a self,
        number: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<AccrualReport, FetchError>> {
        Box::pin(self.fetch_outcome(number, cancel))
    }
}

impl AccrualClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_options(base_url, AccrualClientOptions::default())
    }

    pub fn with_options(base_url: impl Into<String>, options: AccrualClientOptions) -> Result<Self> {
        options.validate()?;

        let base_url = base_url.into().trim().trim_end_matches('/').to_owned();
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .connect_timeout(options.request_timeout)
            .build()
            .map_err(|err| anyhow!("failed to build accrual HTTP client: {err}"))?;

        Ok(Self {
            base_url: Arc::new(base_url),
            client,
            delay: options.delay_policy(),
            options,
            metrics: Arc::new(AccrualMetrics::default()),
        })
    }

    pub fn from_config(config: &ReconcilerConfig) -> Result<Self> {
        config.validate()?;
        Self::with_options(config.accrual_url().to_owned(), config.client_options())
    }

    pub fn endpoint(&self) -> &str {
        &self.base_url
    }

    pub fn metrics(&self) -> AccrualMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn order_url(&self, number: &str) -> String {
        format!("{}{ORDERS_PATH}{number}", self.base_url)
    }

    /// Fetches the accrual report for `number`, retrying throttled and
    /// transient failures up to the configured attempt budget.
    pub async fn fetch_outcome(
        &self,
        number: &str,
        cancel: &CancellationToken,
    ) -> Result<AccrualReport, FetchError> {
        self.retry_with_policy(number, cancel, |_| self.request_once(number))
            .await
    }

    /// Shared retry loop: honours `Retry-After` on throttling, backs off on
    /// transient failures, aborts on anything else, and stops as soon as the
    /// token is cancelled.
    async fn retry_with_policy<F, Fut>(
        &self,
        number: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<AccrualReport, FetchError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<AccrualReport, FetchError>>,
    {
        let mut attempt = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let start = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                result = operation(attempt) => result,
            };
            let elapsed = start.elapsed();

            let (err, wait) = match result {
                Ok(report) => {
                    self.metrics.record_success(elapsed);
                    tracing::debug!(
                        order = number,
                        attempt,
                        status = ?report.status,
                        "accrual request completed"
                    );
                    return Ok(report);
                }
                Err(FetchError::Throttled { retry_after }) => {
                    self.metrics.record_throttled(elapsed);
                    let wait = self.delay.delay_with_hint(attempt, retry_after);
                    (FetchError::Throttled { retry_after }, wait)
                }
                Err(err) if err.is_transient() => {
                    self.metrics.record_failure(elapsed);
                    (err, self.delay.delay(attempt))
                }
                Err(err) => {
                    self.metrics.record_failure(elapsed);
                    tracing::debug!(order = number, attempt, error = %err, "accrual request not retryable");
                    return Err(err);
                }
            };

            attempt += 1;
            if attempt >= self.options.max_attempts {
                tracing::warn!(order = number, attempts = attempt, error = %err, "accrual request exhausted retries");
                return Err(FetchError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            self.metrics.record_retry();
            tracing::warn!(
                order = number,
                attempt,
                backoff_ms = wait.as_millis().min(u128::from(u64::MAX)) as u64,
                error = %err,
                "accrual request failed; retrying"
            );
            sleep_with_cancellation(wait, cancel).await?;
        }
    }

    async fn request_once(&self, number: &str) -> Result<AccrualReport, FetchError> {
        let response = self
            .client
            .get(self.order_url(number))
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;

        let status = response.status();
        match status {
            StatusCode::OK => {}
            StatusCode::NO_CONTENT => return Err(FetchError::Unregistered),
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(FetchError::Throttled {
                    retry_after: parse_retry_after(response.headers()),
                })
            }
            status if status.is_server_error() => {
                return Err(FetchError::Server {
                    code: status.as_u16(),
                })
            }
            status => {
                return Err(FetchError::Status {
                    code: status.as_u16(),
                })
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        let report: AccrualReport =
            serde_json::from_slice(&body).map_err(|err| FetchError::Decode(err.to_string()))?;
        check_report(number, &report)?;
        Ok(report)
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    match value.to_str().ok().and_then(|raw| raw.trim().parse::<u64>().ok()) {
        Some(seconds) => Some(Duration::from_secs(seconds)),
        None => {
            tracing::warn!(value = ?value, "could not parse Retry-After header");
            None
        }
    }
}

fn check_report(number: &str, report: &AccrualReport) -> Result<(), FetchError> {
    if report.order != number {
        return Err(FetchError::Decode(format!(
            "response is for order {} (requested {number})",
            report.order
        )));
    }
    if let Some(accrual) = report.accrual {
        if accrual < Decimal::ZERO {
            return Err(FetchError::Decode(format!("negative accrual {accrual}")));
        }
    }
    Ok(())
}
