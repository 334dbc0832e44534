use crate::accrual::options::{
    AccrualClientOptions, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_JITTER, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_BACKOFF_MS, DEFAULT_MAX_RETRY_AFTER_SECS, DEFAULT_REQUEST_TIMEOUT_MS,
};
use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_ACCRUAL_URL: &str = "http://localhost:4444";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_CHUNK_SIZE: usize = 5;
const DEFAULT_RATE_LIMIT: usize = 3;
const DEFAULT_CLAIM_TIMEOUT_SECS: u64 = 300;

pub const ENV_ACCRUAL_URL: &str = "ACCRUAL_SYSTEM_ADDRESS";
pub const ENV_POLL_INTERVAL: &str = "POLL_INTERVAL";
pub const ENV_RATE_LIMIT: &str = "RATE_LIMIT";
pub const ENV_CLAIM_TIMEOUT: &str = "UPDATE_TIMEOUT";
pub const ENV_CHUNK_SIZE: &str = "ACCRUAL_CHUNK_SIZE";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "ACCRUAL_REQUEST_TIMEOUT_MS";
pub const ENV_METRICS_INTERVAL: &str = "ACCRUAL_METRICS_INTERVAL";

/// Runtime configuration for the reconciliation pipeline.
///
/// All instances must be constructed via [`ReconcilerConfig::builder`],
/// [`ReconcilerConfig::new`] or [`ReconcilerConfig::from_env`] so invariants are
/// validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    accrual_url: String,
    poll_interval: Duration,
    chunk_size: usize,
    rate_limit: usize,
    claim_timeout: Duration,
    metrics_interval: Duration,
    request_timeout: Duration,
    max_attempts: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
    jitter: f64,
    max_retry_after: Duration,
    backoff_seed: Option<u64>,
}

pub struct ReconcilerConfigParams {
    pub accrual_url: String,
    pub poll_interval: Duration,
    pub chunk_size: usize,
    pub rate_limit: usize,
    pub claim_timeout: Duration,
    pub metrics_interval: Duration,
    pub request_timeout: Duration,
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: f64,
    pub max_retry_after: Duration,
    pub backoff_seed: Option<u64>,
}

impl ReconcilerConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> ReconcilerConfigBuilder {
        ReconcilerConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: ReconcilerConfigParams) -> Result<Self> {
        let ReconcilerConfigParams {
            accrual_url,
            poll_interval,
            chunk_size,
            rate_limit,
            claim_timeout,
            metrics_interval,
            request_timeout,
            max_attempts,
            initial_backoff,
            max_backoff,
            jitter,
            max_retry_after,
            backoff_seed,
        } = params;

        let config = Self {
            accrual_url: normalized_url(accrual_url),
            poll_interval,
            chunk_size,
            rate_limit,
            claim_timeout,
            metrics_interval,
            request_timeout,
            max_attempts,
            initial_backoff,
            max_backoff,
            jitter,
            max_retry_after,
            backoff_seed,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reads the process environment, falling back to defaults for unset keys.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`ReconcilerConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder().accrual_url(with_scheme(
            read_or_default(&lookup, ENV_ACCRUAL_URL, DEFAULT_ACCRUAL_URL),
        ));

        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_POLL_INTERVAL)? {
            builder = builder.poll_interval(Duration::from_secs(secs));
        }
        if let Some(rate_limit) = parse_var::<usize, _>(&lookup, ENV_RATE_LIMIT)? {
            builder = builder.rate_limit(rate_limit);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_CLAIM_TIMEOUT)? {
            builder = builder.claim_timeout(Duration::from_secs(secs));
        }
        if let Some(chunk_size) = parse_var::<usize, _>(&lookup, ENV_CHUNK_SIZE)? {
            builder = builder.chunk_size(chunk_size);
        }
        if let Some(millis) = parse_var::<u64, _>(&lookup, ENV_REQUEST_TIMEOUT_MS)? {
            builder = builder.request_timeout(Duration::from_millis(millis));
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_METRICS_INTERVAL)? {
            builder = builder.metrics_interval(Duration::from_secs(secs));
        }

        builder.build()
    }

    /// Base URL of the accrual service, without a trailing slash.
    pub fn accrual_url(&self) -> &str {
        &self.accrual_url
    }

    /// Interval between claim ticks.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Maximum orders claimed per tick. Also the capacity of each stage channel.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of dispatcher workers, i.e. the bound on concurrent accrual requests.
    pub fn rate_limit(&self) -> usize {
        self.rate_limit
    }

    /// Age after which a claim is considered abandoned and may be re-claimed.
    pub fn claim_timeout(&self) -> Duration {
        self.claim_timeout
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn max_retry_after(&self) -> Duration {
        self.max_retry_after
    }

    pub fn backoff_seed(&self) -> Option<u64> {
        self.backoff_seed
    }

    /// Accrual client options derived from this configuration.
    pub fn client_options(&self) -> AccrualClientOptions {
        AccrualClientOptions {
            request_timeout: self.request_timeout,
            max_attempts: self.max_attempts,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            jitter: self.jitter,
            max_retry_after: self.max_retry_after,
            seed: self.backoff_seed,
        }
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        validate_url(&self.accrual_url)?;

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }

        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than 0");
        }

        if self.rate_limit == 0 {
            bail!("rate_limit must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.max_retry_after.is_zero() {
            bail!("max_retry_after must be greater than 0");
        }

        let options = self.client_options();
        options.validate()?;

        if self.poll_interval >= self.claim_timeout {
            bail!(
                "poll_interval ({}ms) must be shorter than claim_timeout ({}ms) so in-flight \
                 claims are renewed before they go stale",
                self.poll_interval.as_millis(),
                self.claim_timeout.as_millis(),
            );
        }

        let worst_case = options.worst_case_fetch();
        if self.claim_timeout <= worst_case {
            bail!(
                "claim_timeout ({}s) must exceed the worst-case fetch duration ({}s); \
                 increase {ENV_CLAIM_TIMEOUT}",
                self.claim_timeout.as_secs(),
                worst_case.as_secs(),
            );
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReconcilerConfigBuilder {
    accrual_url: Option<String>,
    poll_interval: Option<Duration>,
    chunk_size: Option<usize>,
    rate_limit: Option<usize>,
    claim_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
    request_timeout: Option<Duration>,
    max_attempts: Option<usize>,
    initial_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    jitter: Option<f64>,
    max_retry_after: Option<Duration>,
    backoff_seed: Option<u64>,
}

impl ReconcilerConfigBuilder {
    pub fn accrual_url(mut self, url: impl Into<String>) -> Self {
        self.accrual_url = Some(url.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    pub fn rate_limit(mut self, workers: usize) -> Self {
        self.rate_limit = Some(workers);
        self
    }

    pub fn claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = Some(backoff);
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = Some(backoff);
        self
    }

    pub fn jitter(mut self, ratio: f64) -> Self {
        self.jitter = Some(ratio);
        self
    }

    pub fn max_retry_after(mut self, ceiling: Duration) -> Self {
        self.max_retry_after = Some(ceiling);
        self
    }

    /// Fixes the jitter seed so retry timing is reproducible.
    pub fn backoff_seed(mut self, seed: u64) -> Self {
        self.backoff_seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<ReconcilerConfig> {
        let params = ReconcilerConfigParams {
            accrual_url: self.accrual_url.context("accrual_url is required")?,
            poll_interval: self
                .poll_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)),
            chunk_size: self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            rate_limit: self.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT),
            claim_timeout: self
                .claim_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_CLAIM_TIMEOUT_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            request_timeout: self
                .request_timeout
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)),
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            initial_backoff: self
                .initial_backoff
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS)),
            max_backoff: self
                .max_backoff
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_MAX_BACKOFF_MS)),
            jitter: self.jitter.unwrap_or(DEFAULT_JITTER),
            max_retry_after: self
                .max_retry_after
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_MAX_RETRY_AFTER_SECS)),
            backoff_seed: self.backoff_seed,
        };

        ReconcilerConfig::new(params)
    }
}

/// Trims whitespace and trailing slashes from the part after the scheme, so
/// a bare `http://` keeps its scheme and fails the host check.
fn normalized_url(value: String) -> String {
    let value = value.trim();
    match value.split_once("://") {
        Some((scheme, rest)) => format!("{scheme}://{}", rest.trim_end_matches('/')),
        None => value.trim_end_matches('/').to_owned(),
    }
}

fn with_scheme(value: String) -> String {
    let value = value.trim();
    if value.contains("://") {
        value.to_owned()
    } else {
        format!("http://{value}")
    }
}

fn validate_url(url: &str) -> Result<()> {
    let Some(host) = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
    else {
        bail!("accrual_url must start with http:// or https://");
    };
    if host.is_empty() {
        bail!("accrual_url must include a host");
    }
    Ok(())
}

fn read_or_default<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("failed to parse {key}='{value}'")),
        _ => Ok(None),
    }
}
