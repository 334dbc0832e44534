//! Configurable knobs for the accrual client along with validation helpers so
//! callers can reason about timeouts and retry/backoff limits.

use crate::accrual::delay::DelayPolicy;
use anyhow::{bail, Result};
use std::time::Duration;

pub(crate) const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
pub(crate) const DEFAULT_MAX_ATTEMPTS: usize = 3;
pub(crate) const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;
pub(crate) const DEFAULT_MAX_BACKOFF_MS: u64 = 2_000;
pub(crate) const DEFAULT_JITTER: f64 = 0.2;
pub(crate) const DEFAULT_MAX_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct AccrualClientOptions {
    pub request_timeout: Duration,
    /// Total attempts per logical fetch, including the first one.
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: f64,
    /// Ceiling applied to `Retry-After` hints.
    pub max_retry_after: Duration,
    /// Fixed jitter seed; `None` draws one at construction.
    pub seed: Option<u64>,
}

impl Default for AccrualClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            jitter: DEFAULT_JITTER,
            max_retry_after: Duration::from_secs(DEFAULT_MAX_RETRY_AFTER_SECS),
            seed: None,
        }
    }
}

impl AccrualClientOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be greater than 0");
        }
        if self.initial_backoff.is_zero() {
            bail!("initial_backoff must be greater than 0");
        }
        if self.max_backoff < self.initial_backoff {
            bail!("max_backoff must be at least initial_backoff");
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            bail!("jitter must be within [0, 1]");
        }
        Ok(())
    }

    pub(crate) fn delay_policy(&self) -> DelayPolicy {
        let policy = DelayPolicy::new(self.initial_backoff, self.max_backoff)
            .with_jitter(self.jitter)
            .with_max_hint(self.max_retry_after);
        match self.seed {
            Some(seed) => policy.with_seed(seed),
            None => policy,
        }
    }

    /// Longest a single logical fetch can take when every attempt times out
    /// and every wait hits its ceiling.
    pub fn worst_case_fetch(&self) -> Duration {
        let attempts = self.max_attempts.min(u32::MAX as usize) as u32;
        let waits = attempts.saturating_sub(1);
        let longest_wait = self.max_backoff.max(self.max_retry_after);
        self.request_timeout
            .saturating_mul(attempts)
            .saturating_add(longest_wait.saturating_mul(waits))
    }
}
