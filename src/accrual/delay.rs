use crate::accrual::client::FetchError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Capped exponential backoff with optional multiplicative jitter.
///
/// `delay(attempt)` is a pure function of the attempt index and the seed, so a
/// policy built with [`DelayPolicy::with_seed`] is fully deterministic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    max_hint: Duration,
    seed: u64,
}

impl DelayPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            jitter: 0.0,
            max_hint: max_delay.max(initial_delay),
            seed: rand::random(),
        }
    }

    /// Fraction of the computed delay that may be shaved off at random.
    /// Clamped to `[0, 1]`.
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Upper bound applied to server-provided retry hints.
    pub fn with_max_hint(mut self, max_hint: Duration) -> Self {
        self.max_hint = max_hint;
        self
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Wait before the retry that follows the 0-based `attempt`.
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(31) as u32;
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let base = self
            .initial_delay
            .saturating_mul(multiplier)
            .min(self.max_delay);

        if self.jitter <= f64::EPSILON || base.is_zero() {
            return base;
        }

        let mut rng = StdRng::seed_from_u64(self.seed ^ (attempt as u64).wrapping_mul(0x9E37_79B9));
        let shave = rng.random::<f64>() * self.jitter;
        base.mul_f64(1.0 - shave)
    }

    /// Like [`DelayPolicy::delay`], but a server hint wins when it is longer.
    /// The hint itself is capped so a hostile `Retry-After` cannot stall a worker.
    pub fn delay_with_hint(&self, attempt: usize, hint: Option<Duration>) -> Duration {
        let computed = self.delay(attempt);
        match hint {
            Some(hint) => hint.min(self.max_hint).max(computed),
            None => computed,
        }
    }
}

/// Sleeps for `delay` unless `cancellation` fires first.
pub async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: &CancellationToken,
) -> Result<(), FetchError> {
    if cancellation.is_cancelled() {
        return Err(FetchError::Cancelled);
    }

    if delay.is_zero() {
        yield_now().await;
        return Ok(());
    }

    tokio::select! {
        _ = cancellation.cancelled() => Err(FetchError::Cancelled),
        _ = sleep(delay) => Ok(()),
    }
}
