//! Fakes shared by the processor unit tests.

use crate::accrual::{FetchError, OutcomeFetcher};
use crate::model::{AccrualReport, ExternalStatus, Order, StatusUpdate};
use crate::store::{ApplyResult, MemoryOrderStore, OrderStore, StoreFuture};
use anyhow::anyhow;
use futures::future::{self, BoxFuture};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) fn report(number: &str, status: ExternalStatus, accrual: Option<Decimal>) -> AccrualReport {
    AccrualReport {
        order: number.to_string(),
        status,
        accrual,
    }
}

pub(crate) fn claimed_order(number: &str, owner: &str) -> Order {
    let mut order = Order::new(number, owner);
    order.claimed = true;
    order
}

/// Memory store whose operations can be made to fail on demand.
#[derive(Debug, Default)]
pub(crate) struct FlakyStore {
    pub inner: MemoryOrderStore,
    pub failing_claims: AtomicUsize,
    pub fail_apply: AtomicBool,
    pub fail_release: AtomicBool,
    pub fail_renew: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl OrderStore for FlakyStore {
    fn claim_pending_batch<'a>(
        &'a self,
        limit: usize,
        claim_timeout: Duration,
    ) -> StoreFuture<'a, Vec<Order>> {
        let failing = self
            .failing_claims
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Box::pin(future::ready(Err(anyhow!("claim query failed"))));
        }
        self.inner.claim_pending_batch(limit, claim_timeout)
    }

    fn apply_outcome<'a>(&'a self, update: &'a StatusUpdate) -> StoreFuture<'a, ApplyResult> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Box::pin(future::ready(Err(anyhow!("apply transaction aborted"))));
        }
        self.inner.apply_outcome(update)
    }

    fn release_claim<'a>(&'a self, number: &'a str) -> StoreFuture<'a, bool> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Box::pin(future::ready(Err(anyhow!("release failed"))));
        }
        self.inner.release_claim(number)
    }

    fn renew_claims<'a>(&'a self, numbers: &'a [String]) -> StoreFuture<'a, usize> {
        if self.fail_renew.load(Ordering::SeqCst) {
            return Box::pin(future::ready(Err(anyhow!("renew failed"))));
        }
        self.inner.renew_claims(numbers)
    }
}

/// Fetcher answering synchronously from a closure and counting calls.
pub(crate) struct StaticFetcher<F> {
    respond: F,
    pub calls: AtomicUsize,
}

impl<F> StaticFetcher<F>
where
    F: Fn(&str) -> Result<AccrualReport, FetchError> + Send + Sync,
{
    pub fn new(respond: F) -> Arc<Self> {
        Arc::new(Self {
            respond,
            calls: AtomicUsize::new(0),
        })
    }
}

impl<F> OutcomeFetcher for StaticFetcher<F>
where
    F: Fn(&str) -> Result<AccrualReport, FetchError> + Send + Sync,
{
    fn fetch_outcome<'a>(
        &'a self,
        number: &'a str,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<AccrualReport, FetchError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)(number)
        })
    }
}
