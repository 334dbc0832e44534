//! Order repository contract consumed by the reconciliation stages, plus the
//! in-memory and Postgres backends.

pub mod memory;
pub mod postgres;

use crate::model::{Order, StatusUpdate};
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use std::time::Duration;

pub use memory::MemoryOrderStore;
pub use postgres::PgOrderStore;

pub type StoreFuture<'a, T> = BoxFuture<'a, anyhow::Result<T>>;

/// What `apply_outcome` did to the stored order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyResult {
    /// Non-terminal status persisted; the claim was cleared.
    Requeued,
    /// Terminal status persisted together with the owner's credit.
    Settled { owner: String, credited: Decimal },
    /// The order was already terminal; nothing changed.
    AlreadySettled,
}

/// Persistence operations the pipeline needs. Every method must be atomic on
/// its own; implementations are shared across tasks.
pub trait OrderStore: Send + Sync + 'static {
    /// Claims up to `limit` pending orders that are unclaimed or whose claim is
    /// older than `claim_timeout`, marking them claimed in the same step.
    fn claim_pending_batch<'a>(
        &'a self,
        limit: usize,
        claim_timeout: Duration,
    ) -> StoreFuture<'a, Vec<Order>>;

    /// Persists `update` if the order is still pending. A terminal update and
    /// the matching balance credit commit together or not at all.
    fn apply_outcome<'a>(&'a self, update: &'a StatusUpdate) -> StoreFuture<'a, ApplyResult>;

    /// Clears the claim on a pending order. Returns whether a claim was held.
    fn release_claim<'a>(&'a self, number: &'a str) -> StoreFuture<'a, bool>;

    /// Re-stamps the claim time of the given orders that are still claimed
    /// and pending, so the staleness sweep never takes an order that is still
    /// being worked on. Returns how many claims were renewed.
    fn renew_claims<'a>(&'a self, numbers: &'a [String]) -> StoreFuture<'a, usize>;
}
