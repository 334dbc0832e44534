use crate::model::{Balance, Order, OrderStatus, StatusUpdate};
use crate::store::{ApplyResult, OrderStore, StoreFuture};
use anyhow::{anyhow, bail, Result};
use futures::future;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// In-process order store. Each operation runs under a single lock, which
/// gives the same all-or-nothing guarantees the Postgres backend gets from
/// transactions.
#[derive(Debug, Default)]
pub struct MemoryOrderStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    orders: HashMap<String, StoredOrder>,
    balances: HashMap<String, Balance>,
}

#[derive(Debug)]
struct StoredOrder {
    order: Order,
    claimed_at: Option<Instant>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an order. A claimed order is stamped as claimed now.
    pub fn insert_order(&self, order: Order) -> Result<()> {
        let mut state = self.lock()?;
        let claimed_at = order.claimed.then(Instant::now);
        state
            .orders
            .insert(order.number.clone(), StoredOrder { order, claimed_at });
        Ok(())
    }

    pub fn order(&self, number: &str) -> Result<Option<Order>> {
        let state = self.lock()?;
        Ok(state.orders.get(number).map(|stored| stored.order.clone()))
    }

    pub fn balance(&self, owner: &str) -> Result<Balance> {
        let state = self.lock()?;
        Ok(state.balances.get(owner).copied().unwrap_or_default())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.orders.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory order store lock poisoned"))
    }

    fn claim(&self, limit: usize, claim_timeout: Duration) -> Result<Vec<Order>> {
        let mut state = self.lock()?;
        let now = Instant::now();

        let mut eligible: Vec<&mut StoredOrder> = state
            .orders
            .values_mut()
            .filter(|stored| !stored.order.status.is_terminal())
            .filter(|stored| {
                !stored.order.claimed
                    || stored
                        .claimed_at
                        .map_or(true, |at| now.duration_since(at) >= claim_timeout)
            })
            .collect();
        eligible.sort_by(|a, b| {
            a.order
                .uploaded_at
                .cmp(&b.order.uploaded_at)
                .then_with(|| a.order.number.cmp(&b.order.number))
        });

        Ok(eligible
            .into_iter()
            .take(limit)
            .map(|stored| {
                stored.order.claimed = true;
                stored.claimed_at = Some(now);
                stored.order.clone()
            })
            .collect())
    }

    fn apply(&self, update: &StatusUpdate) -> Result<ApplyResult> {
        let mut state = self.lock()?;
        let MemoryState { orders, balances } = &mut *state;

        let Some(stored) = orders.get_mut(&update.number) else {
            bail!("order {} not found", update.number);
        };
        if stored.order.status.is_terminal() {
            return Ok(ApplyResult::AlreadySettled);
        }

        stored.order.claimed = false;
        stored.claimed_at = None;

        if !update.status.is_terminal() {
            if !(stored.order.status == OrderStatus::Processing
                && update.status == OrderStatus::New)
            {
                stored.order.status = update.status;
            }
            return Ok(ApplyResult::Requeued);
        }

        let credited = match update.status {
            OrderStatus::Processed => update.accrual.unwrap_or(Decimal::ZERO),
            _ => Decimal::ZERO,
        };
        stored.order.status = update.status;
        stored.order.accrual = (update.status == OrderStatus::Processed).then_some(credited);

        let owner = stored.order.owner.clone();
        if credited > Decimal::ZERO {
            balances.entry(owner.clone()).or_default().current += credited;
        }

        Ok(ApplyResult::Settled { owner, credited })
    }

    fn release(&self, number: &str) -> Result<bool> {
        let mut state = self.lock()?;
        match state.orders.get_mut(number) {
            Some(stored) if stored.order.claimed && !stored.order.status.is_terminal() => {
                stored.order.claimed = false;
                stored.claimed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn renew(&self, numbers: &[String]) -> Result<usize> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let mut renewed = 0;
        for number in numbers {
            if let Some(stored) = state.orders.get_mut(number) {
                if stored.order.claimed && !stored.order.status.is_terminal() {
                    stored.claimed_at = Some(now);
                    renewed += 1;
                }
            }
        }
        Ok(renewed)
    }
}

impl OrderStore for MemoryOrderStore {
    fn claim_pending_batch<'a>(
        &'a self,
        limit: usize,
        claim_timeout: Duration,
    ) -> StoreFuture<'a, Vec<Order>> {
        Box::pin(future::ready(self.claim(limit, claim_timeout)))
    }

    fn apply_outcome<'a>(&'a self, update: &'a StatusUpdate) -> StoreFuture<'a, ApplyResult> {
        Box::pin(future::ready(self.apply(update)))
    }

    fn release_claim<'a>(&'a self, number: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(future::ready(self.release(number)))
    }

    fn renew_claims<'a>(&'a self, numbers: &'a [String]) -> StoreFuture<'a, usize> {
        Box::pin(future::ready(self.renew(numbers)))
    }
}
