use crate::model::{Balance, Order, OrderStatus, StatusUpdate};
use crate::store::{ApplyResult, OrderStore, StoreFuture};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

const DEFAULT_MAX_CONNECTIONS: u32 = 8;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        number      TEXT PRIMARY KEY,
        owner       TEXT NOT NULL,
        status      TEXT NOT NULL DEFAULT 'NEW',
        accrual     NUMERIC,
        claimed     BOOLEAN NOT NULL DEFAULT FALSE,
        claimed_at  TIMESTAMPTZ,
        uploaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS orders_pending_idx
        ON orders (uploaded_at)
        WHERE status IN ('NEW', 'PROCESSING')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS balances (
        owner     TEXT PRIMARY KEY,
        current   NUMERIC NOT NULL DEFAULT 0,
        withdrawn NUMERIC NOT NULL DEFAULT 0
    )
    "#,
];

const CLAIM_SQL: &str = r#"
    UPDATE orders
    SET claimed = TRUE, claimed_at = NOW()
    WHERE number IN (
        SELECT number FROM orders
        WHERE status IN ('NEW', 'PROCESSING')
          AND (claimed = FALSE
               OR claimed_at IS NULL
               OR claimed_at <= NOW() - make_interval(secs => $2))
        ORDER BY uploaded_at, number
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    )
    RETURNING number, owner, status, accrual, claimed, uploaded_at
"#;

// A `NEW` report never moves a `PROCESSING` order backwards.
const APPLY_SQL: &str = r#"
    UPDATE orders
    SET status = CASE
            WHEN $2 = 'NEW' AND status = 'PROCESSING' THEN status
            ELSE $2
        END,
        accrual = $3,
        claimed = FALSE,
        claimed_at = NULL
    WHERE number = $1 AND status IN ('NEW', 'PROCESSING')
    RETURNING owner
"#;

const CREDIT_SQL: &str = r#"
    INSERT INTO balances (owner, current, withdrawn)
    VALUES ($1, $2, 0)
    ON CONFLICT (owner) DO UPDATE SET current = balances.current + EXCLUDED.current
"#;

const RELEASE_SQL: &str = r#"
    UPDATE orders
    SET claimed = FALSE, claimed_at = NULL
    WHERE number = $1 AND claimed = TRUE AND status IN ('NEW', 'PROCESSING')
"#;

const RENEW_SQL: &str = r#"
    UPDATE orders
    SET claimed_at = NOW()
    WHERE number = ANY($1) AND claimed = TRUE AND status IN ('NEW', 'PROCESSING')
"#;

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    number: String,
    owner: String,
    status: String,
    accrual: Option<Decimal>,
    claimed: bool,
    uploaded_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = anyhow::Error;

    fn try_from(row: OrderRow) -> Result<Self> {
        let status: OrderStatus = row
            .status
            .parse()
            .with_context(|| format!("order {} has an invalid status", row.number))?;
        Ok(Order {
            number: row.number,
            owner: row.owner,
            status,
            accrual: row.accrual,
            claimed: row.claimed,
            uploaded_at: row.uploaded_at,
        })
    }
}

/// Postgres-backed order store. Claims use `FOR UPDATE SKIP LOCKED` so
/// concurrent pollers never pick the same row; applies run in a transaction.
#[derive(Debug, Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(database_url)
            .await
            .context("failed to connect to postgres")?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to apply order store schema")?;
        }
        Ok(())
    }

    /// Inserts a new order; used by seeding code and tests.
    pub async fn insert_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            "INSERT INTO orders (number, owner, status, accrual, claimed, uploaded_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&order.number)
        .bind(&order.owner)
        .bind(order.status.as_str())
        .bind(order.accrual)
        .bind(order.claimed)
        .bind(order.uploaded_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert order {}", order.number))?;
        Ok(())
    }

    pub async fn order(&self, number: &str) -> Result<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(
            "SELECT number, owner, status, accrual, claimed, uploaded_at \
             FROM orders WHERE number = $1",
        )
        .bind(number)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load order {number}"))?;
        row.map(Order::try_from).transpose()
    }

    pub async fn balance(&self, owner: &str) -> Result<Balance> {
        let row: Option<(Decimal, Decimal)> =
            sqlx::query_as("SELECT current, withdrawn FROM balances WHERE owner = $1")
                .bind(owner)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("failed to load balance for {owner}"))?;
        Ok(row
            .map(|(current, withdrawn)| Balance { current, withdrawn })
            .unwrap_or_default())
    }

    async fn claim(&self, limit: usize, claim_timeout: Duration) -> Result<Vec<Order>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<OrderRow> = sqlx::query_as(CLAIM_SQL)
            .bind(limit)
            .bind(claim_timeout.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .context("failed to claim pending orders")?;

        let mut orders = rows
            .into_iter()
            .map(Order::try_from)
            .collect::<Result<Vec<_>>>()?;
        orders.sort_by(|a, b| {
            a.uploaded_at
                .cmp(&b.uploaded_at)
                .then_with(|| a.number.cmp(&b.number))
        });
        Ok(orders)
    }

    async fn apply(&self, update: &StatusUpdate) -> Result<ApplyResult> {
        let credited = match update.status {
            OrderStatus::Processed => update.accrual.unwrap_or(Decimal::ZERO),
            _ => Decimal::ZERO,
        };
        let accrual = (update.status == OrderStatus::Processed).then_some(credited);

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open apply transaction")?;

        let owner: Option<String> = sqlx::query_scalar(APPLY_SQL)
            .bind(&update.number)
            .bind(update.status.as_str())
            .bind(accrual)
            .fetch_optional(&mut *tx)
            .await
            .with_context(|| format!("failed to update order {}", update.number))?;

        let Some(owner) = owner else {
            let exists: Option<String> =
                sqlx::query_scalar("SELECT status FROM orders WHERE number = $1")
                    .bind(&update.number)
                    .fetch_optional(&mut *tx)
                    .await
                    .with_context(|| format!("failed to load order {}", update.number))?;
            tx.rollback().await.context("failed to roll back apply")?;
            if exists.is_none() {
                bail!("order {} not found", update.number);
            }
            return Ok(ApplyResult::AlreadySettled);
        };

        if !update.status.is_terminal() {
            tx.commit().await.context("failed to commit status update")?;
            return Ok(ApplyResult::Requeued);
        }

        if credited > Decimal::ZERO {
            sqlx::query(CREDIT_SQL)
                .bind(&owner)
                .bind(credited)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to credit balance for {owner}"))?;
        }

        tx.commit()
            .await
            .with_context(|| format!("failed to commit settlement of {}", update.number))?;
        Ok(ApplyResult::Settled { owner, credited })
    }

    async fn release(&self, number: &str) -> Result<bool> {
        let result = sqlx::query(RELEASE_SQL)
            .bind(number)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to release claim on {number}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn renew(&self, numbers: &[String]) -> Result<usize> {
        if numbers.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(RENEW_SQL)
            .bind(numbers)
            .execute(&self.pool)
            .await
            .context("failed to renew in-flight claims")?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

impl OrderStore for PgOrderStore {
    fn claim_pending_batch<'a>(
        &'a self,
        limit: usize,
        claim_timeout: Duration,
    ) -> StoreFuture<'a, Vec<Order>> {
        Box::pin(self.claim(limit, claim_timeout))
    }

    fn apply_outcome<'a>(&'a self, update: &'a StatusUpdate) -> StoreFuture<'a, ApplyResult> {
        Box::pin(self.apply(update))
    }

    fn release_claim<'a>(&'a self, number: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(self.release(number))
    }

    fn renew_claims<'a>(&'a self, numbers: &'a [String]) -> StoreFuture<'a, usize> {
        Box::pin(self.renew(numbers))
    }
}
