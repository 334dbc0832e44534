use std::{collections::HashSet, sync::Arc, time::Duration};

use crate::support::helpers::{
    fast_config, init_tracing, pg_url, reconciler, wait_until, PG_GUARD, PG_URL_ENV,
};
use crate::support::mock_accrual::{MockAccrual, MockAccrualServer, Reply};
use accrual_sync::{
    ApplyResult, Order, OrderStatus, OrderStore, PgOrderStore, StatusUpdate,
};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

const CLAIM_TIMEOUT: Duration = Duration::from_secs(300);

/// Connects to the opt-in test database and empties both tables.
async fn fresh_store() -> Result<Option<PgOrderStore>> {
    let Some(url) = pg_url() else {
        eprintln!("skipping postgres test: {PG_URL_ENV} is not set");
        return Ok(None);
    };
    init_tracing();
    let store = PgOrderStore::connect(&url).await?;
    store.ensure_schema().await?;
    sqlx::query("TRUNCATE orders, balances")
        .execute(store.pool())
        .await
        .context("failed to reset test tables")?;
    Ok(Some(store))
}

fn update(number: &str, status: OrderStatus, accrual: Option<Decimal>) -> StatusUpdate {
    StatusUpdate {
        number: number.to_string(),
        status,
        accrual,
    }
}

#[tokio::test]
async fn claim_apply_and_release_round_trip() -> Result<()> {
    let _guard = PG_GUARD.lock().await;
    let Some(store) = fresh_store().await? else {
        return Ok(());
    };

    for number in ["a1", "a2", "a3"] {
        store.insert_order(&Order::new(number, "alice")).await?;
    }

    let claimed = store.claim_pending_batch(2, CLAIM_TIMEOUT).await?;
    assert_eq!(claimed.len(), 2);
    assert!(claimed.iter().all(|order| order.claimed));

    let first = &claimed[0].number;
    let renewed = store
        .renew_claims(&[first.clone(), "a3".to_string(), "missing".to_string()])
        .await?;
    assert_eq!(renewed, 1, "only held claims are renewed");

    let result = store
        .apply_outcome(&update(first, OrderStatus::Processing, None))
        .await?;
    assert_eq!(result, ApplyResult::Requeued);

    // A late REGISTERED report must not move the order back to NEW.
    store
        .apply_outcome(&update(first, OrderStatus::New, None))
        .await?;
    let order = store.order(first).await?.context("order missing")?;
    assert_eq!(order.status, OrderStatus::Processing);
    assert!(!order.claimed);

    let second = &claimed[1].number;
    assert!(store.release_claim(second).await?);
    assert!(!store.release_claim(second).await?);

    let reclaimed = store.claim_pending_batch(5, CLAIM_TIMEOUT).await?;
    assert_eq!(reclaimed.len(), 3);
    Ok(())
}

#[tokio::test]
async fn processed_outcome_credits_exactly_once() -> Result<()> {
    let _guard = PG_GUARD.lock().await;
    let Some(store) = fresh_store().await? else {
        return Ok(());
    };

    store.insert_order(&Order::new("b1", "bob")).await?;
    let accrual = Decimal::new(5005, 1);
    let processed = update("b1", OrderStatus::Processed, Some(accrual));

    let first = store.apply_outcome(&processed).await?;
    let second = store.apply_outcome(&processed).await?;

    assert_eq!(
        first,
        ApplyResult::Settled {
            owner: "bob".to_string(),
            credited: accrual,
        }
    );
    assert_eq!(second, ApplyResult::AlreadySettled);
    assert_eq!(store.balance("bob").await?.current, accrual);

    let order = store.order("b1").await?.context("order missing")?;
    assert_eq!(order.status, OrderStatus::Processed);
    assert_eq!(order.accrual, Some(accrual));

    let missing = store
        .apply_outcome(&update("nope", OrderStatus::Invalid, None))
        .await;
    assert!(missing.is_err(), "unknown orders are an error");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_overlap() -> Result<()> {
    let _guard = PG_GUARD.lock().await;
    let Some(store) = fresh_store().await? else {
        return Ok(());
    };

    for n in 0..40 {
        store
            .insert_order(&Order::new(format!("c{n:02}"), "carol"))
            .await?;
    }

    let store = Arc::new(store);
    let claims = futures::future::join_all((0..4).map(|_| {
        let store = store.clone();
        tokio::spawn(async move { store.claim_pending_batch(10, CLAIM_TIMEOUT).await })
    }))
    .await;

    let mut seen = HashSet::new();
    for claim in claims {
        for order in claim?? {
            assert!(seen.insert(order.number.clone()), "order {} claimed twice", order.number);
        }
    }
    assert_eq!(seen.len(), 40);
    assert!(store.claim_pending_batch(10, CLAIM_TIMEOUT).await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconciler_settles_orders_in_postgres() -> Result<()> {
    let _guard = PG_GUARD.lock().await;
    let Some(store) = fresh_store().await? else {
        return Ok(());
    };

    let accrual = MockAccrual::new();
    accrual.script("d1", [Reply::processed(120.0)]);
    accrual.script("d2", [Reply::status("INVALID")]);
    let server = MockAccrualServer::start(accrual.clone()).await?;

    store.insert_order(&Order::new("d1", "dave")).await?;
    store.insert_order(&Order::new("d2", "dave")).await?;

    let store = Arc::new(store);
    let reconciler = reconciler(fast_config(server.url())?, store.clone())?;
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let reconciler = reconciler.clone();
        let shutdown = shutdown.clone();
        async move { reconciler.run(shutdown).await }
    });

    wait_until("both orders settle", Duration::from_secs(10), || {
        let store = store.clone();
        async move {
            let d1 = store.order("d1").await?.context("order missing")?;
            let d2 = store.order("d2").await?.context("order missing")?;
            Ok(d1.status.is_terminal() && d2.status.is_terminal())
        }
    })
    .await?;

    shutdown.cancel();
    handle.await??;

    assert_eq!(store.balance("dave").await?.current, Decimal::new(120, 0));
    assert_eq!(
        store.order("d2").await?.context("order missing")?.status,
        OrderStatus::Invalid
    );

    server.shutdown().await;
    Ok(())
}
