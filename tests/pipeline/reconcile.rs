use std::{sync::Arc, time::Duration};

use crate::support::{
    helpers::{fast_config, init_tracing, memory_store, reconciler, wait_until},
    mock_accrual::{MockAccrual, MockAccrualServer, Reply},
};
use accrual_sync::{OrderStatus, PipelineStage};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const DEADLINE: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconciles_mixed_outcomes_against_mock_service() -> Result<()> {
    init_tracing();
    let accrual = MockAccrual::new();
    accrual.script("1001", [Reply::status("INVESTIGATING")]);
    accrual.script("1002", [Reply::processed(500.5)]);
    accrual.script(
        "1003",
        [
            Reply::Throttled {
                retry_after: Some("1"),
            },
            Reply::status("INVALID"),
        ],
    );
    let server = MockAccrualServer::start(accrual.clone()).await?;

    let store = memory_store(&[("1001", "alice"), ("1002", "bob"), ("1003", "carol")])?;
    let reconciler = reconciler(fast_config(server.url())?, store.clone())?;
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let reconciler = reconciler.clone();
        let shutdown = shutdown.clone();
        async move { reconciler.run(shutdown).await }
    });

    wait_until("orders 1002 and 1003 settle", DEADLINE, || {
        let store = store.clone();
        async move {
            let settled = ["1002", "1003"].iter().try_fold(true, |acc, number| {
                let order = store.order(number)?.context("order missing")?;
                anyhow::Ok(acc && order.status.is_terminal())
            })?;
            Ok(settled)
        }
    })
    .await?;
    wait_until("order 1001 is seen as processing", DEADLINE, || {
        let store = store.clone();
        async move {
            let order = store.order("1001")?.context("order missing")?;
            Ok(order.status == OrderStatus::Processing)
        }
    })
    .await?;

    shutdown.cancel();
    timeout(Duration::from_secs(2), handle)
        .await
        .context("run should return promptly after cancellation")???;

    let investigating = store.order("1001")?.context("order missing")?;
    assert_eq!(investigating.status, OrderStatus::Processing);
    assert_eq!(investigating.accrual, None);
    assert_eq!(store.balance("alice")?.current, Decimal::ZERO);

    let processed = store.order("1002")?.context("order missing")?;
    assert_eq!(processed.status, OrderStatus::Processed);
    assert_eq!(processed.accrual, Some(Decimal::new(5005, 1)));
    assert!(!processed.claimed);
    assert_eq!(store.balance("bob")?.current, Decimal::new(5005, 1));

    let invalid = store.order("1003")?.context("order missing")?;
    assert_eq!(invalid.status, OrderStatus::Invalid);
    assert_eq!(invalid.accrual, None);
    assert_eq!(store.balance("carol")?.current, Decimal::ZERO);
    assert_eq!(accrual.calls("1003"), 2, "one throttled call and one retry");
    assert_eq!(accrual.calls("1002"), 1, "settled orders are not fetched again");

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_fetch_leaves_order_new_and_reports_error() -> Result<()> {
    init_tracing();
    let accrual = MockAccrual::new();
    accrual.script("2001", [Reply::ServerError]);
    let server = MockAccrualServer::start(accrual.clone()).await?;

    let store = memory_store(&[("2001", "dave")])?;
    let reconciler = reconciler(fast_config(server.url())?, store.clone())?;
    let mut errors = reconciler.subscribe_errors();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let reconciler = reconciler.clone();
        let shutdown = shutdown.clone();
        async move { reconciler.run(shutdown).await }
    });

    let error = timeout(DEADLINE, errors.recv())
        .await
        .context("fetch error should be reported")??;
    assert_eq!(error.stage(), PipelineStage::Fetch);
    assert_eq!(error.order(), Some("2001"));

    shutdown.cancel();
    timeout(Duration::from_secs(2), handle)
        .await
        .context("run should return promptly after cancellation")???;

    let order = store.order("2001")?.context("order missing")?;
    assert_eq!(order.status, OrderStatus::New);
    assert_eq!(order.accrual, None);
    assert_eq!(store.balance("dave")?.current, Decimal::ZERO);
    assert!(accrual.calls("2001") >= 3);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_during_long_throttle_returns_promptly() -> Result<()> {
    init_tracing();
    let accrual = MockAccrual::new();
    accrual.script(
        "3001",
        [Reply::Throttled {
            retry_after: Some("5"),
        }],
    );
    let server = MockAccrualServer::start(accrual.clone()).await?;

    let store = memory_store(&[("3001", "erin")])?;
    let reconciler = reconciler(fast_config(server.url())?, store.clone())?;
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let reconciler = Arc::clone(&reconciler);
        let shutdown = shutdown.clone();
        async move { reconciler.run(shutdown).await }
    });

    wait_until("order 3001 is requested", DEADLINE, || {
        let accrual = accrual.clone();
        async move { Ok(accrual.calls("3001") >= 1) }
    })
    .await?;

    shutdown.cancel();
    timeout(Duration::from_secs(2), handle)
        .await
        .context("run should not wait out the throttle")???;

    let order = store.order("3001")?.context("order missing")?;
    assert_eq!(order.status, OrderStatus::New);
    assert_eq!(store.balance("erin")?.current, Decimal::ZERO);

    server.shutdown().await;
    Ok(())
}
