use std::time::{Duration, Instant};

use crate::support::{
    helpers::{fast_client_options, init_tracing},
    mock_accrual::{MockAccrual, MockAccrualServer, Reply},
};
use accrual_sync::{AccrualClient, AccrualClientOptions, ExternalStatus, FetchError};
use anyhow::Result;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn decodes_processed_report_with_fractional_accrual() -> Result<()> {
    init_tracing();
    let accrual = MockAccrual::new();
    accrual.script("12345678903", [Reply::processed(500.5)]);
    let server = MockAccrualServer::start(accrual.clone()).await?;

    let client = AccrualClient::with_options(server.url(), fast_client_options())?;
    let report = client
        .fetch_outcome("12345678903", &CancellationToken::new())
        .await?;

    assert_eq!(report.order, "12345678903");
    assert_eq!(report.status, ExternalStatus::Processed);
    assert_eq!(report.accrual, Some(Decimal::new(5005, 1)));
    assert_eq!(client.metrics().total_requests, 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn throttled_request_waits_for_retry_after() -> Result<()> {
    init_tracing();
    let accrual = MockAccrual::new();
    accrual.script(
        "42",
        [
            Reply::Throttled {
                retry_after: Some("1"),
            },
            Reply::status("INVALID"),
        ],
    );
    let server = MockAccrualServer::start(accrual.clone()).await?;
    let client = AccrualClient::with_options(server.url(), fast_client_options())?;

    let started = Instant::now();
    let report = client.fetch_outcome("42", &CancellationToken::new()).await?;

    assert!(
        started.elapsed() >= Duration::from_secs(1),
        "retry fired after {:?}, before the Retry-After hint",
        started.elapsed()
    );
    assert_eq!(report.status, ExternalStatus::Invalid);
    assert_eq!(accrual.calls("42"), 2);
    let metrics = client.metrics();
    assert_eq!(metrics.total_throttled, 1);
    assert_eq!(metrics.total_retries, 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn server_errors_exhaust_the_attempt_budget() -> Result<()> {
    init_tracing();
    let accrual = MockAccrual::new();
    accrual.script("7", [Reply::ServerError]);
    let server = MockAccrualServer::start(accrual.clone()).await?;
    let client = AccrualClient::with_options(
        server.url(),
        AccrualClientOptions {
            max_attempts: 3,
            ..fast_client_options()
        },
    )?;

    let err = client
        .fetch_outcome("7", &CancellationToken::new())
        .await
        .expect_err("persistent 500s should fail");

    match err {
        FetchError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert_eq!(*last, FetchError::Server { code: 500 });
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    assert_eq!(accrual.calls("7"), 3);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unregistered_order_is_not_retried() -> Result<()> {
    init_tracing();
    let accrual = MockAccrual::new();
    let server = MockAccrualServer::start(accrual.clone()).await?;
    let client = AccrualClient::with_options(server.url(), fast_client_options())?;

    let err = client
        .fetch_outcome("404", &CancellationToken::new())
        .await
        .expect_err("204 should be reported");

    assert_eq!(err, FetchError::Unregistered);
    assert_eq!(accrual.calls("404"), 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() -> Result<()> {
    init_tracing();
    let accrual = MockAccrual::new();
    accrual.script("9", [Reply::Raw(r#"{"order":"9","status":"LOST"}"#)]);
    let server = MockAccrualServer::start(accrual.clone()).await?;
    let client = AccrualClient::with_options(server.url(), fast_client_options())?;

    let err = client
        .fetch_outcome("9", &CancellationToken::new())
        .await
        .expect_err("unknown status should not decode");

    assert!(matches!(err, FetchError::Decode(_)), "got {err:?}");
    assert_eq!(accrual.calls("9"), 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cancellation_interrupts_a_throttle_wait() -> Result<()> {
    init_tracing();
    let accrual = MockAccrual::new();
    accrual.script(
        "5",
        [Reply::Throttled {
            retry_after: Some("5"),
        }],
    );
    let server = MockAccrualServer::start(accrual.clone()).await?;
    let client = AccrualClient::with_options(server.url(), fast_client_options())?;
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        })
    };

    let started = Instant::now();
    let err = client
        .fetch_outcome("5", &cancel)
        .await
        .expect_err("cancelled fetch should fail");

    assert_eq!(err, FetchError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(accrual.calls("5"), 1);

    canceller.await?;
    server.shutdown().await;
    Ok(())
}
