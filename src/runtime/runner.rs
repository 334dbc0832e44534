use crate::processor::supervisor::Reconciler;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns a background [`Reconciler`] task and its root shutdown token.
pub struct Runner {
    reconciler: Arc<Reconciler>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Runner {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawns the reconciliation loop. Calling it again while running is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let reconciler = self.reconciler.clone();
        let shutdown = self.shutdown.clone();
        self.handle = Some(tokio::spawn(async move { reconciler.run(shutdown).await }));
        Ok(())
    }

    /// Cancels the root token and waits for every stage to wind down.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        self.shutdown.cancel();
        let result = handle
            .await
            .map_err(|err| anyhow!("reconciler task failed: {err}"));
        self.shutdown = CancellationToken::new();
        result?
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start()?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "failed to listen for Ctrl-C; shutting down");
                } else {
                    tracing::info!("Ctrl-C received; shutting down runner");
                }
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.stop().await
    }
}
