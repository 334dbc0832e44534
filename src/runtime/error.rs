use crate::runtime::telemetry::Telemetry;
use anyhow::Error as AnyError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default number of buffered errors per subscriber before lagging.
pub const DEFAULT_ERROR_CHANNEL_CAPACITY: usize = 64;

/// Pipeline stage an operational error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Claim,
    Renew,
    Fetch,
    Apply,
    Release,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Claim => "claim",
            PipelineStage::Renew => "claim renewal",
            PipelineStage::Fetch => "fetch",
            PipelineStage::Apply => "apply",
            PipelineStage::Release => "release",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-fatal error surfaced to the embedding application. The pipeline keeps
/// running after every instance.
#[derive(Debug, Clone)]
pub struct PipelineError {
    stage: PipelineStage,
    order: Option<String>,
    source: Arc<AnyError>,
}

impl PipelineError {
    pub fn new(stage: PipelineStage, source: AnyError) -> Self {
        Self {
            stage,
            order: None,
            source: Arc::new(source),
        }
    }

    pub fn for_order(stage: PipelineStage, order: impl Into<String>, source: AnyError) -> Self {
        Self {
            stage,
            order: Some(order.into()),
            source: Arc::new(source),
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn order(&self) -> Option<&str> {
        self.order.as_deref()
    }

    pub fn cause(&self) -> &AnyError {
        &self.source
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.order {
            Some(order) => write!(f, "{} failed for order {order}: {:#}", self.stage, self.source),
            None => write!(f, "{} failed: {:#}", self.stage, self.source),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&**self.source)
    }
}

/// Fans operational errors out to the log, the telemetry counters, and any
/// subscribers of the error stream.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    telemetry: Arc<Telemetry>,
    tx: broadcast::Sender<PipelineError>,
}

impl ErrorReporter {
    pub fn new(telemetry: Arc<Telemetry>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { telemetry, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineError> {
        self.tx.subscribe()
    }

    pub fn report(&self, error: PipelineError) {
        tracing::warn!(
            stage = %error.stage(),
            order = error.order().unwrap_or("-"),
            error = %format!("{:#}", error.cause()),
            "reconciliation error"
        );
        self.telemetry.record_error(error.stage());
        // No subscribers is fine; the log line above is the durable record.
        let _ = self.tx.send(error);
    }
}
