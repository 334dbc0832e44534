//! Order, balance, and accrual-outcome types shared by the reconciliation
//! stages and the storage backends.

use crate::accrual::FetchError;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Internal lifecycle of a submitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    New,
    Processing,
    Processed,
    Invalid,
}

impl OrderStatus {
    pub const PENDING: [OrderStatus; 2] = [OrderStatus::New, OrderStatus::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Processed => "PROCESSED",
            OrderStatus::Invalid => "INVALID",
        }
    }

    /// Terminal orders are never claimed or modified again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Processed | OrderStatus::Invalid)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "NEW" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "PROCESSED" => Ok(OrderStatus::Processed),
            "INVALID" => Ok(OrderStatus::Invalid),
            other => bail!("unknown order status {other:?}"),
        }
    }
}

/// Status vocabulary reported by the accrual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExternalStatus {
    Registered,
    Investigating,
    Processed,
    Invalid,
}

impl ExternalStatus {
    pub fn to_order_status(self) -> OrderStatus {
        match self {
            ExternalStatus::Registered => OrderStatus::New,
            ExternalStatus::Investigating => OrderStatus::Processing,
            ExternalStatus::Processed => OrderStatus::Processed,
            ExternalStatus::Invalid => OrderStatus::Invalid,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub number: String,
    pub owner: String,
    pub status: OrderStatus,
    /// Present if and only if `status` is [`OrderStatus::Processed`].
    pub accrual: Option<Decimal>,
    pub claimed: bool,
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    /// A freshly submitted, unclaimed order.
    pub fn new(number: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            owner: owner.into(),
            status: OrderStatus::New,
            accrual: None,
            claimed: false,
            uploaded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balance {
    pub current: Decimal,
    pub withdrawn: Decimal,
}

/// Body of `GET /api/orders/{number}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AccrualReport {
    pub order: String,
    pub status: ExternalStatus,
    #[serde(default)]
    pub accrual: Option<Decimal>,
}

impl AccrualReport {
    /// Maps the report onto the state transition the store should persist.
    ///
    /// `PROCESSED` always carries an accrual (zero when the service omitted
    /// it); every other status carries none. The update targets `number`,
    /// the order that was claimed, never the number echoed in the body.
    pub fn to_update(&self, number: &str) -> StatusUpdate {
        let status = self.status.to_order_status();
        let accrual = match status {
            OrderStatus::Processed => Some(self.accrual.unwrap_or(Decimal::ZERO)),
            _ => None,
        };
        StatusUpdate {
            number: number.to_string(),
            status,
            accrual,
        }
    }
}

/// Persisted effect of one accrual report.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub number: String,
    pub status: OrderStatus,
    pub accrual: Option<Decimal>,
}

/// Result of fetching one order, travelling as a single value from the
/// dispatcher to the reducer.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub number: String,
    pub result: Result<AccrualReport, FetchError>,
}

impl Outcome {
    pub fn fetched(number: impl Into<String>, report: AccrualReport) -> Self {
        Self {
            number: number.into(),
            result: Ok(report),
        }
    }

    pub fn failed(number: impl Into<String>, error: FetchError) -> Self {
        Self {
            number: number.into(),
            result: Err(error),
        }
    }
}
