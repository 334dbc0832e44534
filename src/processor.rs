//! Reconciliation stages: pending-order source, rate-limited dispatcher,
//! outcome reducer, and the supervisor that wires them together.

pub mod dispatcher;
pub mod inflight;
pub mod reducer;
pub mod source;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::Dispatcher;
pub use inflight::InFlightOrders;
pub use reducer::OutcomeReducer;
pub use source::{PendingOrderSource, PendingOrderSourceParams};
pub use supervisor::Reconciler;
