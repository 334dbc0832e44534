//! Runtime glue that wires configuration, the error stream, telemetry, and
//! runner orchestration.

pub mod config;
pub mod error;
pub mod runner;
pub mod telemetry;
