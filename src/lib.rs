//! TradeGuard Backend Library
//!
//! Pre-trade risk and compliance monitoring for a CTP-style futures gateway.
//! The binary wires these modules together; tests drive them directly.

pub mod alert;
pub mod api;
pub mod clock;
pub mod config;
pub mod context;
pub mod emergency;
pub mod gateway;
pub mod models;
pub mod monitor;
pub mod validator;

pub use context::{MonitorContext, SubmitOutcome};
