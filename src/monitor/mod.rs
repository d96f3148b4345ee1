//! Gateway-driven monitoring: connection lifecycle, order activity
//! counters and threshold alerting.

pub mod activity;
pub mod connection;
pub mod threshold;
