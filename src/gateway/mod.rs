//! Broker gateway boundary
//!
//! The gateway owns the broker session: it connects, retries, and delivers
//! SPI callbacks. This crate only sees it through the [`Gateway`] command
//! trait and the closed [`GatewayEvent`] set fed to a single ingestion point.

pub mod paper;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{
    AccountSnapshot, Direction, InstrumentSpec, Offset, OrderRef, OrderRequest, OrderStatus,
    PositionSnapshot,
};

// =============================================================================
// EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStatus {
    Accepted,
    Rejected,
}

/// Everything the gateway can tell us, as tagged variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    FrontConnected,
    FrontDisconnected {
        reason: i32,
    },
    /// Gateway is about to retry the front connection
    ReconnectAttempt {
        attempt: u32,
    },
    HeartbeatWarning {
        lapse_secs: u64,
    },
    AuthOk,
    AuthFailed {
        code: i32,
        message: String,
    },
    LoginOk {
        trading_day: String,
    },
    LoginFailed {
        code: i32,
        message: String,
    },
    /// Session closed on request; the gateway will not reconnect on its own
    LoggedOut,
    OrderAck {
        order_ref: OrderRef,
        instrument_id: String,
        direction: Direction,
        offset: Offset,
        volume: i32,
        status: OrderStatus,
        #[serde(default)]
        order_sys_id: Option<String>,
    },
    Trade {
        order_ref: OrderRef,
        instrument_id: String,
        price: f64,
        volume: i32,
    },
    CancelAck {
        order_ref: OrderRef,
        instrument_id: String,
        status: CancelStatus,
    },
    Error {
        code: i32,
        message: String,
    },
    TradingDayChanged {
        trading_day: String,
    },
}

impl GatewayEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FrontConnected => "front_connected",
            Self::FrontDisconnected { .. } => "front_disconnected",
            Self::ReconnectAttempt { .. } => "reconnect_attempt",
            Self::HeartbeatWarning { .. } => "heartbeat_warning",
            Self::AuthOk => "auth_ok",
            Self::AuthFailed { .. } => "auth_failed",
            Self::LoginOk { .. } => "login_ok",
            Self::LoginFailed { .. } => "login_failed",
            Self::LoggedOut => "logged_out",
            Self::OrderAck { .. } => "order_ack",
            Self::Trade { .. } => "trade",
            Self::CancelAck { .. } => "cancel_ack",
            Self::Error { .. } => "error",
            Self::TradingDayChanged { .. } => "trading_day_changed",
        }
    }
}

/// Broker meaning of a front disconnect reason code.
pub fn describe_disconnect_reason(reason: i32) -> &'static str {
    match reason {
        0x1001 => "network read failure",
        0x1002 => "network write failure",
        0x2001 => "heartbeat receive timeout",
        0x2002 => "heartbeat send failure",
        0x2003 => "received bad packet",
        _ => "unknown reason",
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

/// Addresses an order for cancellation, by client ref and/or exchange id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTarget {
    pub order_ref: OrderRef,
    pub instrument_id: String,
    pub order_sys_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    NotConnected,
    Rejected { code: i32, message: String },
    Timeout,
    Throttled,
    Other(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::NotConnected => write!(f, "gateway not connected"),
            GatewayError::Rejected { code, message } => {
                write!(f, "rejected by broker ({}): {}", code, message)
            }
            GatewayError::Timeout => write!(f, "gateway request timed out"),
            GatewayError::Throttled => write!(f, "gateway request throttled"),
            GatewayError::Other(msg) => write!(f, "gateway error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

#[async_trait::async_trait]
pub trait Gateway: Send + Sync {
    async fn connect(&self) -> Result<(), GatewayError>;

    async fn authenticate(&self) -> Result<(), GatewayError>;

    async fn login(&self) -> Result<(), GatewayError>;

    /// Log out and release the front. No reconnect follows.
    async fn logout(&self) -> Result<(), GatewayError>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderRef, GatewayError>;

    async fn cancel_order(&self, target: &CancelTarget) -> Result<(), GatewayError>;

    async fn query_account(&self) -> Result<AccountSnapshot, GatewayError>;

    async fn query_position(
        &self,
        instrument_id: Option<&str>,
    ) -> Result<Vec<PositionSnapshot>, GatewayError>;

    async fn query_instruments(&self) -> Result<Vec<InstrumentSpec>, GatewayError>;
}

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Reconnect schedule followed by the gateway.
///
/// Exponential: `base * multiplier^(attempt-1)`, capped at `max_delay_ms`.
/// Attempts are numbered from 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    10
}
fn default_base_delay_ms() -> u64 {
    5_000
}
fn default_multiplier() -> f64 {
    1.5
}
fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn allows(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }

    /// Delay before the given attempt, None once attempts are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if !self.allows(attempt) {
            return None;
        }
        let exp = (attempt - 1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = raw.min(self.max_delay_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }
}
