//! Broker connection state machine
//!
//! Tracks the front session through its lifecycle:
//! - Starting → Connected → Authenticated → LoggedIn on the happy path
//! - Disconnected ↔ Reconnecting while the gateway retries
//! - Error from anywhere (auth/login failure, retries exhausted)
//!
//! Driven only by gateway events. Transitions outside the expected table
//! are still applied, then logged and counted as anomalies.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::gateway::{describe_disconnect_reason, GatewayEvent, RetryPolicy};

const DEFAULT_HISTORY_CAPACITY: usize = 1000;

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Initial state before the first front connection
    Starting,
    /// Front connected, not yet authenticated
    Connected,
    /// Client authentication accepted
    Authenticated,
    /// Logged in, orders may flow
    LoggedIn,
    /// Front lost, waiting for the gateway to retry
    Disconnected,
    /// Gateway retry underway
    Reconnecting,
    /// Unrecoverable without operator action
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Authenticated => write!(f, "AUTHENTICATED"),
            Self::LoggedIn => write!(f, "LOGGED_IN"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

impl ConnectionState {
    /// Whether `from -> to` belongs to the normal lifecycle.
    pub fn is_expected_transition(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::*;
        match (from, to) {
            (_, Error) => true,
            (Error, _) => false,
            (Starting | Disconnected | Reconnecting, Connected) => true,
            (Connected, Authenticated) => true,
            // Fronts without client authentication go straight to login
            (Connected | Authenticated, LoggedIn) => true,
            (Starting | Connected | Authenticated | LoggedIn | Reconnecting, Disconnected) => true,
            (Disconnected | Reconnecting, Reconnecting) => true,
            _ => false,
        }
    }
}

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Gateway event kind that caused it
    pub trigger: String,
    pub message: String,
    pub expected: bool,
    pub at: DateTime<Utc>,
}

/// Immutable copy of the connection state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub last_transition_at: DateTime<Utc>,
    pub disconnect_count: u64,
    pub reconnect_attempt: u32,
    pub last_disconnect_reason: Option<i32>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_heartbeat_lapse_secs: Option<u64>,
    pub anomaly_count: u64,
    pub trading_day: Option<String>,
}

impl ConnectionSnapshot {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Starting,
            last_transition_at: Utc::now(),
            disconnect_count: 0,
            reconnect_attempt: 0,
            last_disconnect_reason: None,
            last_heartbeat_at: None,
            last_heartbeat_lapse_secs: None,
            anomaly_count: 0,
            trading_day: None,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.state == ConnectionState::LoggedIn
    }
}

struct Inner {
    current: ConnectionSnapshot,
    history: VecDeque<TransitionRecord>,
}

pub struct ConnectionStateMachine {
    inner: RwLock<Inner>,
    retry_policy: RetryPolicy,
    history_capacity: usize,
}

impl ConnectionStateMachine {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self::with_history_capacity(retry_policy, DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(retry_policy: RetryPolicy, history_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                current: ConnectionSnapshot::initial(),
                history: VecDeque::new(),
            }),
            retry_policy,
            history_capacity: history_capacity.max(1),
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.read().current.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.read().current.state
    }

    /// Recent transitions, oldest first.
    pub fn history(&self, limit: usize) -> Vec<TransitionRecord> {
        let inner = self.inner.read();
        let skip = inner.history.len().saturating_sub(limit);
        inner.history.iter().skip(skip).cloned().collect()
    }

    /// Feed one gateway event. Returns the transition if the state changed.
    pub fn apply(&self, event: &GatewayEvent) -> Option<TransitionRecord> {
        let mut inner = self.inner.write();

        let (target, message) = match event {
            GatewayEvent::FrontConnected => (ConnectionState::Connected, "front connected".to_string()),
            GatewayEvent::FrontDisconnected { reason } => {
                inner.current.disconnect_count += 1;
                inner.current.last_disconnect_reason = Some(*reason);
                (
                    ConnectionState::Disconnected,
                    format!(
                        "front disconnected: {} (0x{:04x})",
                        describe_disconnect_reason(*reason),
                        reason
                    ),
                )
            }
            GatewayEvent::ReconnectAttempt { attempt } => {
                inner.current.reconnect_attempt = *attempt;
                if self.retry_policy.allows(*attempt) {
                    (
                        ConnectionState::Reconnecting,
                        format!("reconnect attempt {}/{}", attempt, self.retry_policy.max_attempts),
                    )
                } else {
                    (
                        ConnectionState::Error,
                        format!(
                            "retry attempts exhausted ({} > {})",
                            attempt, self.retry_policy.max_attempts
                        ),
                    )
                }
            }
            GatewayEvent::HeartbeatWarning { lapse_secs } => {
                inner.current.last_heartbeat_at = Some(Utc::now());
                inner.current.last_heartbeat_lapse_secs = Some(*lapse_secs);
                debug!(lapse_secs, "heartbeat warning");
                return None;
            }
            GatewayEvent::AuthOk => (ConnectionState::Authenticated, "authenticated".to_string()),
            GatewayEvent::AuthFailed { code, message } => (
                ConnectionState::Error,
                format!("authentication failed ({}): {}", code, message),
            ),
            GatewayEvent::LoginOk { trading_day } => {
                inner.current.reconnect_attempt = 0;
                inner.current.trading_day = Some(trading_day.clone());
                (
                    ConnectionState::LoggedIn,
                    format!("logged in, trading day {}", trading_day),
                )
            }
            GatewayEvent::LoginFailed { code, message } => (
                ConnectionState::Error,
                format!("login failed ({}): {}", code, message),
            ),
            GatewayEvent::LoggedOut => (
                ConnectionState::Disconnected,
                "session closed by operator".to_string(),
            ),
            GatewayEvent::TradingDayChanged { trading_day } => {
                inner.current.trading_day = Some(trading_day.clone());
                return None;
            }
            _ => return None,
        };

        let from = inner.current.state;
        if from == target && target != ConnectionState::Reconnecting {
            debug!(state = %from, trigger = event.kind(), "connection event without state change");
            return None;
        }

        let expected = ConnectionState::is_expected_transition(from, target);
        let record = TransitionRecord {
            from,
            to: target,
            trigger: event.kind().to_string(),
            message,
            expected,
            at: Utc::now(),
        };

        inner.current.state = target;
        inner.current.last_transition_at = record.at;
        if !expected {
            inner.current.anomaly_count += 1;
        }
        if inner.history.len() == self.history_capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(record.clone());
        drop(inner);

        if expected {
            info!(
                from = %record.from,
                to = %record.to,
                trigger = %record.trigger,
                "connection_transition: {}",
                record.message
            );
        } else {
            warn!(
                from = %record.from,
                to = %record.to,
                trigger = %record.trigger,
                "unexpected connection_transition: {}",
                record.message
            );
        }

        Some(record)
    }
}
