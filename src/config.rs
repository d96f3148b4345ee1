//! Monitor configuration
//!
//! Loaded once at startup from TOML (plus a few env overrides) and held in
//! memory afterwards. Thresholds stay mutable at runtime through
//! [`ThresholdUpdate`]; everything else is fixed for the process lifetime.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::emergency::SettlementPolicy;
use crate::gateway::paper::PaperConfig;
use crate::gateway::RetryPolicy;
use crate::models::InstrumentSpec;
use crate::validator::sessions::{china_futures_sessions, TradingSession};

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub thresholds: ThresholdConfig,

    #[serde(default)]
    pub alerts: AlertConfig,

    #[serde(default)]
    pub emergency: EmergencyConfig,

    #[serde(default)]
    pub validator: ValidatorConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

impl Settings {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let settings: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(settings)
    }

    /// Load from `TRADEGUARD_CONFIG` (or `tradeguard.toml`), falling back to
    /// defaults, then apply env overrides.
    pub fn from_env() -> Self {
        let path =
            std::env::var("TRADEGUARD_CONFIG").unwrap_or_else(|_| "tradeguard.toml".to_string());

        let mut settings = Self::load(&path).unwrap_or_else(|e| {
            debug!("Using default settings ({}): {:#}", path, e);
            Self::default()
        });
        settings.apply_env_overrides();
        settings
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("TRADEGUARD_API_BIND") {
            self.api.bind_addr = bind;
        }
        if let Ok(raw) = std::env::var("TRADEGUARD_COOLDOWN_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) => self.thresholds.cooldown_secs = secs,
                Err(e) => warn!(value = %raw, error = %e, "ignoring TRADEGUARD_COOLDOWN_SECS"),
            }
        }
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

// =============================================================================
// GATEWAY
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Retry schedule the gateway follows; the connection monitor only observes it
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Account/position refresh period (seconds, 0 disables)
    #[serde(default = "default_snapshot_refresh_secs")]
    pub snapshot_refresh_secs: u64,

    #[serde(default)]
    pub paper: PaperConfig,
}

fn default_snapshot_refresh_secs() -> u64 {
    5
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            snapshot_refresh_secs: default_snapshot_refresh_secs(),
            paper: PaperConfig::default(),
        }
    }
}

// =============================================================================
// THRESHOLDS
// =============================================================================

/// Activity limits. A limit of 0 disables the metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "default_repeat_limit")]
    pub per_instrument_open_limit: u64,

    #[serde(default = "default_repeat_limit")]
    pub per_instrument_close_limit: u64,

    #[serde(default = "default_repeat_limit")]
    pub per_instrument_cancel_limit: u64,

    #[serde(default = "default_total_limit")]
    pub total_order_limit: u64,

    #[serde(default = "default_total_limit")]
    pub total_cancel_limit: u64,

    /// Heartbeat lapse that raises an alert (seconds)
    #[serde(default = "default_heartbeat_lapse_limit_secs")]
    pub heartbeat_lapse_limit_secs: u64,

    /// Minimum spacing between two alerts for the same key (seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_repeat_limit() -> u64 {
    10
}
fn default_total_limit() -> u64 {
    500
}
fn default_heartbeat_lapse_limit_secs() -> u64 {
    10
}
fn default_cooldown_secs() -> u64 {
    60
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            per_instrument_open_limit: default_repeat_limit(),
            per_instrument_close_limit: default_repeat_limit(),
            per_instrument_cancel_limit: default_repeat_limit(),
            total_order_limit: default_total_limit(),
            total_cancel_limit: default_total_limit(),
            heartbeat_lapse_limit_secs: default_heartbeat_lapse_limit_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl ThresholdConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Apply a partial update, returning the fields that actually changed.
    pub fn apply(&mut self, update: &ThresholdUpdate) -> Vec<ThresholdChange> {
        let mut changes = Vec::new();
        let mut set = |field: &'static str, slot: &mut u64, value: Option<u64>| {
            if let Some(new) = value {
                if *slot != new {
                    changes.push(ThresholdChange {
                        field,
                        old: *slot,
                        new,
                    });
                    *slot = new;
                }
            }
        };

        set(
            "per_instrument_open_limit",
            &mut self.per_instrument_open_limit,
            update.per_instrument_open_limit,
        );
        set(
            "per_instrument_close_limit",
            &mut self.per_instrument_close_limit,
            update.per_instrument_close_limit,
        );
        set(
            "per_instrument_cancel_limit",
            &mut self.per_instrument_cancel_limit,
            update.per_instrument_cancel_limit,
        );
        set(
            "total_order_limit",
            &mut self.total_order_limit,
            update.total_order_limit,
        );
        set(
            "total_cancel_limit",
            &mut self.total_cancel_limit,
            update.total_cancel_limit,
        );
        set(
            "heartbeat_lapse_limit_secs",
            &mut self.heartbeat_lapse_limit_secs,
            update.heartbeat_lapse_limit_secs,
        );
        set("cooldown_secs", &mut self.cooldown_secs, update.cooldown_secs);

        for change in &changes {
            info!(
                field = change.field,
                old = change.old,
                new = change.new,
                "threshold_updated"
            );
        }
        changes
    }
}

/// Partial threshold update; absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdUpdate {
    pub per_instrument_open_limit: Option<u64>,
    pub per_instrument_close_limit: Option<u64>,
    pub per_instrument_cancel_limit: Option<u64>,
    pub total_order_limit: Option<u64>,
    pub total_cancel_limit: Option<u64>,
    pub heartbeat_lapse_limit_secs: Option<u64>,
    pub cooldown_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThresholdChange {
    pub field: &'static str,
    pub old: u64,
    pub new: u64,
}

// =============================================================================
// ALERTS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Alert history ring buffer size
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Broadcast channel capacity for live subscribers
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Deliver alerts to the log
    #[serde(default = "default_true")]
    pub log_alerts: bool,
}

fn default_history_capacity() -> usize {
    1000
}
fn default_broadcast_capacity() -> usize {
    256
}
fn default_true() -> bool {
    true
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            broadcast_capacity: default_broadcast_capacity(),
            log_alerts: true,
        }
    }
}

// =============================================================================
// EMERGENCY
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConfig {
    /// Minimum spacing between two cancel requests (ms)
    #[serde(default = "default_cancel_min_interval_ms")]
    pub cancel_min_interval_ms: u64,

    /// Minimum spacing between two query requests (ms)
    #[serde(default = "default_query_min_interval_ms")]
    pub query_min_interval_ms: u64,

    /// Per-cancel gateway timeout (ms)
    #[serde(default = "default_cancel_timeout_ms")]
    pub cancel_timeout_ms: u64,

    /// How long a cancel waits for a pending insert acknowledgment (ms)
    #[serde(default = "default_insert_ack_timeout_ms")]
    pub insert_ack_timeout_ms: u64,

    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,

    #[serde(default)]
    pub settlement_policy: SettlementPolicy,

    /// Strategy ids registered with the kill switch at startup
    #[serde(default)]
    pub strategies: Vec<String>,
}

fn default_cancel_min_interval_ms() -> u64 {
    100
}
fn default_query_min_interval_ms() -> u64 {
    1000
}
fn default_cancel_timeout_ms() -> u64 {
    5000
}
fn default_insert_ack_timeout_ms() -> u64 {
    3000
}
fn default_event_history_capacity() -> usize {
    500
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            cancel_min_interval_ms: default_cancel_min_interval_ms(),
            query_min_interval_ms: default_query_min_interval_ms(),
            cancel_timeout_ms: default_cancel_timeout_ms(),
            insert_ack_timeout_ms: default_insert_ack_timeout_ms(),
            event_history_capacity: default_event_history_capacity(),
            settlement_policy: SettlementPolicy::default(),
            strategies: Vec::new(),
        }
    }
}

impl EmergencyConfig {
    pub fn cancel_min_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_min_interval_ms)
    }
    pub fn query_min_interval(&self) -> Duration {
        Duration::from_millis(self.query_min_interval_ms)
    }
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }
    pub fn insert_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.insert_ack_timeout_ms)
    }
}

// =============================================================================
// VALIDATOR
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Initial instrument reference set; replaced by gateway queries when available
    #[serde(default)]
    pub instruments: Vec<InstrumentSpec>,

    /// Calendar for instruments without their own sessions
    #[serde(default = "china_futures_sessions")]
    pub default_sessions: Vec<TradingSession>,

    #[serde(default = "default_true")]
    pub weekdays_only: bool,

    /// Absolute price tolerance for the tick check
    #[serde(default = "default_tick_tolerance")]
    pub tick_tolerance: f64,

    /// Exchange local time offset from UTC (seconds, +08:00 by default)
    #[serde(default = "default_exchange_utc_offset_secs")]
    pub exchange_utc_offset_secs: i32,
}

fn default_tick_tolerance() -> f64 {
    1e-6
}
fn default_exchange_utc_offset_secs() -> i32 {
    8 * 3600
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            instruments: Vec::new(),
            default_sessions: china_futures_sessions(),
            weekdays_only: true,
            tick_tolerance: default_tick_tolerance(),
            exchange_utc_offset_secs: default_exchange_utc_offset_secs(),
        }
    }
}

// =============================================================================
// API
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8087".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}
