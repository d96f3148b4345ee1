//! Threshold evaluation and alert cooldowns
//!
//! Gateway ingestion never evaluates thresholds itself. It enqueues a
//! [`MonitorSignal`] on an unbounded channel and [`run_threshold_worker`]
//! drains it on its own task.
//!
//! Cooldowns are keyed by (metric, instrument-or-account) and measured on
//! the monotonic clock. Counter metrics also keep the highest value seen per
//! key: updates can reach the worker out of order, and a stale lower value
//! is ignored rather than treated as a recovery. A key is released only when
//! its current value is under the limit (a raised limit) or at rollover.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::alert::{AlertEvent, AlertHub, AlertLevel, AlertMetric};
use crate::clock::{duration_to_nanos, MonotonicClock, Nanos};
use crate::config::{ThresholdConfig, ThresholdUpdate};
use crate::monitor::activity::{ActivityKind, ActivityUpdate};
use crate::monitor::connection::{ConnectionState, TransitionRecord};

const ACCOUNT_SCOPE: &str = "account";

/// Work item for the threshold worker
#[derive(Debug, Clone)]
pub enum MonitorSignal {
    Activity(ActivityUpdate),
    HeartbeatLapse {
        lapse_secs: u64,
    },
    Connection {
        transition: TransitionRecord,
        disconnect_count: u64,
    },
    /// Counters were reset for a new trading day
    Rollover {
        trading_day: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub metric: AlertMetric,
    pub scope: String,
}

impl AlertKey {
    fn new(metric: AlertMetric, instrument: Option<&str>) -> Self {
        Self {
            metric,
            scope: instrument.unwrap_or(ACCOUNT_SCOPE).to_string(),
        }
    }
}

/// Per-key bookkeeping
#[derive(Debug, Default, Clone, Copy)]
struct KeyState {
    high_water: u64,
    last_emitted: Option<Nanos>,
}

pub struct ThresholdManager {
    config: RwLock<ThresholdConfig>,
    keys: Mutex<HashMap<AlertKey, KeyState>>,
    clock: Arc<dyn MonotonicClock>,
    alerts: Arc<AlertHub>,
}

impl ThresholdManager {
    pub fn new(config: ThresholdConfig, clock: Arc<dyn MonotonicClock>, alerts: Arc<AlertHub>) -> Self {
        Self {
            config: RwLock::new(config),
            keys: Mutex::new(HashMap::new()),
            clock,
            alerts,
        }
    }

    pub fn config(&self) -> ThresholdConfig {
        self.config.read().clone()
    }

    /// Apply a partial update. Takes effect from the next evaluation.
    pub fn update_config(&self, update: &ThresholdUpdate) -> ThresholdConfig {
        let mut config = self.config.write();
        config.apply(update);
        config.clone()
    }

    /// Evaluate one signal, publishing and returning any alerts raised.
    pub fn evaluate(&self, signal: &MonitorSignal) -> Vec<AlertEvent> {
        match signal {
            MonitorSignal::Activity(update) => self.evaluate_activity(update),
            MonitorSignal::HeartbeatLapse { lapse_secs } => {
                let limit = self.config.read().heartbeat_lapse_limit_secs;
                self.check_limit(
                    AlertMetric::HeartbeatLapse,
                    None,
                    *lapse_secs,
                    limit,
                    AlertLevel::Warning,
                    format!("heartbeat lapse {}s (limit {}s)", lapse_secs, limit),
                )
                .into_iter()
                .collect()
            }
            MonitorSignal::Connection {
                transition,
                disconnect_count,
            } => self
                .evaluate_connection(transition, *disconnect_count)
                .into_iter()
                .collect(),
            MonitorSignal::Rollover { trading_day } => {
                let mut keys = self.keys.lock();
                let before = keys.len();
                keys.retain(|key, _| !is_counter_metric(key.metric));
                debug!(
                    trading_day = %trading_day,
                    cleared = before - keys.len(),
                    "activity cooldowns cleared"
                );
                Vec::new()
            }
        }
    }

    fn evaluate_activity(&self, update: &ActivityUpdate) -> Vec<AlertEvent> {
        let config = self.config.read().clone();
        let instrument = Some(update.instrument_id.as_str());

        let (instrument_check, account_check) = match update.kind {
            ActivityKind::Open => (
                (
                    AlertMetric::InstrumentOpens,
                    update.instrument.open_count,
                    config.per_instrument_open_limit,
                    "opens",
                ),
                (
                    AlertMetric::TotalOrders,
                    update.account.total_orders,
                    config.total_order_limit,
                    "orders",
                ),
            ),
            ActivityKind::Close => (
                (
                    AlertMetric::InstrumentCloses,
                    update.instrument.close_count,
                    config.per_instrument_close_limit,
                    "closes",
                ),
                (
                    AlertMetric::TotalOrders,
                    update.account.total_orders,
                    config.total_order_limit,
                    "orders",
                ),
            ),
            ActivityKind::Cancel => (
                (
                    AlertMetric::InstrumentCancels,
                    update.instrument.cancel_count,
                    config.per_instrument_cancel_limit,
                    "cancels",
                ),
                (
                    AlertMetric::TotalCancels,
                    update.account.total_cancels,
                    config.total_cancel_limit,
                    "cancels",
                ),
            ),
        };

        let mut raised = Vec::new();
        let (metric, value, limit, noun) = instrument_check;
        raised.extend(self.check_limit(
            metric,
            instrument,
            value,
            limit,
            AlertLevel::Warning,
            format!(
                "{} {} on {} reached limit {}",
                value, noun, update.instrument_id, limit
            ),
        ));
        let (metric, value, limit, noun) = account_check;
        raised.extend(self.check_limit(
            metric,
            None,
            value,
            limit,
            AlertLevel::Critical,
            format!("account total {} {} reached limit {}", value, noun, limit),
        ));
        raised
    }

    fn evaluate_connection(&self, transition: &TransitionRecord, disconnect_count: u64) -> Option<AlertEvent> {
        let level = match transition.to {
            ConnectionState::Disconnected => AlertLevel::Warning,
            ConnectionState::Error => AlertLevel::Critical,
            ConnectionState::LoggedIn => AlertLevel::Info,
            _ => return None,
        };
        let key = AlertKey {
            metric: AlertMetric::Connection,
            scope: transition.to.to_string(),
        };
        let alert = AlertEvent::new(
            level,
            AlertMetric::Connection,
            None,
            disconnect_count,
            0,
            format!("{} -> {}: {}", transition.from, transition.to, transition.message),
        );
        self.emit_with_cooldown(key, alert)
    }

    fn check_limit(
        &self,
        metric: AlertMetric,
        instrument: Option<&str>,
        value: u64,
        limit: u64,
        level: AlertLevel,
        message: String,
    ) -> Option<AlertEvent> {
        let key = AlertKey::new(metric, instrument);
        let monotonic = is_counter_metric(metric);
        let cooldown = duration_to_nanos(self.config.read().cooldown());
        let now = self.clock.now();

        {
            let mut keys = self.keys.lock();
            let state = keys.entry(key.clone()).or_default();

            if monotonic {
                if value < state.high_water {
                    debug!(
                        metric = %metric,
                        scope = %key.scope,
                        value,
                        high_water = state.high_water,
                        "stale counter update ignored"
                    );
                    return None;
                }
                state.high_water = value;
            }

            if limit == 0 || value < limit {
                if state.last_emitted.take().is_some() {
                    debug!(metric = %metric, scope = %key.scope, "metric back under limit, cooldown reset");
                }
                return None;
            }

            if !cooldown_elapsed(state, now, cooldown) {
                debug!(metric = %metric, scope = %key.scope, value, "alert suppressed by cooldown");
                return None;
            }
            state.last_emitted = Some(now);
        }

        let alert = AlertEvent::new(
            level,
            metric,
            instrument.map(str::to_string),
            value,
            limit,
            message,
        );
        self.alerts.publish(alert.clone());
        Some(alert)
    }

    fn emit_with_cooldown(&self, key: AlertKey, alert: AlertEvent) -> Option<AlertEvent> {
        let cooldown = duration_to_nanos(self.config.read().cooldown());
        let now = self.clock.now();
        {
            let mut keys = self.keys.lock();
            let state = keys.entry(key.clone()).or_default();
            if !cooldown_elapsed(state, now, cooldown) {
                debug!(
                    metric = %key.metric,
                    scope = %key.scope,
                    value = alert.value,
                    "alert suppressed by cooldown"
                );
                return None;
            }
            state.last_emitted = Some(now);
        }

        self.alerts.publish(alert.clone());
        Some(alert)
    }
}

fn cooldown_elapsed(state: &KeyState, now: Nanos, cooldown: Nanos) -> bool {
    state
        .last_emitted
        .map_or(true, |at| now.saturating_sub(at) >= cooldown)
}

fn is_counter_metric(metric: AlertMetric) -> bool {
    matches!(
        metric,
        AlertMetric::InstrumentOpens
            | AlertMetric::InstrumentCloses
            | AlertMetric::InstrumentCancels
            | AlertMetric::TotalOrders
            | AlertMetric::TotalCancels
    )
}

/// Drain signals until every sender is dropped.
pub async fn run_threshold_worker(
    manager: Arc<ThresholdManager>,
    mut rx: mpsc::UnboundedReceiver<MonitorSignal>,
) {
    info!("Starting threshold worker");
    let mut processed: u64 = 0;
    let mut raised: u64 = 0;

    while let Some(signal) = rx.recv().await {
        processed += 1;
        raised += manager.evaluate(&signal).len() as u64;
    }

    info!(processed, raised, "threshold worker stopped");
}
