//! Alert delivery
//!
//! Alerts are immutable once raised. The [`AlertHub`] keeps a bounded
//! history for read-side snapshots and fans every alert out to the
//! registered [`AlertSink`]s.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// What an alert measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertMetric {
    InstrumentOpens,
    InstrumentCloses,
    InstrumentCancels,
    TotalOrders,
    TotalCancels,
    HeartbeatLapse,
    Connection,
    Emergency,
}

impl AlertMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstrumentOpens => "INSTRUMENT_OPENS",
            Self::InstrumentCloses => "INSTRUMENT_CLOSES",
            Self::InstrumentCancels => "INSTRUMENT_CANCELS",
            Self::TotalOrders => "TOTAL_ORDERS",
            Self::TotalCancels => "TOTAL_CANCELS",
            Self::HeartbeatLapse => "HEARTBEAT_LAPSE",
            Self::Connection => "CONNECTION",
            Self::Emergency => "EMERGENCY",
        }
    }
}

impl std::fmt::Display for AlertMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub level: AlertLevel,
    pub metric: AlertMetric,
    /// None for account-wide metrics
    pub instrument: Option<String>,
    pub value: u64,
    pub limit: u64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(
        level: AlertLevel,
        metric: AlertMetric,
        instrument: Option<String>,
        value: u64,
        limit: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            level,
            metric,
            instrument,
            value,
            limit,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Delivery target for alerts (log, UI push, mail relay, ...).
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    fn push_alert(&self, alert: &AlertEvent);
}

/// Writes alerts to the tracing log at a level matching severity.
#[derive(Debug, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn push_alert(&self, alert: &AlertEvent) {
        let instrument = alert.instrument.as_deref().unwrap_or("account");
        match alert.level {
            AlertLevel::Critical => error!(
                metric = %alert.metric,
                instrument,
                value = alert.value,
                limit = alert.limit,
                "ALERT: {}",
                alert.message
            ),
            AlertLevel::Warning => warn!(
                metric = %alert.metric,
                instrument,
                value = alert.value,
                limit = alert.limit,
                "ALERT: {}",
                alert.message
            ),
            AlertLevel::Info => info!(
                metric = %alert.metric,
                instrument,
                value = alert.value,
                limit = alert.limit,
                "ALERT: {}",
                alert.message
            ),
        }
    }
}

/// Republishes alerts to live subscribers (UI sockets, test probes).
#[derive(Debug, Clone)]
pub struct BroadcastAlertSink {
    tx: broadcast::Sender<AlertEvent>,
}

impl BroadcastAlertSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.tx.subscribe()
    }
}

impl AlertSink for BroadcastAlertSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn push_alert(&self, alert: &AlertEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(alert.clone());
    }
}

pub struct AlertHub {
    sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
    history: Mutex<VecDeque<AlertEvent>>,
    capacity: usize,
}

impl AlertHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn AlertSink>) {
        info!(sink = sink.name(), "alert sink registered");
        self.sinks.write().push(sink);
    }

    /// Record and deliver one alert.
    pub fn publish(&self, alert: AlertEvent) {
        {
            let mut history = self.history.lock();
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(alert.clone());
        }

        let sinks = self.sinks.read().clone();
        for sink in sinks {
            sink.push_alert(&alert);
        }
    }

    /// Most recent alerts, oldest first, at most `limit`.
    pub fn history(&self, limit: usize) -> Vec<AlertEvent> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for AlertHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertHub")
            .field("sinks", &self.sinks.read().len())
            .field("history", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CollectingSink {
        seen: Mutex<Vec<AlertEvent>>,
    }

    impl AlertSink for CollectingSink {
        fn name(&self) -> &str {
            "collect"
        }
        fn push_alert(&self, alert: &AlertEvent) {
            self.seen.lock().push(alert.clone());
        }
    }

    fn alert(value: u64) -> AlertEvent {
        AlertEvent::new(
            AlertLevel::Warning,
            AlertMetric::InstrumentOpens,
            Some("rb2410".into()),
            value,
            10,
            "opens over limit",
        )
    }

    #[test]
    fn test_history_evicts_oldest() {
        let hub = AlertHub::new(3);
        for v in 1..=5 {
            hub.publish(alert(v));
        }
        let values: Vec<u64> = hub.history(10).iter().map(|a| a.value).collect();
        assert_eq!(values, vec![3, 4, 5]);
        assert_eq!(hub.history(2).len(), 2);
        assert_eq!(hub.history(2)[1].value, 5);
    }

    #[test]
    fn test_fan_out_to_all_sinks() {
        let hub = AlertHub::new(10);
        let a = Arc::new(CollectingSink::default());
        let b = Arc::new(CollectingSink::default());
        hub.add_sink(a.clone());
        hub.add_sink(b.clone());
        hub.add_sink(Arc::new(TracingAlertSink));

        hub.publish(alert(11));

        assert_eq!(a.seen.lock().len(), 1);
        assert_eq!(b.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers() {
        let sink = BroadcastAlertSink::new(8);
        let mut rx = sink.subscribe();
        sink.push_alert(&alert(12));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.value, 12);
    }

    #[test]
    fn test_level_serializes_screaming() {
        let json = serde_json::to_string(&AlertLevel::Critical).unwrap();
        assert_eq!(json, "\"CRITICAL\"");
    }
}
