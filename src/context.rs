//! Monitor context
//!
//! Owns every monitoring component, constructed once at startup and shared
//! by reference. All gateway events enter through [`MonitorContext::ingest`],
//! which only updates lock-protected state and enqueues threshold work; it
//! never blocks the gateway's delivery context. A counter update and its
//! threshold signal are enqueued under one short lock, so the worker sees
//! counter values in the order they were produced.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alert::{AlertHub, BroadcastAlertSink, TracingAlertSink};
use crate::clock::MonotonicClock;
use crate::config::Settings;
use crate::emergency::orders::{OpenOrderBook, OrderReturn};
use crate::emergency::pacer::RequestPacer;
use crate::emergency::EmergencyController;
use crate::gateway::{CancelStatus, Gateway, GatewayEvent};
use crate::models::{AccountSnapshot, OrderRef, OrderRequest, PositionSnapshot};
use crate::monitor::activity::{ActivityKind, OrderActivityRegistry};
use crate::monitor::connection::{ConnectionSnapshot, ConnectionState, ConnectionStateMachine};
use crate::monitor::threshold::{run_threshold_worker, MonitorSignal, ThresholdManager};
use crate::validator::{OrderValidator, ValidationContext, ValidationResult};

/// Last account/position data received from the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerSnapshots {
    pub account: Option<AccountSnapshot>,
    pub positions: Option<Vec<PositionSnapshot>>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Submitted {
        order_ref: OrderRef,
        validation: ValidationResult,
    },
    Rejected {
        validation: ValidationResult,
    },
    GatewayFailed {
        validation: ValidationResult,
        error: String,
    },
}

impl SubmitOutcome {
    pub fn order_ref(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Submitted { order_ref, .. } => Some(order_ref),
            _ => None,
        }
    }

    pub fn validation(&self) -> &ValidationResult {
        match self {
            SubmitOutcome::Submitted { validation, .. }
            | SubmitOutcome::Rejected { validation }
            | SubmitOutcome::GatewayFailed { validation, .. } => validation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub connection: ConnectionSnapshot,
    pub trading_enabled: bool,
    pub trading_day: Option<String>,
    pub total_orders: u64,
    pub total_cancels: u64,
    pub open_orders: usize,
    pub instruments: usize,
    pub alerts: usize,
}

pub struct MonitorContext {
    pub connection: Arc<ConnectionStateMachine>,
    pub activity: Arc<OrderActivityRegistry>,
    pub thresholds: Arc<ThresholdManager>,
    pub validator: Arc<OrderValidator>,
    pub emergency: Arc<EmergencyController>,
    pub alerts: Arc<AlertHub>,
    pub alert_feed: BroadcastAlertSink,
    pub orders: Arc<OpenOrderBook>,
    gateway: Arc<dyn Gateway>,
    query_pacer: RequestPacer,
    snapshots: RwLock<BrokerSnapshots>,
    exchange_offset: FixedOffset,
    signal_tx: RwLock<Option<mpsc::UnboundedSender<MonitorSignal>>>,
    sequencer: Mutex<()>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<MonitorSignal>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorContext {
    pub fn new(settings: &Settings, gateway: Arc<dyn Gateway>, clock: Arc<dyn MonotonicClock>) -> Self {
        let alerts = Arc::new(AlertHub::new(settings.alerts.history_capacity));
        if settings.alerts.log_alerts {
            alerts.add_sink(Arc::new(TracingAlertSink));
        }
        let alert_feed = BroadcastAlertSink::new(settings.alerts.broadcast_capacity);
        alerts.add_sink(Arc::new(alert_feed.clone()));

        let orders = Arc::new(OpenOrderBook::new());
        let emergency = Arc::new(EmergencyController::new(
            settings.emergency.clone(),
            gateway.clone(),
            orders.clone(),
            alerts.clone(),
        ));
        let thresholds = Arc::new(ThresholdManager::new(
            settings.thresholds.clone(),
            clock,
            alerts.clone(),
        ));

        let exchange_offset = FixedOffset::east_opt(settings.validator.exchange_utc_offset_secs)
            .unwrap_or_else(|| {
                warn!(
                    offset = settings.validator.exchange_utc_offset_secs,
                    "invalid exchange UTC offset, using UTC"
                );
                Utc.fix()
            });

        for strategy_id in &settings.emergency.strategies {
            emergency.register_strategy(strategy_id);
        }

        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            connection: Arc::new(ConnectionStateMachine::new(settings.gateway.retry.clone())),
            activity: Arc::new(OrderActivityRegistry::new()),
            thresholds,
            validator: Arc::new(OrderValidator::new(&settings.validator)),
            emergency,
            alerts,
            alert_feed,
            orders,
            gateway,
            query_pacer: RequestPacer::new("query", settings.emergency.query_min_interval()),
            snapshots: RwLock::new(BrokerSnapshots::default()),
            exchange_offset,
            signal_tx: RwLock::new(Some(tx)),
            sequencer: Mutex::new(()),
            signal_rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Spawn the threshold worker. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let Some(rx) = self.signal_rx.lock().take() else {
            warn!("monitor context already started");
            return;
        };
        let handle = tokio::spawn(run_threshold_worker(self.thresholds.clone(), rx));
        *self.worker.lock() = Some(handle);
        info!("monitor context started");
    }

    /// Stop accepting signals, let the worker drain its queue, and wait for it.
    pub async fn shutdown(&self) {
        self.signal_tx.write().take();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "threshold worker ended abnormally");
            }
        }
        info!("monitor context stopped");
    }

    /// Connect, authenticate and log in, then load broker snapshots.
    pub async fn bring_up(&self) -> Result<()> {
        self.gateway.connect().await.context("gateway connect")?;
        self.gateway
            .authenticate()
            .await
            .context("gateway authenticate")?;
        self.gateway.login().await.context("gateway login")?;
        self.refresh_snapshots().await
    }

    // =========================================================================
    // INGESTION
    // =========================================================================

    /// Single entry point for gateway events.
    pub fn ingest(&self, event: GatewayEvent) {
        match &event {
            GatewayEvent::FrontConnected
            | GatewayEvent::FrontDisconnected { .. }
            | GatewayEvent::ReconnectAttempt { .. }
            | GatewayEvent::AuthOk
            | GatewayEvent::AuthFailed { .. }
            | GatewayEvent::LoginFailed { .. }
            | GatewayEvent::LoggedOut => self.apply_connection(&event),
            GatewayEvent::HeartbeatWarning { lapse_secs } => {
                self.connection.apply(&event);
                self.signal(MonitorSignal::HeartbeatLapse {
                    lapse_secs: *lapse_secs,
                });
            }
            GatewayEvent::LoginOk { trading_day } => {
                self.apply_connection(&event);
                self.rollover(trading_day);
            }
            GatewayEvent::TradingDayChanged { trading_day } => {
                self.connection.apply(&event);
                self.rollover(trading_day);
            }
            GatewayEvent::OrderAck {
                order_ref,
                instrument_id,
                direction,
                offset,
                volume,
                status,
                order_sys_id,
            } => {
                let first = self.orders.apply_order_return(&OrderReturn {
                    order_ref,
                    instrument_id,
                    direction: *direction,
                    offset: *offset,
                    volume: *volume,
                    status: *status,
                    order_sys_id: order_sys_id.as_deref(),
                });
                if first {
                    let _seq = self.sequencer.lock();
                    let update = self
                        .activity
                        .record(instrument_id, ActivityKind::for_offset(*offset));
                    self.signal(MonitorSignal::Activity(update));
                }
            }
            GatewayEvent::Trade {
                order_ref, volume, ..
            } => {
                self.orders.apply_trade(order_ref, *volume);
                self.activity.record_trade(*volume);
            }
            GatewayEvent::CancelAck {
                order_ref,
                instrument_id,
                status,
            } => {
                if *status == CancelStatus::Rejected {
                    debug!(order_ref = %order_ref, "cancel rejected by broker");
                }
                let _seq = self.sequencer.lock();
                let update = self.activity.record(instrument_id, ActivityKind::Cancel);
                self.signal(MonitorSignal::Activity(update));
            }
            GatewayEvent::Error { code, message } => {
                warn!(code, message = %message, "gateway error");
            }
        }
    }

    fn apply_connection(&self, event: &GatewayEvent) {
        if let Some(transition) = self.connection.apply(event) {
            let disconnect_count = self.connection.snapshot().disconnect_count;
            self.signal(MonitorSignal::Connection {
                transition,
                disconnect_count,
            });
        }
    }

    fn rollover(&self, trading_day: &str) {
        let _seq = self.sequencer.lock();
        if self.activity.rollover(trading_day) {
            let pruned = self.orders.prune_terminal();
            self.emergency.reset_settlement();
            debug!(trading_day, pruned, "trading day rollover applied");
            self.signal(MonitorSignal::Rollover {
                trading_day: trading_day.to_string(),
            });
        }
    }

    fn signal(&self, signal: MonitorSignal) {
        match self.signal_tx.read().as_ref() {
            Some(tx) => {
                if tx.send(signal).is_err() {
                    warn!("threshold worker gone, signal dropped");
                }
            }
            None => debug!("monitor shutting down, signal dropped"),
        }
    }

    // =========================================================================
    // SNAPSHOTS
    // =========================================================================

    /// Re-query account, positions and instruments through the query pacer.
    /// On failure the previous snapshots stay in place.
    pub async fn refresh_snapshots(&self) -> Result<()> {
        self.query_pacer.acquire().await;
        let account = self
            .gateway
            .query_account()
            .await
            .context("query account")?;

        self.query_pacer.acquire().await;
        let positions = self
            .gateway
            .query_position(None)
            .await
            .context("query positions")?;

        self.query_pacer.acquire().await;
        let instruments = self
            .gateway
            .query_instruments()
            .await
            .context("query instruments")?;
        if !instruments.is_empty() {
            self.validator.replace_instruments(instruments);
        }
        debug!(
            instruments = self.validator.instrument_count(),
            "broker snapshots refreshed"
        );

        let mut snapshots = self.snapshots.write();
        snapshots.account = Some(account);
        snapshots.positions = Some(positions);
        snapshots.refreshed_at = Some(Utc::now());
        Ok(())
    }

    pub fn broker_snapshots(&self) -> BrokerSnapshots {
        self.snapshots.read().clone()
    }

    pub fn health(&self) -> HealthReport {
        let connection = self.connection.snapshot();
        let activity = self.activity.snapshot();
        let trading_enabled = self.emergency.is_trading_enabled();
        HealthReport {
            healthy: connection.state == ConnectionState::LoggedIn && trading_enabled,
            trading_day: activity.trading_day.clone(),
            total_orders: activity.account.total_orders,
            total_cancels: activity.account.total_cancels,
            open_orders: self.orders.open_orders(None).len(),
            instruments: self.validator.instrument_count(),
            alerts: self.alerts.len(),
            trading_enabled,
            connection,
        }
    }

    // =========================================================================
    // VALIDATION & SUBMISSION
    // =========================================================================

    /// Current exchange local time.
    pub fn exchange_now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.exchange_offset).naive_local()
    }

    /// Validate against cached snapshots at an explicit exchange time.
    pub fn validate_at(&self, request: &OrderRequest, now: NaiveDateTime) -> ValidationResult {
        let snapshots = self.snapshots.read();
        let emergency = self.emergency.state();
        let ctx = ValidationContext {
            account: snapshots.account.as_ref(),
            positions: snapshots.positions.as_deref(),
            now,
            emergency: &emergency,
        };
        self.validator.validate(request, &ctx)
    }

    /// Dry run: what would happen to this order right now.
    pub fn validate_dry_run(&self, request: &OrderRequest) -> ValidationResult {
        self.validate_at(request, self.exchange_now())
    }

    /// Validate, then hand the order to the gateway only if it passes.
    ///
    /// Holds a submission permit until the order is in the open-order book,
    /// so an emergency stop either cancels it or rejects it.
    pub async fn submit_order(&self, request: OrderRequest) -> SubmitOutcome {
        let _permit = self.emergency.submission_permit().await;
        let validation = self.validate_dry_run(&request);
        if !validation.valid {
            info!(
                instrument = %request.instrument_id,
                violations = ?validation.codes(),
                "order rejected before submission"
            );
            return SubmitOutcome::Rejected { validation };
        }

        match self.gateway.submit_order(&request).await {
            Ok(order_ref) => {
                self.orders.register_submitted(&order_ref, &request);
                debug!(order_ref = %order_ref, instrument = %request.instrument_id, "order submitted");
                SubmitOutcome::Submitted {
                    order_ref,
                    validation,
                }
            }
            Err(e) => {
                warn!(instrument = %request.instrument_id, error = %e, "order submission failed");
                SubmitOutcome::GatewayFailed {
                    validation,
                    error: e.to_string(),
                }
            }
        }
    }
}
