//! Emergency Controller
//!
//! Operator kill switch: pause/resume new submissions, stop strategies,
//! mass-cancel working orders and force the session to log out.
//!
//! Bulk cancels are paced through a [`RequestPacer`] and never race an
//! order's insert acknowledgment. Orders already acknowledged go first;
//! orders still pending insert are waited on (bounded) and cancelled
//! afterwards. Each order gets its own outcome; a failure never stops the
//! batch and is never retried here.
//!
//! Submissions hold a read permit on the submission gate from validation
//! until the order is registered in the book. Emergency stop and forced
//! logout take the write side, so an order in flight when they start is
//! either visible to their cancel sweep or validated after the pause.

pub mod orders;
pub mod pacer;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock as GateLock, RwLockReadGuard};
use tracing::{error, info, warn};

use crate::alert::{AlertEvent, AlertHub, AlertLevel, AlertMetric};
use crate::config::EmergencyConfig;
use crate::gateway::{CancelTarget, Gateway};
use crate::models::{OrderRef, OrderStatus};
use orders::{OpenOrderBook, TrackedOrder};
use pacer::RequestPacer;

/// What an unconfirmed settlement statement blocks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementPolicy {
    #[default]
    Disabled,
    /// Opening orders are blocked, closes still allowed
    BlockNewOrders,
    /// Every submission is blocked; cancels still go through
    BlockSession,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyState {
    pub trading_enabled: bool,
    pub paused_reason: Option<String>,
    pub paused_at: Option<DateTime<Utc>>,
    pub settlement_policy: SettlementPolicy,
    pub settlement_confirmed: bool,
    /// Every strategy stopped, registered or not
    pub strategies_halted: bool,
    /// Registered strategies and whether each may send orders
    pub strategies: BTreeMap<String, bool>,
}

impl Default for EmergencyState {
    fn default() -> Self {
        Self {
            trading_enabled: true,
            paused_reason: None,
            paused_at: None,
            settlement_policy: SettlementPolicy::Disabled,
            settlement_confirmed: false,
            strategies_halted: false,
            strategies: BTreeMap::new(),
        }
    }
}

impl EmergencyState {
    /// Unregistered strategies run unless every strategy is halted.
    pub fn strategy_running(&self, strategy_id: &str) -> bool {
        !self.strategies_halted && self.strategies.get(strategy_id).copied().unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyAction {
    PauseTrading,
    ResumeTrading,
    CancelByInstrument,
    CancelAll,
    EmergencyStop,
    ConfirmSettlement,
    SetSettlementPolicy,
    StopStrategy,
    ResumeStrategy,
    ForceLogout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CancelResult {
    Cancelled,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub order_ref: OrderRef,
    pub instrument_id: String,
    pub result: CancelResult,
}

impl CancelOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.result, CancelResult::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReport {
    /// None for cancel-all
    pub instrument_id: Option<String>,
    pub outcomes: Vec<CancelOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CancelReport {
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn cancelled(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_cancelled()).count()
    }

    pub fn failed(&self) -> usize {
        self.attempted() - self.cancelled()
    }

    pub fn summary(&self) -> CancelSummary {
        CancelSummary {
            attempted: self.attempted(),
            cancelled: self.cancelled(),
            failed: self.failed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSummary {
    pub attempted: usize,
    pub cancelled: usize,
    pub failed: usize,
}

/// One operator action, as kept in the event history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyEvent {
    pub action: EmergencyAction,
    /// Instrument or strategy the action was scoped to
    #[serde(default)]
    pub target: Option<String>,
    pub reason: Option<String>,
    pub trading_enabled_after: bool,
    pub cancel: Option<CancelSummary>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyStopReport {
    pub state: EmergencyState,
    pub cancel: CancelReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceLogoutReport {
    pub cancel: CancelReport,
    pub logged_out: bool,
    pub error: Option<String>,
}

pub struct EmergencyController {
    state: RwLock<EmergencyState>,
    gateway: Arc<dyn Gateway>,
    orders: Arc<OpenOrderBook>,
    pacer: RequestPacer,
    alerts: Arc<AlertHub>,
    events: Mutex<VecDeque<EmergencyEvent>>,
    submission_gate: GateLock<()>,
    config: EmergencyConfig,
}

impl EmergencyController {
    pub fn new(
        config: EmergencyConfig,
        gateway: Arc<dyn Gateway>,
        orders: Arc<OpenOrderBook>,
        alerts: Arc<AlertHub>,
    ) -> Self {
        let state = EmergencyState {
            settlement_policy: config.settlement_policy,
            ..Default::default()
        };
        Self {
            state: RwLock::new(state),
            gateway,
            orders,
            pacer: RequestPacer::new("cancel", config.cancel_min_interval()),
            alerts,
            events: Mutex::new(VecDeque::new()),
            submission_gate: GateLock::new(()),
            config,
        }
    }

    pub fn state(&self) -> EmergencyState {
        self.state.read().clone()
    }

    pub fn is_trading_enabled(&self) -> bool {
        self.state.read().trading_enabled
    }

    /// Held by a submission from validation until the order is registered.
    pub async fn submission_permit(&self) -> RwLockReadGuard<'_, ()> {
        self.submission_gate.read().await
    }

    /// Recent operator actions, oldest first.
    pub fn events(&self, limit: usize) -> Vec<EmergencyEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    // =========================================================================
    // PAUSE / RESUME
    // =========================================================================

    pub fn pause_trading(&self, reason: &str) -> EmergencyState {
        let state = self.apply_pause(reason);
        self.record(EmergencyAction::PauseTrading, None, Some(reason), &state, None);
        self.alerts.publish(AlertEvent::new(
            AlertLevel::Warning,
            AlertMetric::Emergency,
            None,
            0,
            0,
            format!("trading paused: {}", reason),
        ));
        state
    }

    pub fn resume_trading(&self, reason: &str) -> EmergencyState {
        let state = {
            let mut state = self.state.write();
            if state.trading_enabled {
                info!(reason, "resume requested while trading already enabled");
            }
            state.trading_enabled = true;
            state.paused_reason = None;
            state.paused_at = None;
            state.clone()
        };
        info!(reason, "trading resumed");
        self.record(EmergencyAction::ResumeTrading, None, Some(reason), &state, None);
        self.alerts.publish(AlertEvent::new(
            AlertLevel::Info,
            AlertMetric::Emergency,
            None,
            0,
            0,
            format!("trading resumed: {}", reason),
        ));
        state
    }

    fn apply_pause(&self, reason: &str) -> EmergencyState {
        let mut state = self.state.write();
        if state.trading_enabled {
            state.trading_enabled = false;
            state.paused_at = Some(Utc::now());
            warn!(reason, "trading paused");
        } else {
            info!(
                previous = state.paused_reason.as_deref().unwrap_or("-"),
                reason, "trading already paused, reason updated"
            );
        }
        state.paused_reason = Some(reason.to_string());
        state.clone()
    }

    // =========================================================================
    // SETTLEMENT
    // =========================================================================

    pub fn confirm_settlement(&self) -> EmergencyState {
        let state = {
            let mut state = self.state.write();
            state.settlement_confirmed = true;
            state.clone()
        };
        info!("settlement confirmed");
        self.record(EmergencyAction::ConfirmSettlement, None, None, &state, None);
        state
    }

    pub fn set_settlement_policy(&self, policy: SettlementPolicy) -> EmergencyState {
        let state = {
            let mut state = self.state.write();
            state.settlement_policy = policy;
            state.clone()
        };
        info!(?policy, "settlement policy changed");
        self.record(EmergencyAction::SetSettlementPolicy, None, None, &state, None);
        state
    }

    /// A new trading day needs a fresh settlement confirmation.
    pub fn reset_settlement(&self) {
        self.state.write().settlement_confirmed = false;
    }

    // =========================================================================
    // STRATEGIES
    // =========================================================================

    pub fn register_strategy(&self, strategy_id: &str) {
        self.state
            .write()
            .strategies
            .insert(strategy_id.to_string(), true);
        info!(strategy = strategy_id, "strategy registered");
    }

    pub fn unregister_strategy(&self, strategy_id: &str) {
        self.state.write().strategies.remove(strategy_id);
        info!(strategy = strategy_id, "strategy unregistered");
    }

    pub fn is_strategy_running(&self, strategy_id: &str) -> bool {
        self.state.read().strategy_running(strategy_id)
    }

    /// Stop one registered strategy, or every strategy when `strategy_id` is None.
    pub fn stop_strategy(&self, strategy_id: Option<&str>, reason: &str) -> EmergencyState {
        let state = self.apply_strategy_stop(strategy_id, true);
        let scope = strategy_id.unwrap_or("all");
        warn!(strategy = scope, reason, "strategy stopped");
        self.record(EmergencyAction::StopStrategy, Some(scope), Some(reason), &state, None);
        self.alerts.publish(AlertEvent::new(
            AlertLevel::Warning,
            AlertMetric::Emergency,
            None,
            0,
            0,
            format!("strategy {} stopped: {}", scope, reason),
        ));
        state
    }

    pub fn resume_strategy(&self, strategy_id: Option<&str>, reason: &str) -> EmergencyState {
        let state = self.apply_strategy_stop(strategy_id, false);
        let scope = strategy_id.unwrap_or("all");
        info!(strategy = scope, reason, "strategy resumed");
        self.record(EmergencyAction::ResumeStrategy, Some(scope), Some(reason), &state, None);
        self.alerts.publish(AlertEvent::new(
            AlertLevel::Info,
            AlertMetric::Emergency,
            None,
            0,
            0,
            format!("strategy {} resumed: {}", scope, reason),
        ));
        state
    }

    fn apply_strategy_stop(&self, strategy_id: Option<&str>, stopped: bool) -> EmergencyState {
        let mut state = self.state.write();
        match strategy_id {
            Some(id) => match state.strategies.get_mut(id) {
                Some(running) => *running = !stopped,
                None => warn!(strategy = id, "unknown strategy, nothing changed"),
            },
            None => {
                state.strategies_halted = stopped;
                for running in state.strategies.values_mut() {
                    *running = !stopped;
                }
            }
        }
        state.clone()
    }

    // =========================================================================
    // FORCED LOGOUT
    // =========================================================================

    /// Cancel everything, then close the gateway session. New submissions
    /// wait until both steps are done.
    pub async fn force_logout(&self, reason: &str) -> ForceLogoutReport {
        error!(reason, "forcing logout");
        let _gate = self.submission_gate.write().await;

        let targets = self.orders.open_orders(None);
        let cancel = self.cancel_orders(None, targets).await;

        let error = match tokio::time::timeout(self.config.cancel_timeout(), self.gateway.logout()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("logout timed out after {}ms", self.config.cancel_timeout_ms)),
        };
        if let Some(e) = &error {
            warn!(error = %e, "logout failed");
        }

        let summary = cancel.summary();
        let state = self.state();
        self.record(EmergencyAction::ForceLogout, None, Some(reason), &state, Some(summary));
        self.alerts.publish(AlertEvent::new(
            AlertLevel::Critical,
            AlertMetric::Emergency,
            None,
            summary.failed as u64,
            0,
            format!(
                "forced logout: {} ({} of {} orders cancelled{})",
                reason,
                summary.cancelled,
                summary.attempted,
                if error.is_some() { ", logout failed" } else { "" }
            ),
        ));

        ForceLogoutReport {
            cancel,
            logged_out: error.is_none(),
            error,
        }
    }

    // =========================================================================
    // BULK CANCEL
    // =========================================================================

    pub async fn cancel_by_instrument(&self, instrument_id: &str) -> CancelReport {
        let targets = self.orders.open_orders(Some(instrument_id));
        let report = self.cancel_orders(Some(instrument_id), targets).await;
        let state = self.state();
        self.record(
            EmergencyAction::CancelByInstrument,
            Some(instrument_id),
            None,
            &state,
            Some(report.summary()),
        );
        report
    }

    pub async fn cancel_all(&self) -> CancelReport {
        let targets = self.orders.open_orders(None);
        let report = self.cancel_orders(None, targets).await;
        let state = self.state();
        self.record(EmergencyAction::CancelAll, None, None, &state, Some(report.summary()));
        report
    }

    /// Pause, stop every strategy, then cancel everything, recorded as one
    /// event.
    pub async fn emergency_stop(&self, reason: &str) -> EmergencyStopReport {
        error!(reason, "EMERGENCY STOP");
        let state = {
            let _gate = self.submission_gate.write().await;
            self.apply_pause(reason);
            self.apply_strategy_stop(None, true)
        };
        let targets = self.orders.open_orders(None);
        let cancel = self.cancel_orders(None, targets).await;

        let summary = cancel.summary();
        self.record(EmergencyAction::EmergencyStop, None, Some(reason), &state, Some(summary));
        self.alerts.publish(AlertEvent::new(
            AlertLevel::Critical,
            AlertMetric::Emergency,
            None,
            summary.failed as u64,
            0,
            format!(
                "emergency stop: {} ({} of {} orders cancelled)",
                reason, summary.cancelled, summary.attempted
            ),
        ));

        EmergencyStopReport { state, cancel }
    }

    async fn cancel_orders(&self, instrument_id: Option<&str>, targets: Vec<TrackedOrder>) -> CancelReport {
        let started_at = Utc::now();
        let (pending, ready): (Vec<_>, Vec<_>) = targets
            .into_iter()
            .partition(|o| o.status == OrderStatus::PendingInsert);

        info!(
            scope = instrument_id.unwrap_or("all"),
            ready = ready.len(),
            pending_insert = pending.len(),
            "bulk cancel started"
        );

        let mut outcomes = Vec::with_capacity(ready.len() + pending.len());
        for order in ready {
            outcomes.push(self.cancel_one(order).await);
        }
        // One ack deadline for the whole batch
        let ack_deadline = tokio::time::Instant::now() + self.config.insert_ack_timeout();
        for order in pending {
            let remaining = ack_deadline.saturating_duration_since(tokio::time::Instant::now());
            let acked = self.orders.wait_for_ack(&order.order_ref, remaining).await;
            match acked {
                Some(o) if o.status == OrderStatus::PendingInsert => {
                    outcomes.push(failed(
                        &order,
                        format!(
                            "insert not acknowledged within {}ms",
                            self.config.insert_ack_timeout_ms
                        ),
                    ));
                }
                Some(o) => outcomes.push(self.cancel_one(o).await),
                None => outcomes.push(failed(&order, "order no longer tracked".to_string())),
            }
        }

        let report = CancelReport {
            instrument_id: instrument_id.map(str::to_string),
            outcomes,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            scope = instrument_id.unwrap_or("all"),
            attempted = report.attempted(),
            cancelled = report.cancelled(),
            failed = report.failed(),
            "bulk cancel finished"
        );
        report
    }

    async fn cancel_one(&self, order: TrackedOrder) -> CancelOutcome {
        // Re-read: it may have filled or been cancelled while queued behind the pacer
        let current = self.orders.get(&order.order_ref).unwrap_or(order);
        if !current.status.is_open() {
            return failed(&current, format!("order already {}", current.status));
        }

        self.pacer.acquire().await;
        let target = CancelTarget {
            order_ref: current.order_ref.clone(),
            instrument_id: current.instrument_id.clone(),
            order_sys_id: current.order_sys_id.clone(),
        };

        match tokio::time::timeout(self.config.cancel_timeout(), self.gateway.cancel_order(&target)).await {
            Ok(Ok(())) => CancelOutcome {
                order_ref: current.order_ref,
                instrument_id: current.instrument_id,
                result: CancelResult::Cancelled,
            },
            Ok(Err(e)) => {
                warn!(order_ref = %current.order_ref, error = %e, "cancel failed");
                failed(&current, e.to_string())
            }
            Err(_) => {
                warn!(order_ref = %current.order_ref, "cancel timed out");
                failed(
                    &current,
                    format!("cancel timed out after {}ms", self.config.cancel_timeout_ms),
                )
            }
        }
    }

    fn record(
        &self,
        action: EmergencyAction,
        target: Option<&str>,
        reason: Option<&str>,
        state: &EmergencyState,
        cancel: Option<CancelSummary>,
    ) {
        let mut events = self.events.lock();
        if events.len() >= self.config.event_history_capacity.max(1) {
            events.pop_front();
        }
        events.push_back(EmergencyEvent {
            action,
            target: target.map(str::to_string),
            reason: reason.map(str::to_string),
            trading_enabled_after: state.trading_enabled,
            cancel,
            at: Utc::now(),
        });
    }
}

fn failed(order: &TrackedOrder, reason: String) -> CancelOutcome {
    CancelOutcome {
        order_ref: order.order_ref.clone(),
        instrument_id: order.instrument_id.clone(),
        result: CancelResult::Failed { reason },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::paper::{PaperConfig, PaperGateway};
    use crate::models::{Direction, Offset, OrderRequest};
    use orders::OrderReturn;
    use std::time::Duration;

    struct Harness {
        controller: EmergencyController,
        gateway: Arc<PaperGateway>,
        book: Arc<OpenOrderBook>,
        alerts: Arc<AlertHub>,
    }

    async fn harness(paper: PaperConfig) -> Harness {
        let (gw, _rx) = PaperGateway::new(paper);
        gw.connect().await.unwrap();
        gw.login().await.unwrap();
        let gateway = Arc::new(gw);
        let book = Arc::new(OpenOrderBook::new());
        let alerts = Arc::new(AlertHub::new(50));
        let config = EmergencyConfig {
            cancel_min_interval_ms: 20,
            insert_ack_timeout_ms: 200,
            ..Default::default()
        };
        let controller = EmergencyController::new(config, gateway.clone(), book.clone(), alerts.clone());
        Harness {
            controller,
            gateway,
            book,
            alerts,
        }
    }

    /// Submit through the paper gateway and mirror the ack into the book.
    async fn working_order(h: &Harness, instrument: &str) -> OrderRef {
        let req = OrderRequest::new(instrument, Direction::Buy, Offset::Open, 3500.0, 1);
        let order_ref = h.gateway.submit_order(&req).await.unwrap();
        h.book.register_submitted(&order_ref, &req);
        h.book.apply_order_return(&OrderReturn {
            order_ref: &order_ref,
            instrument_id: instrument,
            direction: Direction::Buy,
            offset: Offset::Open,
            volume: 1,
            status: OrderStatus::Queued,
            order_sys_id: None,
        });
        order_ref
    }

    #[tokio::test]
    async fn test_pause_resume_idempotent() {
        let h = harness(PaperConfig::default()).await;

        let s = h.controller.pause_trading("risk review");
        assert!(!s.trading_enabled);
        let paused_at = s.paused_at;

        let s = h.controller.pause_trading("still reviewing");
        assert!(!s.trading_enabled);
        assert_eq!(s.paused_reason.as_deref(), Some("still reviewing"));
        assert_eq!(s.paused_at, paused_at);

        assert!(h.controller.resume_trading("clear").trading_enabled);
        assert!(h.controller.resume_trading("clear again").trading_enabled);
        assert!(h.controller.state().paused_reason.is_none());

        assert_eq!(h.controller.events(10).len(), 4);
        assert_eq!(h.alerts.len(), 4);
    }

    #[tokio::test]
    async fn test_cancel_all_reports_mixed_outcomes() {
        let h = harness(PaperConfig::default()).await;
        let mut refs = Vec::new();
        for inst in ["rb2410", "rb2410", "ag2412", "au2412", "rb2410"] {
            refs.push(working_order(&h, inst).await);
        }
        h.gateway.reject_cancels_for(&refs[1]);
        h.gateway.reject_cancels_for(&refs[3]);

        let report = h.controller.cancel_all().await;
        assert_eq!(report.attempted(), 5);
        assert_eq!(report.failed(), 2);
        assert_eq!(report.cancelled(), 3);
        assert_eq!(h.gateway.cancel_log().len(), 5);

        let failed: Vec<_> = report
            .outcomes
            .iter()
            .filter(|o| !o.is_cancelled())
            .map(|o| o.order_ref.clone())
            .collect();
        assert!(failed.contains(&refs[1]));
        assert!(failed.contains(&refs[3]));
    }

    #[tokio::test]
    async fn test_cancels_are_paced() {
        let h = harness(PaperConfig::default()).await;
        for _ in 0..4 {
            working_order(&h, "rb2410").await;
        }
        h.controller.cancel_all().await;

        let log = h.gateway.cancel_log();
        assert_eq!(log.len(), 4);
        for pair in log.windows(2) {
            assert!(pair[1].1.duration_since(pair[0].1) >= Duration::from_millis(15));
        }
    }

    #[tokio::test]
    async fn test_cancel_by_instrument_scope() {
        let h = harness(PaperConfig::default()).await;
        working_order(&h, "rb2410").await;
        working_order(&h, "ag2412").await;

        let report = h.controller.cancel_by_instrument("ag2412").await;
        assert_eq!(report.attempted(), 1);
        assert_eq!(report.outcomes[0].instrument_id, "ag2412");
        assert_eq!(report.instrument_id.as_deref(), Some("ag2412"));
    }

    #[tokio::test]
    async fn test_pending_insert_waits_for_ack() {
        let h = harness(PaperConfig {
            hold_acks: true,
            ..Default::default()
        })
        .await;
        let req = OrderRequest::new("rb2410", Direction::Buy, Offset::Open, 3500.0, 1);
        let order_ref = h.gateway.submit_order(&req).await.unwrap();
        h.book.register_submitted(&order_ref, &req);

        // Ack arrives while the cancel is waiting
        let gateway = h.gateway.clone();
        let book = h.book.clone();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            gateway.release_held_acks();
            book.apply_order_return(&OrderReturn {
                order_ref: "000000000001",
                instrument_id: "rb2410",
                direction: Direction::Buy,
                offset: Offset::Open,
                volume: 1,
                status: OrderStatus::Queued,
                order_sys_id: None,
            });
        });

        let report = h.controller.cancel_all().await;
        releaser.await.unwrap();
        assert_eq!(order_ref, "000000000001");
        assert_eq!(report.cancelled(), 1);
        // Exactly one cancel reached the gateway, after the ack
        assert_eq!(h.gateway.cancel_log().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_insert_timeout_is_failure() {
        let h = harness(PaperConfig {
            hold_acks: true,
            ..Default::default()
        })
        .await;
        let req = OrderRequest::new("rb2410", Direction::Buy, Offset::Open, 3500.0, 1);
        let order_ref = h.gateway.submit_order(&req).await.unwrap();
        h.book.register_submitted(&order_ref, &req);

        let report = h.controller.cancel_all().await;
        assert_eq!(report.failed(), 1);
        assert!(h.gateway.cancel_log().is_empty());
    }

    #[tokio::test]
    async fn test_emergency_stop_single_composite_event() {
        let h = harness(PaperConfig::default()).await;
        working_order(&h, "rb2410").await;
        working_order(&h, "ag2412").await;

        let report = h.controller.emergency_stop("limit breach").await;
        assert!(!report.state.trading_enabled);
        assert_eq!(report.cancel.cancelled(), 2);

        let events = h.controller.events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, EmergencyAction::EmergencyStop);
        assert_eq!(events[0].cancel.unwrap().cancelled, 2);
        assert!(!events[0].trading_enabled_after);

        let alert = h.alerts.history(1).pop().unwrap();
        assert_eq!(alert.level, AlertLevel::Critical);
    }

    #[tokio::test]
    async fn test_pending_inserts_share_one_deadline() {
        let h = harness(PaperConfig {
            hold_acks: true,
            ..Default::default()
        })
        .await;
        for _ in 0..3 {
            let req = OrderRequest::new("rb2410", Direction::Buy, Offset::Open, 3500.0, 1);
            let order_ref = h.gateway.submit_order(&req).await.unwrap();
            h.book.register_submitted(&order_ref, &req);
        }

        let start = tokio::time::Instant::now();
        let report = h.controller.cancel_all().await;
        assert_eq!(report.failed(), 3);
        // 200ms ack timeout for the batch, not per order
        assert!(start.elapsed() < Duration::from_millis(450));
    }

    #[tokio::test]
    async fn test_stop_waits_for_submission_in_flight() {
        let h = Arc::new(harness(PaperConfig::default()).await);
        let permit = h.controller.submission_permit().await;

        let stopper = {
            let h = h.clone();
            tokio::spawn(async move { h.controller.emergency_stop("drill").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(h.controller.is_trading_enabled());

        // The in-flight order lands in the book before the gate opens
        working_order(&h, "rb2410").await;
        drop(permit);

        let report = stopper.await.unwrap();
        assert_eq!(report.cancel.cancelled(), 1);
        assert!(!h.controller.is_trading_enabled());
    }

    #[tokio::test]
    async fn test_strategy_stop_and_resume() {
        let h = harness(PaperConfig::default()).await;
        h.controller.register_strategy("alpha");
        h.controller.register_strategy("beta");

        let s = h.controller.stop_strategy(Some("alpha"), "misbehaving");
        assert_eq!(s.strategies.get("alpha"), Some(&false));
        assert!(!h.controller.is_strategy_running("alpha"));
        assert!(h.controller.is_strategy_running("beta"));
        assert!(h.controller.is_strategy_running("manual"));

        h.controller.stop_strategy(None, "all hands");
        assert!(!h.controller.is_strategy_running("beta"));
        assert!(!h.controller.is_strategy_running("manual"));

        h.controller.resume_strategy(None, "cleared");
        assert!(h.controller.is_strategy_running("alpha"));
        assert!(h.controller.is_strategy_running("manual"));

        let events = h.controller.events(10);
        assert_eq!(events[0].action, EmergencyAction::StopStrategy);
        assert_eq!(events[0].target.as_deref(), Some("alpha"));
        assert_eq!(events[1].target.as_deref(), Some("all"));
        assert_eq!(events[2].action, EmergencyAction::ResumeStrategy);
    }

    #[tokio::test]
    async fn test_emergency_stop_halts_strategies() {
        let h = harness(PaperConfig::default()).await;
        h.controller.register_strategy("alpha");
        let report = h.controller.emergency_stop("limit breach").await;
        assert!(report.state.strategies_halted);
        assert_eq!(report.state.strategies.get("alpha"), Some(&false));
    }

    #[tokio::test]
    async fn test_force_logout_cancels_then_closes_session() {
        let h = harness(PaperConfig::default()).await;
        working_order(&h, "rb2410").await;
        working_order(&h, "ag2412").await;

        let report = h.controller.force_logout("account compromised").await;
        assert!(report.logged_out);
        assert!(report.error.is_none());
        assert_eq!(report.cancel.cancelled(), 2);
        assert_eq!(h.gateway.cancel_log().len(), 2);
        assert!(h.gateway.query_account().await.is_err());

        let events = h.controller.events(10);
        assert_eq!(events.last().unwrap().action, EmergencyAction::ForceLogout);
        let alert = h.alerts.history(1).pop().unwrap();
        assert_eq!(alert.level, AlertLevel::Critical);
        assert!(alert.message.contains("forced logout"));
    }

    #[tokio::test]
    async fn test_already_finished_order_reported_failed() {
        let h = harness(PaperConfig::default()).await;
        let order_ref = working_order(&h, "rb2410").await;
        h.gateway.fill(&order_ref, 3500.0).unwrap();
        // Book has not seen the fill yet; gateway refuses the cancel
        let report = h.controller.cancel_all().await;
        assert_eq!(report.failed(), 1);
        assert!(matches!(
            report.outcomes[0].result,
            CancelResult::Failed { .. }
        ));
    }
}
