//! Paper gateway
//!
//! In-process stand-in for a broker front. Commands mutate a simulated
//! order book and answer through the same event channel a real SPI would
//! use, so everything downstream of ingestion runs unchanged. Fault
//! injection hooks let tests reproduce rejected cancels, late insert
//! acknowledgments, disconnects, failed reconnects and day rollovers.
//!
//! After a lost front, [`PaperGateway::reconnect`] follows the configured
//! [`RetryPolicy`] the way a broker API's own retry loop would, announcing
//! each attempt before waiting out its delay.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::{Local, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use super::{CancelStatus, CancelTarget, Gateway, GatewayError, GatewayEvent, RetryPolicy};
use crate::models::{
    AccountSnapshot, InstrumentSpec, OrderRef, OrderRequest, OrderStatus, PositionSnapshot,
};

/// Broker error id used for simulated rejections
const PAPER_REJECT_CODE: i32 = 26;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_account_id")]
    pub account_id: String,

    /// Trading day reported on login (YYYYMMDD)
    #[serde(default = "default_trading_day")]
    pub trading_day: String,

    #[serde(default = "default_balance")]
    pub balance: f64,

    /// Delay before insert acknowledgments are delivered
    #[serde(default)]
    pub ack_latency_ms: u64,

    /// Probability that a cancel is rejected (0.0 to 1.0)
    #[serde(default)]
    pub cancel_reject_prob: f64,

    /// Hold insert acknowledgments until released
    #[serde(default)]
    pub hold_acks: bool,

    #[serde(default)]
    pub instruments: Vec<InstrumentSpec>,

    #[serde(default)]
    pub positions: Vec<PositionSnapshot>,
}

fn default_account_id() -> String {
    "paper".to_string()
}
fn default_trading_day() -> String {
    Local::now().format("%Y%m%d").to_string()
}
fn default_balance() -> f64 {
    1_000_000.0
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            account_id: default_account_id(),
            trading_day: default_trading_day(),
            balance: default_balance(),
            ack_latency_ms: 0,
            cancel_reject_prob: 0.0,
            hold_acks: false,
            instruments: Vec::new(),
            positions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    status: OrderStatus,
    order_sys_id: String,
}

#[derive(Debug, Default)]
struct PaperState {
    connected: bool,
    authenticated: bool,
    logged_in: bool,
    next_ref: u64,
    trading_day: String,
    orders: HashMap<OrderRef, PaperOrder>,
    held_acks: Vec<GatewayEvent>,
    rejected_cancels: HashSet<OrderRef>,
    cancel_log: Vec<(OrderRef, Instant)>,
    failing_reconnects: u32,
}

pub struct PaperGateway {
    config: PaperConfig,
    retry: RetryPolicy,
    events: mpsc::UnboundedSender<GatewayEvent>,
    state: Mutex<PaperState>,
}

impl PaperGateway {
    /// Build the gateway and the receiving end of its event stream.
    pub fn new(config: PaperConfig) -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = PaperState {
            next_ref: 1,
            trading_day: config.trading_day.clone(),
            ..Default::default()
        };
        let gateway = Self {
            config,
            retry: RetryPolicy::default(),
            events: tx,
            state: Mutex::new(state),
        };
        (gateway, rx)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn emit(&self, event: GatewayEvent) {
        if self.events.send(event).is_err() {
            debug!("paper gateway event dropped, no ingestion running");
        }
    }

    // =========================================================================
    // FAULT INJECTION
    // =========================================================================

    /// Make the next cancel for this order fail at the broker.
    pub fn reject_cancels_for(&self, order_ref: &str) {
        self.state.lock().rejected_cancels.insert(order_ref.to_string());
    }

    /// Deliver insert acknowledgments held back by `hold_acks`.
    pub fn release_held_acks(&self) -> usize {
        let held = {
            let mut state = self.state.lock();
            let held = std::mem::take(&mut state.held_acks);
            for event in &held {
                if let GatewayEvent::OrderAck { order_ref, .. } = event {
                    if let Some(order) = state.orders.get_mut(order_ref) {
                        if order.status == OrderStatus::PendingInsert {
                            order.status = OrderStatus::Queued;
                        }
                    }
                }
            }
            held
        };
        let count = held.len();
        for event in held {
            self.emit(event);
        }
        count
    }

    /// Cancel requests received so far, in arrival order.
    pub fn cancel_log(&self) -> Vec<(OrderRef, Instant)> {
        self.state.lock().cancel_log.clone()
    }

    pub fn order_status(&self, order_ref: &str) -> Option<OrderStatus> {
        self.state.lock().orders.get(order_ref).map(|o| o.status)
    }

    pub fn simulate_disconnect(&self, reason: i32) {
        {
            let mut state = self.state.lock();
            state.connected = false;
            state.authenticated = false;
            state.logged_in = false;
        }
        warn!(reason, "paper front disconnected");
        self.emit(GatewayEvent::FrontDisconnected { reason });
    }

    pub fn simulate_reconnect_attempt(&self, attempt: u32) {
        self.emit(GatewayEvent::ReconnectAttempt { attempt });
    }

    /// Make the next `count` reconnect attempts fail.
    pub fn fail_next_reconnects(&self, count: u32) {
        self.state.lock().failing_reconnects = count;
    }

    // =========================================================================
    // RECONNECT
    // =========================================================================

    /// Re-establish the session after a lost front. Returns the attempt
    /// that succeeded. An attempt past the policy's limit is still announced
    /// so observers can see the schedule ran out.
    pub async fn reconnect(&self) -> Result<u32, GatewayError> {
        let mut attempt = 1;
        loop {
            self.emit(GatewayEvent::ReconnectAttempt { attempt });
            let Some(delay) = self.retry.delay_for(attempt) else {
                warn!(attempt, max = self.retry.max_attempts, "paper reconnect gave up");
                return Err(GatewayError::Other(format!(
                    "reconnect gave up after {} attempts",
                    attempt - 1
                )));
            };
            sleep(delay).await;

            let fail = {
                let mut state = self.state.lock();
                if state.failing_reconnects > 0 {
                    state.failing_reconnects -= 1;
                    true
                } else {
                    false
                }
            };
            if fail {
                debug!(attempt, "paper reconnect attempt failed");
                attempt += 1;
                continue;
            }

            self.connect().await?;
            self.authenticate().await?;
            self.login().await?;
            info!(attempt, "paper front reconnected");
            return Ok(attempt);
        }
    }

    pub fn simulate_heartbeat_warning(&self, lapse_secs: u64) {
        self.emit(GatewayEvent::HeartbeatWarning { lapse_secs });
    }

    pub fn roll_trading_day(&self, trading_day: &str) {
        self.state.lock().trading_day = trading_day.to_string();
        info!(trading_day, "paper trading day rolled");
        self.emit(GatewayEvent::TradingDayChanged {
            trading_day: trading_day.to_string(),
        });
    }

    /// Fill a working order completely at `price`.
    pub fn fill(&self, order_ref: &str, price: f64) -> Result<(), GatewayError> {
        let order = {
            let mut state = self.state.lock();
            let order = state
                .orders
                .get_mut(order_ref)
                .ok_or_else(|| GatewayError::Other(format!("unknown order {}", order_ref)))?;
            if !order.status.is_open() {
                return Err(GatewayError::Other(format!(
                    "order {} is {}",
                    order_ref, order.status
                )));
            }
            order.status = OrderStatus::Filled;
            order.clone()
        };

        self.emit(GatewayEvent::Trade {
            order_ref: order_ref.to_string(),
            instrument_id: order.request.instrument_id.clone(),
            price,
            volume: order.request.volume,
        });
        self.emit(ack_event(order_ref, &order));
        Ok(())
    }
}

fn ack_event(order_ref: &str, order: &PaperOrder) -> GatewayEvent {
    GatewayEvent::OrderAck {
        order_ref: order_ref.to_string(),
        instrument_id: order.request.instrument_id.clone(),
        direction: order.request.direction,
        offset: order.request.offset,
        volume: order.request.volume,
        status: order.status,
        order_sys_id: Some(order.order_sys_id.clone()),
    }
}

#[async_trait::async_trait]
impl Gateway for PaperGateway {
    async fn connect(&self) -> Result<(), GatewayError> {
        self.state.lock().connected = true;
        self.emit(GatewayEvent::FrontConnected);
        Ok(())
    }

    async fn authenticate(&self) -> Result<(), GatewayError> {
        {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(GatewayError::NotConnected);
            }
            state.authenticated = true;
        }
        self.emit(GatewayEvent::AuthOk);
        Ok(())
    }

    async fn login(&self) -> Result<(), GatewayError> {
        let trading_day = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(GatewayError::NotConnected);
            }
            state.logged_in = true;
            state.trading_day.clone()
        };
        self.emit(GatewayEvent::LoginOk { trading_day });
        Ok(())
    }

    async fn logout(&self) -> Result<(), GatewayError> {
        {
            let mut state = self.state.lock();
            if !state.logged_in {
                return Err(GatewayError::NotConnected);
            }
            state.logged_in = false;
            state.authenticated = false;
            state.connected = false;
        }
        info!("paper session logged out");
        self.emit(GatewayEvent::LoggedOut);
        Ok(())
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderRef, GatewayError> {
        let (order_ref, order) = {
            let mut state = self.state.lock();
            if !state.logged_in {
                return Err(GatewayError::NotConnected);
            }
            let seq = state.next_ref;
            state.next_ref += 1;
            let order_ref = format!("{:012}", seq);
            let order = PaperOrder {
                request: request.clone(),
                status: if self.config.hold_acks {
                    OrderStatus::PendingInsert
                } else {
                    OrderStatus::Queued
                },
                order_sys_id: format!("P{:08}", seq),
            };
            state.orders.insert(order_ref.clone(), order.clone());
            (order_ref, order)
        };

        let mut ack = ack_event(&order_ref, &order);
        if self.config.hold_acks {
            if let GatewayEvent::OrderAck { status, .. } = &mut ack {
                *status = OrderStatus::Queued;
            }
            self.state.lock().held_acks.push(ack);
        } else if self.config.ack_latency_ms > 0 {
            let tx = self.events.clone();
            let delay = Duration::from_millis(self.config.ack_latency_ms);
            tokio::spawn(async move {
                sleep(delay).await;
                if tx.send(ack).is_err() {
                    debug!("paper gateway ack dropped, no ingestion running");
                }
            });
        } else {
            self.emit(ack);
        }

        debug!(order_ref = %order_ref, instrument = %request.instrument_id, "paper order accepted");
        Ok(order_ref)
    }

    async fn cancel_order(&self, target: &CancelTarget) -> Result<(), GatewayError> {
        let random_reject = {
            let mut rng = StdRng::from_entropy();
            self.config.cancel_reject_prob > 0.0 && rng.gen::<f64>() < self.config.cancel_reject_prob
        };

        let outcome = {
            let mut state = self.state.lock();
            if !state.logged_in {
                return Err(GatewayError::NotConnected);
            }
            state
                .cancel_log
                .push((target.order_ref.clone(), Instant::now()));

            let injected = state.rejected_cancels.remove(&target.order_ref);
            match state.orders.get_mut(&target.order_ref) {
                None => Err("order not found".to_string()),
                Some(_) if injected || random_reject => Err("cancel rejected (simulated)".to_string()),
                Some(order) if order.status == OrderStatus::PendingInsert => {
                    Err("order insert not yet acknowledged".to_string())
                }
                Some(order) if !order.status.is_open() => {
                    Err(format!("order already {}", order.status))
                }
                Some(order) => {
                    order.status = OrderStatus::Cancelled;
                    Ok(order.clone())
                }
            }
        };

        match outcome {
            Ok(order) => {
                self.emit(ack_event(&target.order_ref, &order));
                self.emit(GatewayEvent::CancelAck {
                    order_ref: target.order_ref.clone(),
                    instrument_id: target.instrument_id.clone(),
                    status: CancelStatus::Accepted,
                });
                Ok(())
            }
            Err(message) => {
                self.emit(GatewayEvent::CancelAck {
                    order_ref: target.order_ref.clone(),
                    instrument_id: target.instrument_id.clone(),
                    status: CancelStatus::Rejected,
                });
                Err(GatewayError::Rejected {
                    code: PAPER_REJECT_CODE,
                    message,
                })
            }
        }
    }

    async fn query_account(&self) -> Result<AccountSnapshot, GatewayError> {
        if !self.state.lock().logged_in {
            return Err(GatewayError::NotConnected);
        }
        Ok(AccountSnapshot {
            account_id: self.config.account_id.clone(),
            balance: self.config.balance,
            available: self.config.balance,
            current_margin: 0.0,
            frozen_margin: 0.0,
            updated_at: Utc::now(),
        })
    }

    async fn query_position(
        &self,
        instrument_id: Option<&str>,
    ) -> Result<Vec<PositionSnapshot>, GatewayError> {
        if !self.state.lock().logged_in {
            return Err(GatewayError::NotConnected);
        }
        Ok(self
            .config
            .positions
            .iter()
            .filter(|p| instrument_id.map_or(true, |id| p.instrument_id == id))
            .cloned()
            .collect())
    }

    async fn query_instruments(&self) -> Result<Vec<InstrumentSpec>, GatewayError> {
        if !self.state.lock().logged_in {
            return Err(GatewayError::NotConnected);
        }
        Ok(self.config.instruments.clone())
    }
}
