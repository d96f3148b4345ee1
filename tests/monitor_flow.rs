//! End-to-end flows through the monitor context and the paper gateway.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;
use tokio::task::JoinHandle;

use tradeguard_backend::alert::{AlertLevel, AlertMetric};
use tradeguard_backend::clock::SystemClock;
use tradeguard_backend::config::{Settings, ThresholdUpdate};
use tradeguard_backend::emergency::CancelResult;
use tradeguard_backend::gateway::paper::{PaperConfig, PaperGateway};
use tradeguard_backend::gateway::{
    CancelTarget, Gateway, GatewayError, GatewayEvent, RetryPolicy,
};
use tradeguard_backend::models::{
    AccountSnapshot, Direction, InstrumentSpec, Offset, OrderRef, OrderRequest, OrderStatus,
    PositionDirection, PositionSnapshot,
};
use tradeguard_backend::monitor::connection::ConnectionState;
use tradeguard_backend::validator::sessions::TradingSession;
use tradeguard_backend::validator::ViolationCode;
use tradeguard_backend::{MonitorContext, SubmitOutcome};

struct Harness {
    ctx: Arc<MonitorContext>,
    gateway: Arc<PaperGateway>,
    pump: JoinHandle<()>,
}

/// Paper gateway whose order inserts take a while to return.
struct SlowGateway {
    inner: Arc<PaperGateway>,
    submit_delay: Duration,
}

#[async_trait::async_trait]
impl Gateway for SlowGateway {
    async fn connect(&self) -> Result<(), GatewayError> {
        self.inner.connect().await
    }

    async fn authenticate(&self) -> Result<(), GatewayError> {
        self.inner.authenticate().await
    }

    async fn login(&self) -> Result<(), GatewayError> {
        self.inner.login().await
    }

    async fn logout(&self) -> Result<(), GatewayError> {
        self.inner.logout().await
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderRef, GatewayError> {
        tokio::time::sleep(self.submit_delay).await;
        self.inner.submit_order(request).await
    }

    async fn cancel_order(&self, target: &CancelTarget) -> Result<(), GatewayError> {
        self.inner.cancel_order(target).await
    }

    async fn query_account(&self) -> Result<AccountSnapshot, GatewayError> {
        self.inner.query_account().await
    }

    async fn query_position(
        &self,
        instrument_id: Option<&str>,
    ) -> Result<Vec<PositionSnapshot>, GatewayError> {
        self.inner.query_position(instrument_id).await
    }

    async fn query_instruments(&self) -> Result<Vec<InstrumentSpec>, GatewayError> {
        self.inner.query_instruments().await
    }
}

fn always_open() -> Vec<TradingSession> {
    let t = |h, m, s| NaiveTime::from_hms_opt(h, m, s).unwrap();
    vec![
        TradingSession::new("day", t(0, 0, 0), t(23, 59, 59)),
        TradingSession::new("overnight", t(23, 59, 59), t(0, 0, 0)),
    ]
}

fn instruments() -> Vec<InstrumentSpec> {
    vec![
        InstrumentSpec::new("rb2410", 1.0),
        InstrumentSpec::new("au2412", 0.02),
    ]
}

fn settings(hold_acks: bool) -> Settings {
    let mut settings = Settings::default();
    settings.validator.instruments = instruments();
    settings.validator.default_sessions = always_open();
    settings.validator.weekdays_only = false;
    settings.emergency.query_min_interval_ms = 0;
    settings.emergency.cancel_min_interval_ms = 10;
    settings.emergency.insert_ack_timeout_ms = 300;
    settings.gateway.retry = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 5,
        multiplier: 2.0,
        max_delay_ms: 20,
    };
    settings.gateway.paper = PaperConfig {
        trading_day: "20240102".to_string(),
        hold_acks,
        instruments: instruments(),
        positions: vec![PositionSnapshot {
            instrument_id: "rb2410".to_string(),
            direction: PositionDirection::Long,
            position: 5,
            today_position: 2,
            yd_position: 3,
        }],
        ..Default::default()
    };
    settings
}

async fn start(settings: Settings) -> Harness {
    start_with(settings, None).await
}

async fn start_with(settings: Settings, submit_delay: Option<Duration>) -> Harness {
    let (gateway, mut events) = PaperGateway::new(settings.gateway.paper.clone());
    let gateway = Arc::new(gateway.with_retry_policy(settings.gateway.retry.clone()));
    let facade: Arc<dyn Gateway> = match submit_delay {
        Some(submit_delay) => Arc::new(SlowGateway {
            inner: gateway.clone(),
            submit_delay,
        }),
        None => gateway.clone(),
    };
    let ctx = Arc::new(MonitorContext::new(
        &settings,
        facade,
        Arc::new(SystemClock::new()),
    ));
    ctx.start();

    let pump = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                ctx.ingest(event);
            }
        })
    };

    ctx.bring_up().await.unwrap();
    eventually(|| {
        ctx.connection.state() == ConnectionState::LoggedIn && ctx.activity.trading_day().is_some()
    })
    .await;
    Harness { ctx, gateway, pump }
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 1s");
}

fn buy_open(instrument: &str, price: f64) -> OrderRequest {
    OrderRequest::new(instrument, Direction::Buy, Offset::Open, price, 1)
}

#[tokio::test]
async fn test_bring_up_loads_snapshots() {
    let h = start(settings(false)).await;

    let snapshots = h.ctx.broker_snapshots();
    assert_eq!(snapshots.account.unwrap().balance, 1_000_000.0);
    assert_eq!(snapshots.positions.unwrap().len(), 1);

    let health = h.ctx.health();
    assert!(health.healthy);
    assert_eq!(health.trading_day.as_deref(), Some("20240102"));
    h.pump.abort();
}

#[tokio::test]
async fn test_submitted_orders_are_counted_on_ack() {
    let h = start(settings(false)).await;

    for _ in 0..3 {
        let outcome = h.ctx.submit_order(buy_open("rb2410", 3500.0)).await;
        assert!(matches!(outcome, SubmitOutcome::Submitted { .. }));
    }
    let outcome = h
        .ctx
        .submit_order(OrderRequest::new("rb2410", Direction::Sell, Offset::Close, 3501.0, 2))
        .await;
    let order_ref = outcome.order_ref().unwrap().to_string();
    assert_eq!(order_ref, "000000000004");

    eventually(|| h.ctx.activity.snapshot().account.total_orders == 4).await;
    let counters = h.ctx.activity.instrument("rb2410");
    assert_eq!(counters.open_count, 3);
    assert_eq!(counters.close_count, 1);

    // Fill produces another order return; it must not be counted again
    h.gateway.fill(&order_ref, 3501.0).unwrap();
    eventually(|| h.ctx.activity.snapshot().account.total_trades == 1).await;
    assert_eq!(h.ctx.activity.snapshot().account.total_orders, 4);
    assert_eq!(h.ctx.orders.get(&order_ref).unwrap().status, OrderStatus::Filled);
    h.pump.abort();
}

#[tokio::test]
async fn test_invalid_order_never_reaches_gateway() {
    let h = start(settings(false)).await;

    let outcome = h.ctx.submit_order(buy_open("au2412", 450.01)).await;
    match outcome {
        SubmitOutcome::Rejected { validation } => {
            assert_eq!(validation.codes(), vec![ViolationCode::InvalidPriceTick]);
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    let outcome = h
        .ctx
        .submit_order(OrderRequest::new("rb2410", Direction::Sell, Offset::CloseToday, 3500.0, 3))
        .await;
    assert!(outcome.validation().has(ViolationCode::InsufficientPosition));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.ctx.activity.snapshot().account.total_orders, 0);
    assert!(h.ctx.orders.open_orders(None).is_empty());
    h.pump.abort();
}

#[tokio::test]
async fn test_threshold_alert_raised_once_per_cooldown() {
    let h = start(settings(false)).await;
    h.ctx.thresholds.update_config(&ThresholdUpdate {
        per_instrument_open_limit: Some(2),
        ..Default::default()
    });

    for _ in 0..4 {
        h.ctx.submit_order(buy_open("rb2410", 3500.0)).await;
    }
    eventually(|| h.ctx.activity.instrument("rb2410").open_count == 4).await;

    h.ctx.shutdown().await;
    let opens: Vec<_> = h
        .ctx
        .alerts
        .history(100)
        .into_iter()
        .filter(|a| a.metric == AlertMetric::InstrumentOpens)
        .collect();
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0].value, 2);
    assert_eq!(opens[0].instrument.as_deref(), Some("rb2410"));
    h.pump.abort();
}

#[tokio::test]
async fn test_pause_blocks_submission() {
    let h = start(settings(false)).await;
    h.ctx.emergency.pause_trading("risk review");

    let outcome = h.ctx.submit_order(buy_open("rb2410", 3500.0)).await;
    assert!(matches!(outcome, SubmitOutcome::Rejected { .. }));
    assert_eq!(outcome.validation().codes(), vec![ViolationCode::TradingPaused]);

    h.ctx.emergency.resume_trading("cleared");
    let outcome = h.ctx.submit_order(buy_open("rb2410", 3500.0)).await;
    assert!(matches!(outcome, SubmitOutcome::Submitted { .. }));
    h.pump.abort();
}

#[tokio::test]
async fn test_emergency_stop_reports_each_order() {
    let h = start(settings(false)).await;

    let mut refs = Vec::new();
    for instrument in ["rb2410", "au2412", "rb2410"] {
        let price = if instrument == "rb2410" { 3500.0 } else { 450.02 };
        let outcome = h.ctx.submit_order(buy_open(instrument, price)).await;
        refs.push(outcome.order_ref().unwrap().to_string());
    }
    eventually(|| h.ctx.activity.snapshot().account.total_orders == 3).await;
    h.gateway.reject_cancels_for(&refs[1]);

    let report = h.ctx.emergency.emergency_stop("limit breach").await;
    assert!(!report.state.trading_enabled);
    assert_eq!(report.cancel.attempted(), 3);
    assert_eq!(report.cancel.cancelled(), 2);
    let failed = report
        .cancel
        .outcomes
        .iter()
        .find(|o| o.order_ref == refs[1])
        .unwrap();
    assert!(matches!(failed.result, CancelResult::Failed { .. }));

    // Rejected cancels count as cancel instructions too
    eventually(|| h.ctx.activity.snapshot().account.total_cancels == 3).await;

    let log = h.gateway.cancel_log();
    for pair in log.windows(2) {
        assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(8));
    }

    let outcome = h.ctx.submit_order(buy_open("rb2410", 3500.0)).await;
    assert!(outcome.validation().has(ViolationCode::TradingPaused));
    h.pump.abort();
}

#[tokio::test]
async fn test_cancel_waits_for_pending_insert() {
    let h = start(settings(true)).await;

    let outcome = h.ctx.submit_order(buy_open("rb2410", 3500.0)).await;
    let order_ref = outcome.order_ref().unwrap().to_string();
    assert_eq!(h.ctx.orders.get(&order_ref).unwrap().status, OrderStatus::PendingInsert);

    let gateway = h.gateway.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        gateway.release_held_acks();
    });

    let report = h.ctx.emergency.cancel_by_instrument("rb2410").await;
    assert_eq!(report.cancelled(), 1);
    assert_eq!(h.gateway.order_status(&order_ref), Some(OrderStatus::Cancelled));
    h.pump.abort();
}

#[tokio::test]
async fn test_unacknowledged_insert_fails_cancel() {
    let h = start(settings(true)).await;

    h.ctx.submit_order(buy_open("rb2410", 3500.0)).await;
    let report = h.ctx.emergency.cancel_all().await;
    assert_eq!(report.attempted(), 1);
    assert_eq!(report.failed(), 1);
    assert!(h.gateway.cancel_log().is_empty());
    h.pump.abort();
}

#[tokio::test]
async fn test_trading_day_rollover_resets_counters() {
    let h = start(settings(false)).await;
    h.ctx.emergency.confirm_settlement();

    h.ctx.submit_order(buy_open("rb2410", 3500.0)).await;
    eventually(|| h.ctx.activity.snapshot().account.total_orders == 1).await;

    h.gateway.roll_trading_day("20240103");
    eventually(|| h.ctx.activity.trading_day().as_deref() == Some("20240103")).await;

    let snapshot = h.ctx.activity.snapshot();
    assert_eq!(snapshot.account.total_orders, 0);
    assert!(snapshot.instruments.is_empty());
    assert!(!h.ctx.emergency.state().settlement_confirmed);
    h.pump.abort();
}

#[tokio::test]
async fn test_disconnect_raises_connection_alert() {
    let h = start(settings(false)).await;

    h.gateway.simulate_disconnect(0x1001);
    eventually(|| h.ctx.connection.state() == ConnectionState::Disconnected).await;
    h.gateway.simulate_reconnect_attempt(1);
    eventually(|| h.ctx.connection.state() == ConnectionState::Reconnecting).await;

    let snapshot = h.ctx.connection.snapshot();
    assert_eq!(snapshot.disconnect_count, 1);
    assert_eq!(snapshot.last_disconnect_reason, Some(0x1001));

    h.ctx.shutdown().await;
    let alerts = h.ctx.alerts.history(100);
    assert!(alerts
        .iter()
        .any(|a| a.metric == AlertMetric::Connection && a.message.contains("DISCONNECTED")));

    // Orders are refused by the gateway while the front is down
    let outcome = h.ctx.submit_order(buy_open("rb2410", 3500.0)).await;
    assert!(matches!(outcome, SubmitOutcome::GatewayFailed { .. }));
    assert!(h.gateway.query_account().await.is_err());
    h.pump.abort();
}

#[tokio::test]
async fn test_emergency_stop_cancels_order_in_flight() {
    let h = start_with(settings(false), Some(Duration::from_millis(50))).await;

    let submit = {
        let ctx = h.ctx.clone();
        tokio::spawn(async move { ctx.submit_order(buy_open("rb2410", 3500.0)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = h.ctx.emergency.emergency_stop("operator drill").await;
    let outcome = submit.await.unwrap();
    let order_ref = outcome.order_ref().unwrap().to_string();

    assert_eq!(report.cancel.attempted(), 1);
    assert_eq!(report.cancel.cancelled(), 1);
    assert_eq!(h.gateway.order_status(&order_ref), Some(OrderStatus::Cancelled));
    eventually(|| h.ctx.orders.open_orders(None).is_empty()).await;

    let outcome = h.ctx.submit_order(buy_open("rb2410", 3500.0)).await;
    assert_eq!(outcome.validation().codes(), vec![ViolationCode::TradingPaused]);
    h.pump.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingest_counts_exactly() {
    let mut s = settings(false);
    s.thresholds.per_instrument_open_limit = 10;
    s.thresholds.total_order_limit = 50;
    let h = start(s).await;

    let mut tasks = Vec::new();
    for task in 0..4 {
        let ctx = h.ctx.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                ctx.ingest(GatewayEvent::OrderAck {
                    order_ref: format!("ext-{}-{:03}", task, i),
                    instrument_id: "rb2410".to_string(),
                    direction: Direction::Buy,
                    offset: Offset::Open,
                    volume: 1,
                    status: OrderStatus::Queued,
                    order_sys_id: None,
                });
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    h.ctx.shutdown().await;

    assert_eq!(h.ctx.activity.instrument("rb2410").open_count, 100);
    assert_eq!(h.ctx.activity.snapshot().account.total_orders, 100);

    let alerts = h.ctx.alerts.history(1000);
    let count = |metric: AlertMetric| alerts.iter().filter(|a| a.metric == metric).count();
    assert_eq!(count(AlertMetric::InstrumentOpens), 1);
    assert_eq!(count(AlertMetric::TotalOrders), 1);
    h.pump.abort();
}

#[tokio::test]
async fn test_force_logout_cancels_and_closes_session() {
    let h = start(settings(false)).await;
    for _ in 0..2 {
        h.ctx.submit_order(buy_open("rb2410", 3500.0)).await;
    }
    eventually(|| h.ctx.activity.snapshot().account.total_orders == 2).await;

    let report = h.ctx.emergency.force_logout("account compromised").await;
    assert!(report.logged_out);
    assert_eq!(report.cancel.cancelled(), 2);
    eventually(|| h.ctx.connection.state() == ConnectionState::Disconnected).await;
    assert_eq!(h.ctx.connection.snapshot().disconnect_count, 0);

    let outcome = h.ctx.submit_order(buy_open("rb2410", 3500.0)).await;
    assert!(matches!(outcome, SubmitOutcome::GatewayFailed { .. }));

    let alerts = h.ctx.alerts.history(100);
    assert!(alerts
        .iter()
        .any(|a| a.level == AlertLevel::Critical && a.message.contains("forced logout")));
    h.pump.abort();
}

#[tokio::test]
async fn test_stopped_strategy_orders_rejected() {
    let mut s = settings(false);
    s.emergency.strategies = vec!["alpha".to_string(), "beta".to_string()];
    let h = start(s).await;

    h.ctx.emergency.stop_strategy(Some("alpha"), "runaway quoting");
    let outcome = h
        .ctx
        .submit_order(buy_open("rb2410", 3500.0).with_strategy("alpha"))
        .await;
    assert_eq!(outcome.validation().codes(), vec![ViolationCode::StrategyStopped]);

    let outcome = h
        .ctx
        .submit_order(buy_open("rb2410", 3500.0).with_strategy("beta"))
        .await;
    assert!(matches!(outcome, SubmitOutcome::Submitted { .. }));

    // Emergency stop halts every strategy; resuming trading leaves them stopped
    h.ctx.emergency.emergency_stop("limit breach").await;
    h.ctx.emergency.resume_trading("cleared");
    let outcome = h
        .ctx
        .submit_order(buy_open("rb2410", 3500.0).with_strategy("beta"))
        .await;
    assert!(outcome.validation().has(ViolationCode::StrategyStopped));
    let outcome = h.ctx.submit_order(buy_open("rb2410", 3500.0)).await;
    assert!(matches!(outcome, SubmitOutcome::Submitted { .. }));

    h.ctx.emergency.resume_strategy(None, "reviewed");
    let outcome = h
        .ctx
        .submit_order(buy_open("rb2410", 3500.0).with_strategy("alpha"))
        .await;
    assert!(matches!(outcome, SubmitOutcome::Submitted { .. }));
    h.pump.abort();
}

#[tokio::test]
async fn test_reconnect_restores_session() {
    let h = start(settings(false)).await;

    h.gateway.simulate_disconnect(0x2001);
    h.gateway.fail_next_reconnects(1);
    assert_eq!(h.gateway.reconnect().await, Ok(2));

    eventually(|| h.ctx.connection.state() == ConnectionState::LoggedIn).await;
    let snapshot = h.ctx.connection.snapshot();
    assert_eq!(snapshot.disconnect_count, 1);
    assert_eq!(snapshot.reconnect_attempt, 0);
    assert_eq!(snapshot.anomaly_count, 0);

    let outcome = h.ctx.submit_order(buy_open("rb2410", 3500.0)).await;
    assert!(matches!(outcome, SubmitOutcome::Submitted { .. }));
    h.pump.abort();
}
