use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::alert::AlertEvent;
use crate::config::{ThresholdConfig, ThresholdUpdate};
use crate::context::{BrokerSnapshots, HealthReport, MonitorContext};
use crate::emergency::{
    CancelReport, EmergencyEvent, EmergencyState, EmergencyStopReport, ForceLogoutReport,
    SettlementPolicy,
};
use crate::models::OrderRequest;
use crate::monitor::activity::{ActivitySnapshot, InstrumentCounters};
use crate::monitor::connection::{ConnectionSnapshot, TransitionRecord};
use crate::validator::ValidationResult;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

/// Create the control API router
pub fn create_router(ctx: Arc<MonitorContext>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/connection", get(get_connection))
        .route("/api/activity", get(get_activity))
        .route("/api/alerts", get(get_alerts))
        .route("/api/snapshots", get(get_snapshots))
        .route("/api/thresholds", get(get_thresholds).put(update_thresholds))
        .route("/api/emergency", get(get_emergency))
        .route("/api/emergency/pause", post(pause_trading))
        .route("/api/emergency/resume", post(resume_trading))
        .route("/api/emergency/stop", post(emergency_stop))
        .route("/api/emergency/logout", post(force_logout))
        .route("/api/emergency/strategies/stop", post(stop_strategy))
        .route("/api/emergency/strategies/resume", post(resume_strategy))
        .route("/api/emergency/cancel-all", post(cancel_all))
        .route("/api/emergency/cancel/:instrument_id", post(cancel_by_instrument))
        .route("/api/emergency/settlement/confirm", post(confirm_settlement))
        .route("/api/emergency/settlement/policy", put(set_settlement_policy))
        .route("/api/orders/validate", post(validate_order))
        .with_state(ctx)
}

// ===== Route Handlers =====

async fn health_check(State(ctx): State<Arc<MonitorContext>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        report: ctx.health(),
    })
}

async fn get_connection(
    State(ctx): State<Arc<MonitorContext>>,
    Query(params): Query<LimitQuery>,
) -> Json<ConnectionResponse> {
    Json(ConnectionResponse {
        snapshot: ctx.connection.snapshot(),
        transitions: ctx.connection.history(params.limit()),
    })
}

async fn get_activity(
    State(ctx): State<Arc<MonitorContext>>,
    Query(params): Query<TopQuery>,
) -> Json<ActivityResponse> {
    let snapshot = ctx.activity.snapshot();
    let top = snapshot.top_instruments(params.top.unwrap_or(10).min(MAX_LIMIT));
    Json(ActivityResponse { snapshot, top })
}

async fn get_alerts(
    State(ctx): State<Arc<MonitorContext>>,
    Query(params): Query<LimitQuery>,
) -> Json<AlertsResponse> {
    let alerts = ctx.alerts.history(params.limit());
    Json(AlertsResponse {
        count: alerts.len(),
        alerts,
    })
}

async fn get_snapshots(State(ctx): State<Arc<MonitorContext>>) -> Json<BrokerSnapshots> {
    Json(ctx.broker_snapshots())
}

async fn get_thresholds(State(ctx): State<Arc<MonitorContext>>) -> Json<ThresholdConfig> {
    Json(ctx.thresholds.config())
}

async fn update_thresholds(
    State(ctx): State<Arc<MonitorContext>>,
    Json(update): Json<ThresholdUpdate>,
) -> Json<ThresholdConfig> {
    Json(ctx.thresholds.update_config(&update))
}

async fn get_emergency(
    State(ctx): State<Arc<MonitorContext>>,
    Query(params): Query<LimitQuery>,
) -> Json<EmergencyResponse> {
    Json(EmergencyResponse {
        state: ctx.emergency.state(),
        events: ctx.emergency.events(params.limit()),
    })
}

async fn pause_trading(
    State(ctx): State<Arc<MonitorContext>>,
    Json(body): Json<ReasonBody>,
) -> Result<Json<EmergencyState>, ApiError> {
    let reason = body.reason()?;
    Ok(Json(ctx.emergency.pause_trading(reason)))
}

async fn resume_trading(
    State(ctx): State<Arc<MonitorContext>>,
    Json(body): Json<ReasonBody>,
) -> Result<Json<EmergencyState>, ApiError> {
    let reason = body.reason()?;
    Ok(Json(ctx.emergency.resume_trading(reason)))
}

async fn emergency_stop(
    State(ctx): State<Arc<MonitorContext>>,
    Json(body): Json<ReasonBody>,
) -> Result<Json<EmergencyStopReport>, ApiError> {
    let reason = body.reason()?;
    Ok(Json(ctx.emergency.emergency_stop(reason).await))
}

async fn force_logout(
    State(ctx): State<Arc<MonitorContext>>,
    Json(body): Json<ReasonBody>,
) -> Result<Json<ForceLogoutReport>, ApiError> {
    let reason = body.reason()?;
    Ok(Json(ctx.emergency.force_logout(reason).await))
}

/// Without a `strategy_id` every strategy is stopped
async fn stop_strategy(
    State(ctx): State<Arc<MonitorContext>>,
    Json(body): Json<StrategyBody>,
) -> Result<Json<EmergencyState>, ApiError> {
    let reason = body.reason()?;
    Ok(Json(ctx.emergency.stop_strategy(body.strategy_id.as_deref(), reason)))
}

async fn resume_strategy(
    State(ctx): State<Arc<MonitorContext>>,
    Json(body): Json<StrategyBody>,
) -> Result<Json<EmergencyState>, ApiError> {
    let reason = body.reason()?;
    Ok(Json(ctx.emergency.resume_strategy(body.strategy_id.as_deref(), reason)))
}

async fn cancel_all(State(ctx): State<Arc<MonitorContext>>) -> Json<CancelReport> {
    Json(ctx.emergency.cancel_all().await)
}

async fn cancel_by_instrument(
    State(ctx): State<Arc<MonitorContext>>,
    Path(instrument_id): Path<String>,
) -> Json<CancelReport> {
    Json(ctx.emergency.cancel_by_instrument(&instrument_id).await)
}

async fn confirm_settlement(State(ctx): State<Arc<MonitorContext>>) -> Json<EmergencyState> {
    Json(ctx.emergency.confirm_settlement())
}

async fn set_settlement_policy(
    State(ctx): State<Arc<MonitorContext>>,
    Json(body): Json<PolicyBody>,
) -> Json<EmergencyState> {
    Json(ctx.emergency.set_settlement_policy(body.policy))
}

/// Dry-run validation; never submits
async fn validate_order(
    State(ctx): State<Arc<MonitorContext>>,
    Json(request): Json<OrderRequest>,
) -> Json<ValidationResult> {
    Json(ctx.validate_dry_run(&request))
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }
}

#[derive(Deserialize)]
struct TopQuery {
    top: Option<usize>,
}

#[derive(Deserialize)]
struct ReasonBody {
    reason: String,
}

impl ReasonBody {
    fn reason(&self) -> Result<&str, ApiError> {
        non_empty_reason(&self.reason)
    }
}

#[derive(Deserialize)]
struct StrategyBody {
    reason: String,
    #[serde(default)]
    strategy_id: Option<String>,
}

impl StrategyBody {
    fn reason(&self) -> Result<&str, ApiError> {
        non_empty_reason(&self.reason)
    }
}

fn non_empty_reason(reason: &str) -> Result<&str, ApiError> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(ApiError::BadRequest("reason must not be empty".to_string()));
    }
    Ok(reason)
}

#[derive(Deserialize)]
struct PolicyBody {
    policy: SettlementPolicy,
}

#[derive(Serialize, Deserialize)]
struct HealthResponse {
    version: String,
    #[serde(flatten)]
    report: HealthReport,
}

#[derive(Serialize, Deserialize)]
struct ConnectionResponse {
    snapshot: ConnectionSnapshot,
    transitions: Vec<TransitionRecord>,
}

#[derive(Serialize, Deserialize)]
struct ActivityResponse {
    snapshot: ActivitySnapshot,
    top: Vec<(String, InstrumentCounters)>,
}

#[derive(Serialize, Deserialize)]
struct AlertsResponse {
    count: usize,
    alerts: Vec<AlertEvent>,
}

#[derive(Serialize, Deserialize)]
struct EmergencyResponse {
    state: EmergencyState,
    events: Vec<EmergencyEvent>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
