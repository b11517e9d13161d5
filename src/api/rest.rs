// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Health is public; everything else requires a valid Bearer token via the
// `AuthBearer` extractor.  CORS is configured permissively for development.
//
// Surface:
//   GET  /api/v1/health
//   GET  /api/v1/state
//   GET  /bars/:symbol?from&to&include_legacy
//   GET  /bars/:symbol/historical?limit
//   GET  /alerts?since&limit   /alerts/today   /alerts/stats
//   GET  /position/:symbol
//   GET  /signals/:symbol?classifier&limit
//   POST /chat {symbol, message}
//   POST /commands/reload
//   POST /test-sessions {symbol, config}    POST /test-sessions/finish {status}
//   WS   /bars/stream   /events/:symbol   /replay
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::types::ClassifierKind;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/bars/:symbol", get(bars))
        .route("/bars/:symbol/historical", get(historical_bars))
        .route("/alerts", get(alerts))
        .route("/alerts/today", get(alerts_today))
        .route("/alerts/stats", get(alerts_stats))
        .route("/position/:symbol", get(position))
        .route("/signals/:symbol", get(signals))
        .route("/chat", post(chat))
        .route("/commands/reload", post(reload_commands))
        .route("/test-sessions", post(start_test_session))
        .route("/test-sessions/finish", post(finish_test_session))
        // ── WebSocket ───────────────────────────────────────────────
        .route("/bars/stream", get(crate::api::ws::bars_stream_handler))
        .route("/events/:symbol", get(crate::api::ws::events_handler))
        .route("/replay", get(crate::api::ws::replay_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "state_version": state.current_state_version(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Full state snapshot
// =============================================================================

async fn full_state(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Bars
// =============================================================================

#[derive(Deserialize)]
struct BarsQuery {
    #[serde(default)]
    from: Option<i64>,
    #[serde(default)]
    to: Option<i64>,
    #[serde(default)]
    include_legacy: bool,
}

async fn bars(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<BarsQuery>,
) -> impl IntoResponse {
    let symbol = symbol.to_uppercase();
    let from = query.from.unwrap_or(0);
    let to = query.to.unwrap_or(i64::MAX);
    match state.db.query_bars(&symbol, from, to, query.include_legacy) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Deserialize)]
struct HistoricalQuery {
    #[serde(default = "default_historical_limit")]
    limit: u64,
}

fn default_historical_limit() -> u64 {
    500
}

async fn historical_bars(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<HistoricalQuery>,
) -> impl IntoResponse {
    let symbol = symbol.to_uppercase();
    match state.db.historical_bars_page(&symbol, 0, query.limit) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => db_error(e),
    }
}

// =============================================================================
// Alerts
// =============================================================================

#[derive(Deserialize)]
struct AlertsQuery {
    #[serde(default)]
    since: Option<i64>,
    #[serde(default = "default_alert_limit")]
    limit: u64,
}

fn default_alert_limit() -> u64 {
    100
}

fn today_start_ms() -> i64 {
    let now = chrono::Utc::now();
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(0)
}

async fn alerts(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> impl IntoResponse {
    match state.db.query_alerts(query.since.unwrap_or(0), query.limit) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => db_error(e),
    }
}

async fn alerts_today(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.db.query_alerts(today_start_ms(), 1000) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => db_error(e),
    }
}

async fn alerts_stats(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.db.alert_stats(today_start_ms()) {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => db_error(e),
    }
}

// =============================================================================
// Position & P&L
// =============================================================================

async fn position(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let symbol = symbol.to_uppercase();
    let last = state.store.last_price(&symbol);
    if last > 0.0 {
        state.ledger.update_price(&symbol, last);
    }
    Json(serde_json::json!({
        "symbol": symbol,
        "position": state.ledger.get_open(&symbol),
        "master_pnl": state.ledger.master_pnl(),
        "session_id": state.ledger.session_id(),
    }))
}

// =============================================================================
// Signals
// =============================================================================

#[derive(Deserialize)]
struct SignalsQuery {
    #[serde(default)]
    classifier: Option<String>,
    #[serde(default = "default_alert_limit")]
    limit: u64,
}

async fn signals(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<SignalsQuery>,
) -> impl IntoResponse {
    let symbol = symbol.to_uppercase();
    let classifier = query
        .classifier
        .as_deref()
        .and_then(|c| c.parse::<ClassifierKind>().ok());
    match state.db.recent_signals(&symbol, classifier, query.limit) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => db_error(e),
    }
}

// =============================================================================
// Chat (trade commands)
// =============================================================================

#[derive(Deserialize)]
struct ChatRequest {
    symbol: String,
    message: String,
}

async fn chat(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> impl IntoResponse {
    let symbol = req.symbol.to_uppercase();
    let response = state.executor.execute(&symbol, &req.message);
    state.increment_version();
    Json(serde_json::json!({
        "fast_response": response.text,
        "ok": response.ok,
        // Reserved for the optional asynchronous analysis follow-up.
        "trailing_async": serde_json::Value::Null,
    }))
}

// =============================================================================
// Command registry
// =============================================================================

async fn reload_commands(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.registry.reload() {
        Ok(count) => {
            info!(commands = count, "registry reloaded via API");
            Json(serde_json::json!({ "commands": count })).into_response()
        }
        Err(e) => db_error(e),
    }
}

// =============================================================================
// Test sessions
// =============================================================================

#[derive(Deserialize)]
struct TestSessionRequest {
    symbol: String,
    #[serde(default)]
    config: serde_json::Value,
}

async fn start_test_session(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<TestSessionRequest>,
) -> impl IntoResponse {
    let id = state
        .evaluation
        .start_test_session(&req.symbol.to_uppercase(), req.config);
    Json(serde_json::json!({ "id": id }))
}

#[derive(Deserialize)]
struct FinishTestSessionRequest {
    #[serde(default = "default_finish_status")]
    status: String,
}

fn default_finish_status() -> String {
    "completed".to_string()
}

async fn finish_test_session(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<FinishTestSessionRequest>,
) -> impl IntoResponse {
    match state.evaluation.finish_test_session(&req.status) {
        Some(metrics) => Json(serde_json::json!({ "metrics": metrics })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no active test session" })),
        )
            .into_response(),
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn db_error(e: anyhow::Error) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}
