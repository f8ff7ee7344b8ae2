// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Error mapping is part of the contract: client errors 400, ingress
// pressure 429, upstream data failures 502, cancellations/timeouts 504,
// everything else 500. Every error body carries the machine-readable kind
// plus a human message; an opaque error never crosses this boundary.
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::analysis::orchestrator::{AnalysisOptions, AnalysisRequest};
use crate::app_state::AppState;
use crate::error::EngineError;
use crate::types::Timeframe;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/analyze", post(analyze))
        .route("/market/status", get(market_status))
        .route(
            "/market/optimization/clear-interval-cache",
            post(clear_interval_cache),
        )
        .route("/mapping/token-to-symbol", get(token_to_symbol))
        .route("/mapping/symbol-to-token", get(symbol_to_token))
        .route("/chart/candles", get(chart_candles))
        .route("/metrics/stream", get(stream_metrics))
        .route("/decisions/recent", get(recent_decisions))
        .route("/ws/stream", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error mapping
// =============================================================================

fn error_response(err: &EngineError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        EngineError::Client(_) => StatusCode::BAD_REQUEST,
        EngineError::Busy => StatusCode::TOO_MANY_REQUESTS,
        EngineError::DataUnavailable(_) => StatusCode::BAD_GATEWAY,
        EngineError::Cancelled | EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Llm(_) | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = serde_json::json!({
        "error": err.kind(),
        "message": err.to_string(),
        "retryable": err.retryable(),
    });
    (status, Json(body))
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_s": state.start_time.elapsed().as_secs(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// POST /analyze
// =============================================================================

fn default_period_days() -> u32 {
    30
}

fn default_interval() -> Timeframe {
    Timeframe::M15
}

fn default_exchange() -> String {
    "NSE".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AnalyzeBody {
    symbol: String,
    #[serde(default = "default_exchange")]
    exchange: String,
    #[serde(default = "default_period_days")]
    period_days: u32,
    #[serde(default = "default_interval")]
    interval: Timeframe,
    #[serde(default)]
    options: Option<AnalysisOptions>,
}

async fn analyze(
    State(state): State<Arc<AppState>>,
    body: Result<Json<AnalyzeBody>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    // Malformed/unknown-key bodies are client errors with the same error
    // shape as everything else.
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            let err = EngineError::Client(rejection.body_text());
            return error_response(&err).into_response();
        }
    };

    let request = AnalysisRequest {
        symbol: body.symbol.trim().to_uppercase(),
        exchange: body.exchange,
        period_days: body.period_days,
        interval: body.interval,
        options: body.options.unwrap_or_default(),
    };

    info!(symbol = %request.symbol, interval = %request.interval, "analyze request");

    let cancel = CancellationToken::new();
    match state.orchestrator.analyze(request, &cancel).await {
        Ok(outcome) => Json(serde_json::json!({
            "decision": outcome.decision,
            "record": outcome.record,
        }))
        .into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

// =============================================================================
// GET /market/status
// =============================================================================

async fn market_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = chrono::Utc::now().timestamp_millis();
    let status = state.calendar.status_at(now);
    Json(serde_json::json!({
        "status": status,
        "server_time": now,
        "next_open": state.calendar.next_open(now),
    }))
}

// =============================================================================
// POST /market/optimization/clear-interval-cache
// =============================================================================

#[derive(Deserialize)]
struct ClearCacheQuery {
    symbol: String,
    interval: String,
}

async fn clear_interval_cache(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ClearCacheQuery>,
) -> impl IntoResponse {
    let interval: Timeframe = match query.interval.parse() {
        Ok(tf) => tf,
        Err(e) => return error_response(&EngineError::Client(e)).into_response(),
    };
    let symbol = query.symbol.trim().to_uppercase();
    let invalidated = state.cache.invalidate(&symbol, interval);

    info!(symbol = %symbol, interval = %interval, invalidated, "cache invalidation requested");
    Json(serde_json::json!({
        "symbol": symbol,
        "interval": interval,
        "invalidated": invalidated,
    }))
    .into_response()
}

// =============================================================================
// Instrument mapping
// =============================================================================

#[derive(Deserialize)]
struct TokenQuery {
    token: i64,
}

async fn token_to_symbol(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    match state.instruments.by_token(query.token) {
        Some(instrument) => Json(serde_json::json!(instrument)).into_response(),
        None => error_response(&EngineError::Client(format!(
            "unknown token: {}",
            query.token
        )))
        .into_response(),
    }
}

#[derive(Deserialize)]
struct SymbolQuery {
    symbol: String,
    #[serde(default = "default_exchange")]
    exchange: String,
}

async fn symbol_to_token(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SymbolQuery>,
) -> impl IntoResponse {
    match state.instruments.by_symbol(&query.symbol, &query.exchange) {
        Some(instrument) => Json(serde_json::json!(instrument)).into_response(),
        None => error_response(&EngineError::Client(format!(
            "unknown symbol: {} on {}",
            query.symbol, query.exchange
        )))
        .into_response(),
    }
}

// =============================================================================
// Chart candles (live store)
// =============================================================================

fn default_chart_count() -> usize {
    200
}

#[derive(Deserialize)]
struct ChartQuery {
    token: i64,
    interval: String,
    #[serde(default = "default_chart_count")]
    count: usize,
}

async fn chart_candles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChartQuery>,
) -> impl IntoResponse {
    let interval: Timeframe = match query.interval.parse() {
        Ok(tf) => tf,
        Err(e) => return error_response(&EngineError::Client(e)).into_response(),
    };

    let closed = state
        .candle_store
        .closed(query.token, interval, query.count.min(1_000));
    Json(serde_json::json!({
        "token": query.token,
        "interval": interval,
        "candles": closed,
        "rolling": state.candle_store.rolling(query.token, interval),
        "last_close": state.candle_store.last_close(query.token, interval),
    }))
    .into_response()
}

// =============================================================================
// Stream metrics & recent decisions
// =============================================================================

async fn stream_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    use std::sync::atomic::Ordering;
    let gate = &state.gate_metrics;
    Json(serde_json::json!({
        "gate": {
            "admitted": gate.admitted.load(Ordering::Relaxed),
            "duplicates": gate.duplicates.load(Ordering::Relaxed),
            "malformed": gate.malformed.load(Ordering::Relaxed),
            "clock_skew": gate.clock_skew.load(Ordering::Relaxed),
        },
        "hub": state.hub.metrics(),
    }))
}

#[derive(Deserialize)]
struct RecentQuery {
    #[serde(default = "default_recent_count")]
    count: usize,
}

fn default_recent_count() -> usize {
    20
}

async fn recent_decisions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    Json(state.decision_store.recent(query.count.min(100)))
}
