// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health needs nothing; admin routes
// need the bearer token; every other endpoint is charged to the caller's
// `ConsumerId` by the service.
//
// Success bodies are `{ data, asOf, source }`; failures are
// `{ error: { kind, message } }` with the status code taken from `kind`.
//
// CORS is configured permissively; the gateway only serves public data.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::admin::AdminToken;
use crate::api::consumer::ConsumerId;
use crate::app_state::AppState;
use crate::error::ApiError;
use crate::okx::{OrderBook, TickerSnapshot};
use crate::service::{
    BulkKlines, CachedKeys, CandleRange, Envelope, ExchangeStatus, InstrumentList, KlineData,
    LatestCandle, RateLimitReset, StoredCandles, TradingPairs,
};

const DEFAULT_BOOK_DEPTH: u32 = 20;
const DEFAULT_INTERVAL: &str = "1H";
const DEFAULT_KLINE_LIMIT: u32 = 100;
const DEFAULT_INSTRUMENT_TYPE: &str = "SWAP";

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS, request tracing and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/ticker/:symbol", get(ticker))
        .route("/api/v1/orderbook/:symbol", get(order_book))
        .route("/api/v1/kline/:symbol", get(kline))
        .route("/api/v1/instruments", get(instruments))
        .route("/api/v1/status", get(status))
        .route("/api/v1/trading-pairs", get(trading_pairs))
        .route("/api/v1/klines/bulk", post(bulk_klines))
        .route("/api/v1/candles", get(cached_keys))
        .route("/api/v1/candles/:symbol", get(stored_candles))
        .route("/api/v1/candles/:symbol/latest", get(latest_candle))
        .route(
            "/api/v1/admin/rate-limits/:namespace/:actor/reset",
            post(reset_rate_limit),
        )
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Malformed query strings get the same error body as every other bad input.
fn query<T>(q: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    q.map(|Query(inner)| inner)
        .map_err(|rejection| ApiError::invalid_argument(rejection.body_text()))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(inner)| inner)
        .map_err(|rejection| ApiError::invalid_argument(rejection.body_text()))
}

async fn not_found() -> ApiError {
    ApiError::not_found("no such endpoint")
}

// =============================================================================
// Health (no admission)
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Market data
// =============================================================================

async fn ticker(
    ConsumerId(consumer): ConsumerId,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> ApiResult<TickerSnapshot> {
    state.service.ticker(&consumer, &symbol).await.map(Json)
}

#[derive(Deserialize)]
struct DepthQuery {
    depth: Option<u32>,
}

async fn order_book(
    ConsumerId(consumer): ConsumerId,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    q: Result<Query<DepthQuery>, QueryRejection>,
) -> ApiResult<OrderBook> {
    let q = query(q)?;
    let depth = q.depth.unwrap_or(DEFAULT_BOOK_DEPTH);
    state.service.order_book(&consumer, &symbol, depth).await.map(Json)
}

#[derive(Deserialize)]
struct KlineQuery {
    interval: Option<String>,
    limit: Option<u32>,
}

async fn kline(
    ConsumerId(consumer): ConsumerId,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    q: Result<Query<KlineQuery>, QueryRejection>,
) -> ApiResult<KlineData> {
    let q = query(q)?;
    let interval = q.interval.as_deref().unwrap_or(DEFAULT_INTERVAL);
    let limit = q.limit.unwrap_or(DEFAULT_KLINE_LIMIT);
    state.service.kline(&consumer, &symbol, interval, limit).await.map(Json)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentsQuery {
    inst_type: Option<String>,
}

async fn instruments(
    ConsumerId(consumer): ConsumerId,
    State(state): State<Arc<AppState>>,
    q: Result<Query<InstrumentsQuery>, QueryRejection>,
) -> ApiResult<InstrumentList> {
    let q = query(q)?;
    let inst_type = q.inst_type.as_deref().unwrap_or(DEFAULT_INSTRUMENT_TYPE);
    state.service.instruments(&consumer, inst_type).await.map(Json)
}

async fn status(
    ConsumerId(consumer): ConsumerId,
    State(state): State<Arc<AppState>>,
) -> ApiResult<ExchangeStatus> {
    state.service.exchange_status(&consumer).await.map(Json)
}

async fn trading_pairs(
    ConsumerId(consumer): ConsumerId,
    State(state): State<Arc<AppState>>,
) -> ApiResult<TradingPairs> {
    state.service.trading_pairs(&consumer).await.map(Json)
}

#[derive(Deserialize)]
struct BulkKlineRequest {
    symbols: Vec<String>,
    #[serde(default, alias = "bar")]
    interval: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

async fn bulk_klines(
    ConsumerId(consumer): ConsumerId,
    State(state): State<Arc<AppState>>,
    body: Result<Json<BulkKlineRequest>, JsonRejection>,
) -> ApiResult<BulkKlines> {
    let req = json_body(body)?;
    let interval = req.interval.as_deref().unwrap_or(DEFAULT_INTERVAL);
    let limit = req.limit.unwrap_or(DEFAULT_KLINE_LIMIT);
    state
        .service
        .bulk_klines(&consumer, &req.symbols, interval, limit)
        .await
        .map(Json)
}

// =============================================================================
// Stored candles (never reach OKX)
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredQuery {
    interval: Option<String>,
    #[serde(alias = "start_time")]
    start_time: Option<i64>,
    #[serde(alias = "end_time")]
    end_time: Option<i64>,
    limit: Option<u32>,
}

async fn stored_candles(
    ConsumerId(consumer): ConsumerId,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    q: Result<Query<StoredQuery>, QueryRejection>,
) -> ApiResult<StoredCandles> {
    let q = query(q)?;
    let interval = q.interval.as_deref().unwrap_or(DEFAULT_INTERVAL);
    let range = CandleRange {
        start_time: q.start_time,
        end_time: q.end_time,
        limit: q.limit,
    };
    state
        .service
        .stored_candles(&consumer, &symbol, interval, range)
        .await
        .map(Json)
}

#[derive(Deserialize)]
struct IntervalQuery {
    interval: Option<String>,
}

async fn latest_candle(
    ConsumerId(consumer): ConsumerId,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    q: Result<Query<IntervalQuery>, QueryRejection>,
) -> ApiResult<LatestCandle> {
    let q = query(q)?;
    let interval = q.interval.as_deref().unwrap_or(DEFAULT_INTERVAL);
    state.service.latest_candle(&consumer, &symbol, interval).await.map(Json)
}

async fn cached_keys(
    ConsumerId(consumer): ConsumerId,
    State(state): State<Arc<AppState>>,
) -> ApiResult<CachedKeys> {
    state.service.cached_keys(&consumer).map(Json)
}

// =============================================================================
// Admin (bearer token, no admission)
// =============================================================================

async fn reset_rate_limit(
    _: AdminToken,
    State(state): State<Arc<AppState>>,
    Path((namespace, actor)): Path<(String, String)>,
) -> Result<Json<RateLimitReset>, ApiError> {
    state.service.reset_rate_limit(&namespace, &actor).map(Json)
}

// =============================================================================
// Tests
// =============================================================================
