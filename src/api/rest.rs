// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The only public endpoint is /health;
// everything else requires a bearer JWT with a `sub` claim (see auth.rs).
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AuthUser;
use crate::app_state::AppState;
use crate::error::ApiError;
use crate::manager::{BatchSummary, TraderStatus};
use crate::market_data::{Kline, KlineKey, MarketData};
use crate::repository::{SignalRecord, TraderRecord};
use crate::types::Timeframe;

/// Default and maximum number of klines returned by the klines endpoint.
const DEFAULT_KLINE_LIMIT: usize = 100;
const MAX_KLINE_LIMIT: usize = 1000;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/health", get(health))
        // ── Market data ─────────────────────────────────────────────
        .route("/api/v1/symbols", get(symbols))
        .route("/api/v1/klines/:symbol/:interval", get(klines))
        // ── Traders ─────────────────────────────────────────────────
        .route("/api/v1/traders", get(list_traders))
        .route("/api/v1/traders/active", get(active_traders))
        .route("/api/v1/traders/:id/status", get(trader_status))
        .route("/api/v1/traders/:id/start", post(start_trader))
        .route("/api/v1/traders/:id/stop", post(stop_trader))
        .route("/api/v1/traders/:id/reload", post(reload_trader))
        .route(
            "/api/v1/traders/:id/execute-immediate",
            post(execute_immediate),
        )
        // ── Signals & filters ───────────────────────────────────────
        .route("/api/v1/signals", post(insert_signal))
        .route("/api/v1/execute-filter", post(execute_filter))
        .route("/api/v1/validate-code", post(validate_code))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "version": state.config.version,
        "uptimeSeconds": state.uptime_seconds(),
    }))
}

// =============================================================================
// Market data
// =============================================================================

async fn symbols(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    let symbols = state.universe.symbols();
    Json(serde_json::json!({
        "count": symbols.len(),
        "symbols": symbols,
    }))
}

#[derive(Deserialize)]
struct KlinesQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct KlinesResponse {
    symbol: String,
    interval: String,
    klines: Vec<Kline>,
    count: usize,
}

async fn klines(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path((symbol, interval)): Path<(String, String)>,
    Query(query): Query<KlinesQuery>,
) -> Result<Json<KlinesResponse>, ApiError> {
    let timeframe = Timeframe::parse(&interval)
        .ok_or_else(|| ApiError::Validation(format!("unknown interval: {interval}")))?;
    let symbol = symbol.to_uppercase();

    let limit = query.limit.unwrap_or(DEFAULT_KLINE_LIMIT).min(MAX_KLINE_LIMIT);
    let klines = if limit == 0 {
        Vec::new()
    } else {
        state
            .cache
            .snapshot(&KlineKey::new(symbol.clone(), timeframe), limit)
            .as_ref()
            .clone()
    };

    Ok(Json(KlinesResponse {
        count: klines.len(),
        symbol,
        interval,
        klines,
    }))
}

// =============================================================================
// Traders
// =============================================================================

#[derive(Deserialize)]
struct ListTradersQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

#[derive(Serialize)]
struct TraderListResponse {
    traders: Vec<TraderRecord>,
    count: usize,
}

/// List a user's traders; without `userId`, list the built-in ones.
async fn list_traders(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTradersQuery>,
) -> Result<Json<TraderListResponse>, ApiError> {
    if let Some(user_id) = &query.user_id {
        if user_id != &auth.user_id && !auth.is_admin {
            return Err(ApiError::Forbidden(
                "cannot list another user's traders".to_string(),
            ));
        }
    }

    let traders = state
        .repo
        .list_traders(query.user_id.as_deref())
        .await
        .map_err(ApiError::from)?;

    Ok(Json(TraderListResponse {
        count: traders.len(),
        traders,
    }))
}

async fn active_traders(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
) -> Json<Vec<TraderStatus>> {
    Json(state.manager.active_traders(&auth))
}

async fn trader_status(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TraderStatus>, ApiError> {
    Ok(Json(state.manager.get_status(&id, &auth).await?))
}

async fn start_trader(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TraderStatus>, ApiError> {
    info!(trader_id = %id, user_id = %auth.user_id, "start requested");
    Ok(Json(state.manager.start(&id, &auth).await?))
}

async fn stop_trader(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TraderStatus>, ApiError> {
    info!(trader_id = %id, user_id = %auth.user_id, "stop requested");
    Ok(Json(state.manager.stop(&id, &auth).await?))
}

async fn reload_trader(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TraderStatus>, ApiError> {
    info!(trader_id = %id, user_id = %auth.user_id, "reload requested");
    Ok(Json(state.manager.reload(&id, &auth).await?))
}

async fn execute_immediate(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BatchSummary>, ApiError> {
    info!(trader_id = %id, user_id = %auth.user_id, "execute-immediate requested");
    Ok(Json(state.manager.execute_immediate(&id, &auth).await?))
}

// =============================================================================
// Signals (admin only)
// =============================================================================

async fn insert_signal(
    auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(signal): Json<SignalRecord>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !auth.is_admin {
        return Err(ApiError::Forbidden(
            "only admins may insert signals directly".to_string(),
        ));
    }
    state.manager.insert_signal_direct(&signal).await?;
    Ok(Json(serde_json::json!({ "inserted": true, "id": signal.id })))
}

// =============================================================================
// Transient filter execution (editor support)
// =============================================================================

#[derive(Deserialize)]
struct MarketDataSpec {
    symbol: String,
    timeframes: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ExecuteFilterRequest {
    code: String,
    #[serde(rename = "marketData")]
    market_data: MarketDataSpec,
}

#[derive(Serialize)]
struct ExecuteFilterResponse {
    matched: bool,
    symbol: String,
}

/// Run a transient snippet against live cache data for one symbol.
async fn execute_filter(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteFilterRequest>,
) -> Result<Json<ExecuteFilterResponse>, ApiError> {
    let symbol = req.market_data.symbol.to_uppercase();
    if symbol.is_empty() {
        return Err(ApiError::Validation("marketData.symbol is required".to_string()));
    }

    let timeframes: Vec<Timeframe> = match &req.market_data.timeframes {
        Some(raw) => {
            let mut parsed = Vec::with_capacity(raw.len());
            for tf in raw {
                parsed.push(Timeframe::parse(tf).ok_or_else(|| {
                    ApiError::Validation(format!("unknown timeframe: {tf}"))
                })?);
            }
            parsed
        }
        None => Timeframe::ALL.to_vec(),
    };

    let filter = state
        .runtime
        .compile(&req.code)
        .map_err(|e| ApiError::Compile(e.to_string()))?;

    let mut klines = HashMap::new();
    for tf in timeframes {
        klines.insert(
            tf,
            state
                .cache
                .snapshot(&KlineKey::new(symbol.clone(), tf), state.config.kline_window),
        );
    }
    let data = MarketData {
        symbol: symbol.clone(),
        ticker: state.universe.ticker(&symbol),
        klines,
    };

    let matched = state
        .runtime
        .execute(&filter, data, state.config.eval_timeout())
        .await
        .map_err(|e| ApiError::Validation(format!("filter execution failed: {e}")))?;

    Ok(Json(ExecuteFilterResponse { matched, symbol }))
}

#[derive(Deserialize)]
struct ValidateCodeRequest {
    code: String,
}

async fn validate_code(
    _auth: AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ValidateCodeRequest>,
) -> Json<serde_json::Value> {
    match state.runtime.validate(&req.code) {
        Ok(()) => Json(serde_json::json!({ "valid": true })),
        Err(e) => Json(serde_json::json!({ "valid": false, "error": e.to_string() })),
    }
}

// =============================================================================
// Tests
// =============================================================================
