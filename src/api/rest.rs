// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. There is no authentication: the
// dashboard is a read-mostly display and control commands only change what
// is being looked at.
//
// CORS is configured permissively so the front end can be served from any
// origin.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::control::{ControlCommand, Selection};
use crate::market_data::tickers::{page_rows, MarketRow};
use crate::types::Timeframe;

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
        .route("/api/v1/health", get(health))
        .route("/api/v1/view", get(view))
        .route("/api/v1/markets", get(markets))
        .route("/api/v1/prices", get(prices))
        .route("/api/v1/control/instrument", post(control_instrument))
        .route("/api/v1/control/timeframe", post(control_timeframe))
        .route("/api/v1/control/analysis", post(control_analysis))
        .route("/api/v1/control/page/next", post(control_next_page))
        .route("/api/v1/control/page/prev", post(control_prev_page))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}

// =============================================================================
// View
// =============================================================================

async fn view(State(state): State<Arc<AppState>>) -> Response {
    let view = state.dashboard.view();
    Json(view.as_ref()).into_response()
}

// =============================================================================
// Market table
// =============================================================================

#[derive(Deserialize)]
struct MarketsQuery {
    page: Option<usize>,
}

#[derive(Serialize)]
struct MarketsResponse<'a> {
    page: usize,
    page_count: usize,
    total_rows: usize,
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
    rows: &'a [MarketRow],
}

/// Rows of one page; defaults to the currently selected page.
async fn markets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MarketsQuery>,
) -> Response {
    let view = state.dashboard.view();
    let page = query
        .page
        .unwrap_or(view.pagination.page)
        .clamp(1, view.pagination.page_count.max(1));

    Json(MarketsResponse {
        page,
        page_count: view.pagination.page_count,
        total_rows: view.market_rows.len(),
        updated_at: view.market.updated_at,
        rows: page_rows(&view.market_rows, page, view.market.page_size),
    })
    .into_response()
}

// =============================================================================
// Latest prices
// =============================================================================

async fn prices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let quotes: serde_json::Map<String, serde_json::Value> = state
        .prices
        .snapshot()
        .into_iter()
        .map(|(symbol, quote)| (symbol, serde_json::json!(quote)))
        .collect();
    Json(quotes)
}

// =============================================================================
// Control
// =============================================================================

#[derive(Deserialize)]
struct SymbolRequest {
    symbol: String,
}

#[derive(Deserialize)]
struct TimeframeRequest {
    timeframe: Timeframe,
}

type ControlResult = Result<Json<Selection>, (StatusCode, Json<serde_json::Value>)>;

async fn apply(state: &AppState, command: ControlCommand) -> ControlResult {
    match state.dashboard.send(command.clone()).await {
        Ok(selection) => {
            info!(command = ?command, "control command applied via API");
            Ok(Json(selection))
        }
        Err(e) => Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("{e:#}") })),
        )),
    }
}

async fn control_instrument(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SymbolRequest>,
) -> ControlResult {
    let symbol = req.symbol.trim().to_uppercase();
    apply(&state, ControlCommand::SelectInstrument(symbol)).await
}

async fn control_timeframe(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TimeframeRequest>,
) -> ControlResult {
    apply(&state, ControlCommand::SelectTimeframe(req.timeframe)).await
}

async fn control_analysis(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SymbolRequest>,
) -> ControlResult {
    let symbol = req.symbol.trim().to_uppercase();
    apply(&state, ControlCommand::SelectAnalysis(symbol)).await
}

async fn control_next_page(State(state): State<Arc<AppState>>) -> ControlResult {
    apply(&state, ControlCommand::NextPage).await
}

async fn control_prev_page(State(state): State<Arc<AppState>>) -> ControlResult {
    apply(&state, ControlCommand::PrevPage).await
}
