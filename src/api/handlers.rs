use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use log::{info, warn};
use serde::Serialize;

use crate::errors::FeedError;
use crate::feed::{ConnectionState, FeedConnector};
use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct ApiState {
    pub feed: FeedConnector,
    pub registry: SessionRegistry,
}

#[derive(Debug, Serialize)]
pub struct FeedResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatusResponse {
    pub state: ConnectionState,
    pub ticker: Option<String>,
    pub connected: bool,
    pub last_error: Option<String>,
    pub active_sessions: usize,
}

// connect/disconnect only fail synchronously; link failures surface as
// `lastError` on the status endpoint.
fn feed_error(e: FeedError) -> (StatusCode, Json<FeedResponse>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(FeedResponse {
            success: false,
            message: e.to_string(),
        }),
    )
}

// POST /api/feed/connect/:ticker - Connect the upstream feed for a ticker
pub async fn connect_feed(
    State(state): State<ApiState>,
    Path(ticker): Path<String>,
) -> Result<Json<FeedResponse>, (StatusCode, Json<FeedResponse>)> {
    let ticker = ticker.trim().to_string();
    if ticker.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(FeedResponse {
                success: false,
                message: "Ticker is required".to_string(),
            }),
        ));
    }

    state.feed.connect(&ticker).map_err(|e| {
        warn!("Feed connect for {} rejected: {}", ticker, e);
        feed_error(e)
    })?;

    info!("Feed connect requested for ticker: {}", ticker);
    Ok(Json(FeedResponse {
        success: true,
        message: format!("Connecting to KIS WebSocket for ticker: {}", ticker),
    }))
}

// POST /api/feed/disconnect - Disconnect the upstream feed
pub async fn disconnect_feed(
    State(state): State<ApiState>,
) -> Result<Json<FeedResponse>, (StatusCode, Json<FeedResponse>)> {
    state.feed.disconnect().map_err(feed_error)?;

    info!("Feed disconnect requested");
    Ok(Json(FeedResponse {
        success: true,
        message: "Disconnected from KIS WebSocket".to_string(),
    }))
}

// GET /api/feed/status - Current feed state and session count
pub async fn feed_status(State(state): State<ApiState>) -> Json<FeedStatusResponse> {
    let status = state.feed.status();
    Json(FeedStatusResponse {
        state: status.state,
        ticker: status.ticker,
        connected: state.feed.is_connected(),
        last_error: status.last_error.map(|e| e.to_string()),
        active_sessions: state.registry.count(),
    })
}

// GET /api/health - Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "kis_feed_gateway",
        "timestamp": chrono::Utc::now()
    }))
}

pub fn create_api_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/feed/connect/:ticker", post(connect_feed))
        .route("/feed/disconnect", post(disconnect_feed))
        .route("/feed/status", get(feed_status))
        .with_state(state);

    Router::new().nest("/api", api_routes)
}
