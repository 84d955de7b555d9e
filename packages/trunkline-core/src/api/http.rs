//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to services.

use axum::extract::State;
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::ws::ws_handler;
use crate::api::AppState;
use crate::protocol_constants::SERVICE_ID;

/// Builds the router: the subscriber socket plus a health probe.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", any(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Liveness probe, also used by operators to eyeball the subscriber count.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "service": SERVICE_ID,
        "version": env!("CARGO_PKG_VERSION"),
        "subscribers": state.hub.subscriber_count(),
        "controlChannels": state.tracker.control_channels().len(),
        "activeCalls": state.tracker.active_calls().len(),
    }))
}
