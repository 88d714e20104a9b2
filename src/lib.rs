pub mod bridge;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod error;
pub mod relay;
pub mod sandbox;
pub mod session;
pub mod signaling;
pub mod socket;

use std::sync::Arc;

use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};

use crate::session::AppState;

/// Build the coordinator's HTTP surface: signaling, catalog, health.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(session::ws_handler))
        .route("/apps", get(catalog::list_apps))
        .route("/health", get(health_check))
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
