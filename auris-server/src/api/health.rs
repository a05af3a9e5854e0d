//! Health probe

use axum::extract::State;
use axum::Json;
use chrono::Utc;

use crate::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let uptime = (Utc::now() - state.startup_time).num_seconds().max(0);
    Json(serde_json::json!({
        "status": "ok",
        "service": "auris-server",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
    }))
}
