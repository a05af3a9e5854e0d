//! HTTP and WebSocket API for auris-server

mod health;
mod jobs;
mod ws;

use crate::AppState;
use axum::routing::{get, post};
use axum::Router;

/// REST routes for job submission and queries
pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/api/jobs", post(jobs::submit_job).get(jobs::list_jobs))
        .route("/api/jobs/:job_id/status", get(jobs::job_status))
        .route("/api/jobs/:job_id/files", get(jobs::job_files))
        .route("/api/jobs/:job_id/download", get(jobs::job_download))
        .route("/api/jobs/:job_id/cancel", post(jobs::cancel_job))
}

/// WebSocket progress stream
pub fn ws_routes() -> Router<AppState> {
    Router::new().route("/ws/:job_id", get(ws::job_progress_ws))
}

/// Service health probe
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health::health))
}
