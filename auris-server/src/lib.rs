//! auris-server library interface
//!
//! Exposes the job orchestration core (store, bus, pipeline, manager) and
//! the HTTP/WebSocket API for the binary and for integration testing.

pub mod api;
pub mod bus;
pub mod db;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod models;
pub mod package;
pub mod pipeline;
pub mod store;

pub use crate::error::{ApiError, ApiResult};

use auris_common::config::AurisConfig;
use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::manager::JobManager;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Job orchestration core
    pub manager: Arc<JobManager>,
    /// Resolved service configuration
    pub config: Arc<AurisConfig>,
    /// Service startup timestamp for uptime reporting
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(manager: Arc<JobManager>, config: Arc<AurisConfig>) -> Self {
        Self {
            manager,
            config,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::job_routes())
        .merge(api::ws_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
