pub mod health;
pub mod routes;
pub mod sse;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::{watch, Notify};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::models::AgentConfig;
use crate::orchestrator::Orchestrator;

/// Shared application state for the Axum server.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub poll_notify: Arc<Notify>,
    pub config: Arc<AgentConfig>,
    pub start_time: Instant,
    pub shutdown_tx: Option<watch::Sender<()>>,
}

/// Create the Axum router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/packages", get(routes::list_packages))
        .route("/api/packages/{job}", get(routes::get_package))
        .route("/api/jobs/{job}/install", post(routes::install_job))
        .route("/api/jobs/{job}/uninstall", post(routes::uninstall_job))
        .route("/api/jobs/{job}/status", get(routes::job_status))
        .route("/api/poll", post(routes::poll_now))
        .route("/api/events", get(sse::sse_handler))
        .route("/api/shutdown", post(routes::shutdown))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}
