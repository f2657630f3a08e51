use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub server_url: String,
    pub watched_jobs: Vec<String>,
    pub installed_packages: usize,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Health check");

    let installed_packages = match state.orchestrator.store().load_all().await {
        Ok(packages) => packages.len(),
        Err(e) => {
            tracing::warn!("Health check could not read the package store: {}", e);
            0
        }
    };

    let response = HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        server_url: state.config.server_url.clone(),
        watched_jobs: state.config.jobs.clone(),
        installed_packages,
    };

    (StatusCode::OK, Json(response))
}
