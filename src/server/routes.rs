use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::errors::InstallError;

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// HTTP status for an orchestrator error.
pub fn status_for(err: &InstallError) -> StatusCode {
    match err {
        InstallError::RemoteQuery(_) | InstallError::ArtifactDownload(_) => StatusCode::BAD_GATEWAY,
        InstallError::NotFound(_) => StatusCode::NOT_FOUND,
        InstallError::Validation(_) => StatusCode::BAD_REQUEST,
        InstallError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        InstallError::InstallerExecution(_)
        | InstallError::StoreIo(_)
        | InstallError::Notification(_)
        | InstallError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn install_error_response(err: &InstallError) -> Response {
    error_response(status_for(err), err.kind(), &err.to_string())
}

// ---------------------------------------------------------------------------
// Query params
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct InstallParams {
    pub build: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UninstallResponse {
    pub uninstalled: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/packages
pub async fn list_packages(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.orchestrator.store().load_all().await {
        Ok(packages) => (StatusCode::OK, Json(packages)).into_response(),
        Err(e) => {
            tracing::warn!("Failed to list packages: {}", e);
            install_error_response(&e)
        }
    }
}

/// GET /api/packages/{job}
pub async fn get_package(
    State(state): State<Arc<AppState>>,
    Path(job): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.store().find(&job).await {
        Ok(Some(package)) => (StatusCode::OK, Json(package)).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("No package installed for job '{}'", job),
        ),
        Err(e) => {
            tracing::warn!("Failed to fetch package '{}': {}", job, e);
            install_error_response(&e)
        }
    }
}

/// POST /api/jobs/{job}/install
pub async fn install_job(
    State(state): State<Arc<AppState>>,
    Path(job): Path<String>,
    Query(params): Query<InstallParams>,
) -> impl IntoResponse {
    tracing::info!(
        "Install of '{}' requested{}",
        job,
        params
            .build
            .map(|n| format!(" at build #{}", n))
            .unwrap_or_default()
    );

    let result = match params.build {
        Some(number) => state.orchestrator.install_build(&job, number).await,
        None => state.orchestrator.install_latest_successful_build(&job).await,
    };
    match result {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => install_error_response(&e),
    }
}

/// POST /api/jobs/{job}/uninstall
pub async fn uninstall_job(
    State(state): State<Arc<AppState>>,
    Path(job): Path<String>,
) -> impl IntoResponse {
    tracing::info!("Uninstall of '{}' requested", job);
    match state.orchestrator.uninstall_build(&job).await {
        Ok(uninstalled) => (StatusCode::OK, Json(UninstallResponse { uninstalled })).into_response(),
        Err(e) => install_error_response(&e),
    }
}

/// GET /api/jobs/{job}/status
pub async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(job): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.check(&job).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => {
            tracing::warn!("Status check of '{}' failed: {}", job, e);
            install_error_response(&e)
        }
    }
}

/// POST /api/poll
pub async fn poll_now(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::info!("Poll requested via API");
    state.poll_notify.notify_one();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "message": "Poll scheduled",
        })),
    )
}

/// POST /api/shutdown
pub async fn shutdown(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested");

    if let Some(ref tx) = state.shutdown_tx {
        let _ = tx.send(());
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "message": "Shutdown initiated",
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (InstallError::RemoteQuery("x".into()), StatusCode::BAD_GATEWAY),
            (InstallError::ArtifactDownload("x".into()), StatusCode::BAD_GATEWAY),
            (InstallError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (InstallError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (InstallError::Timeout("x".into()), StatusCode::GATEWAY_TIMEOUT),
            (InstallError::StoreIo("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                InstallError::InstallerExecution("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(status_for(&err), expected, "{:?}", err);
        }
    }
}
