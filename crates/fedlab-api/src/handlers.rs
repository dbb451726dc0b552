//! REST API handlers.
//!
//! Reads go straight to the record store; state changes go through the
//! orchestrator. Every JSON response uses the same envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::error;

use fedlab_orchestrator::OrchestratorError;
use fedlab_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn store_error(e: &StateError) -> Response {
    match e {
        StateError::Invalid(msg) => error_response(msg, StatusCode::BAD_REQUEST),
        other => {
            error!(error = %other, "record store failure");
            error_response(&other.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub(crate) fn orchestrator_error(e: &OrchestratorError) -> Response {
    let status = match e {
        OrchestratorError::NotFound(_) | OrchestratorError::CheckpointNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        OrchestratorError::AlreadyRunning(_) | OrchestratorError::InvalidState { .. } => {
            StatusCode::CONFLICT
        }
        OrchestratorError::PathEscape(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::Store(inner) => return store_error(inner),
        OrchestratorError::Spawn(_) | OrchestratorError::Io(_) | OrchestratorError::Config(_) => {
            error!(error = %e, "orchestration failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&e.to_string(), status)
}

fn experiment_not_found(id: ExperimentId) -> Response {
    orchestrator_error(&OrchestratorError::NotFound(id))
}

/// Resolve the experiment first so list endpoints can tell "none" from "absent".
fn require_experiment(state: &ApiState, id: ExperimentId) -> Result<Experiment, Response> {
    match state.orchestrator.store().get_experiment(id) {
        Ok(Some(exp)) => Ok(exp),
        Ok(None) => Err(experiment_not_found(id)),
        Err(e) => Err(store_error(&e)),
    }
}

// ── Experiments ────────────────────────────────────────────────

/// GET /api/v1/experiments
pub async fn list_experiments(State(state): State<ApiState>) -> Response {
    match state.orchestrator.store().list_experiments() {
        Ok(experiments) => ApiResponse::ok(experiments).into_response(),
        Err(e) => store_error(&e),
    }
}

/// POST /api/v1/experiments
pub async fn create_experiment(
    State(state): State<ApiState>,
    Json(req): Json<NewExperiment>,
) -> Response {
    match state.orchestrator.store().insert_experiment(&req) {
        Ok(exp) => (StatusCode::CREATED, ApiResponse::ok(exp)).into_response(),
        Err(e) => store_error(&e),
    }
}

/// GET /api/v1/experiments/{id}
pub async fn get_experiment(State(state): State<ApiState>, Path(id): Path<ExperimentId>) -> Response {
    match require_experiment(&state, id) {
        Ok(exp) => ApiResponse::ok(exp).into_response(),
        Err(resp) => resp,
    }
}

/// DELETE /api/v1/experiments/{id}
pub async fn delete_experiment(
    State(state): State<ApiState>,
    Path(id): Path<ExperimentId>,
) -> Response {
    match state.orchestrator.delete(id).await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

// ── Lifecycle ──────────────────────────────────────────────────

#[derive(serde::Serialize)]
struct StartResponse {
    success: bool,
    experiment_id: ExperimentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
}

/// POST /api/v1/experiments/{id}/start
pub async fn start_experiment(
    State(state): State<ApiState>,
    Path(id): Path<ExperimentId>,
) -> Response {
    match state.orchestrator.start(id) {
        Ok(outcome) => Json(StartResponse {
            success: true,
            experiment_id: outcome.experiment_id,
            pid: outcome.pid,
        })
        .into_response(),
        Err(e) => orchestrator_error(&e),
    }
}

// ── Metrics & checkpoints ──────────────────────────────────────

/// GET /api/v1/experiments/{id}/metrics
pub async fn list_metrics(State(state): State<ApiState>, Path(id): Path<ExperimentId>) -> Response {
    if let Err(resp) = require_experiment(&state, id) {
        return resp;
    }
    match state.orchestrator.store().list_metrics(id) {
        Ok(metrics) => ApiResponse::ok(metrics).into_response(),
        Err(e) => store_error(&e),
    }
}

/// GET /api/v1/experiments/{id}/checkpoints
pub async fn list_checkpoints(
    State(state): State<ApiState>,
    Path(id): Path<ExperimentId>,
) -> Response {
    if let Err(resp) = require_experiment(&state, id) {
        return resp;
    }
    match state.orchestrator.store().list_checkpoints(id) {
        Ok(checkpoints) => ApiResponse::ok(checkpoints).into_response(),
        Err(e) => store_error(&e),
    }
}

/// GET /api/v1/experiments/{id}/checkpoints/{checkpoint_id}/download
pub async fn download_checkpoint(
    State(state): State<ApiState>,
    Path((id, checkpoint_id)): Path<(ExperimentId, i64)>,
) -> Response {
    match state.orchestrator.read_checkpoint(id, checkpoint_id).await {
        Ok(file) => {
            let disposition = format!(
                "attachment; filename=\"{}\"",
                file.file_name.replace(['"', '\\'], "_")
            );
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                file.bytes,
            )
                .into_response()
        }
        Err(e) => orchestrator_error(&e),
    }
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> Response {
    ApiResponse::ok("ok").into_response()
}
