//! HTTP front door.
//!
//! Maps requests onto [`JobController`] operations. The routes are thin:
//! every rule about job state lives in the controller.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::controller::JobController;
use crate::dispatcher::StepDispatcher;
use crate::error::{PipelineError, QueueError};
use crate::state_machine::{InitOutcome, JobConfig, JobState, Step};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<JobController>,
    pub dispatcher: Arc<StepDispatcher>,
}

/// Handler error rendered as `{error, code}` JSON.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Pipeline(err) => match err {
                PipelineError::UnknownStep(_)
                | PipelineError::InvalidJobId
                | PipelineError::InvalidConfig(_) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", err.to_string())
                }
                PipelineError::Queue(QueueError::Full) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "QUEUE_FULL",
                    err.to_string(),
                ),
                other => {
                    tracing::error!(error = %other, "Request failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
        };

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(create_job))
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/debug-run", post(debug_run))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobRequest {
    job_id: Option<String>,
    config: Option<JobConfig>,
}

/// `POST /jobs` starts a job, generating an id when none is given.
///
/// An empty body, or one that is not JSON at all, is treated as `{}`. JSON
/// that does not match the request shape is rejected.
async fn create_job(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    let request = parse_create_request(&body)?;

    let job_id = request
        .job_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let response = match state.controller.init(&job_id, request.config).await? {
        InitOutcome::Started(_) => (
            StatusCode::OK,
            Json(json!({ "status": "started", "jobId": job_id })),
        ),
        InitOutcome::AlreadyRunning(_) => (
            StatusCode::CONFLICT,
            Json(json!({ "status": "already-running", "jobId": job_id })),
        ),
    };
    Ok(response.into_response())
}

fn parse_create_request(body: &[u8]) -> Result<CreateJobRequest, PipelineError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(CreateJobRequest::default());
    }
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "Unreadable job request body, using defaults");
            return Ok(CreateJobRequest::default());
        }
    };
    serde_json::from_value(value).map_err(|e| PipelineError::InvalidConfig(e.to_string()))
}

/// `GET /jobs/{job_id}`: the job's current state.
async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<JobState>> {
    Ok(Json(state.controller.status(&job_id).await?))
}

#[derive(Debug, Deserialize)]
struct DebugRunParams {
    step: Option<String>,
}

/// `POST /jobs/{job_id}/debug-run?step=` runs one step synchronously,
/// bypassing the queue.
async fn debug_run(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(params): Query<DebugRunParams>,
) -> AppResult<Response> {
    let Some(step) = params.step else {
        return Err(AppError::BadRequest("step is required".into()));
    };
    let step: Step = step.parse()?;

    let run = state.dispatcher.run_step(&job_id, step).await?;
    let response = match run.error {
        None => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "jobId": job_id,
                "step": step,
                "outcome": run.outcome.label(),
            })),
        ),
        Some(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "error",
                "jobId": job_id,
                "step": step,
                "error": error,
            })),
        ),
    };
    Ok(response.into_response())
}
