use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::JobStatus;
use crate::models::prediction::{ErrorResponse, JobStatusResponse, SubmitResponse};
use crate::services::intake::IntakeError;
use crate::services::status::StatusError;

/// Error with a definite status code and a JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    job_id: Option<Uuid>,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            job_id: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.error,
            job_id: self.job_id,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<IntakeError> for ApiError {
    fn from(err: IntakeError) -> Self {
        match err {
            IntakeError::Validation(e) => ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
            IntakeError::Storage(e) => {
                tracing::error!(error = %e, "Failed to persist submitted job");
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "job store unavailable")
            }
            IntakeError::Enqueue { job_id, .. } => ApiError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                error: "job recorded but not queued; it will be picked up by reconciliation".into(),
                job_id: Some(job_id),
            },
        }
    }
}

impl From<StatusError> for ApiError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::NotFound(id) => ApiError {
                status: StatusCode::NOT_FOUND,
                error: "job not found".into(),
                job_id: Some(id),
            },
            StatusError::Storage(e) => {
                tracing::error!(error = %e, "Failed to read job status");
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "job store unavailable")
            }
        }
    }
}

/// POST /api/v1/predictions: submit features for asynchronous prediction.
pub async fn submit_prediction(
    State(state): State<AppState>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(payload) =
        payload.map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?;

    let job_id = state.intake.submit(payload).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: JobStatus::Pending.to_string(),
        }),
    ))
}

/// GET /api/v1/predictions/{job_id}: poll a job.
pub async fn get_prediction(
    State(state): State<AppState>,
    job_id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let Path(job_id) =
        job_id.map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?;

    let job = state.status.get_status(job_id).await?;
    Ok(Json(JobStatusResponse::from(job)))
}
