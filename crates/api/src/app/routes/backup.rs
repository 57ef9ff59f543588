use std::sync::Arc;

use axum::{
    extract::{Extension, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};

use ctbackup_core::CorrelationId;
use ctbackup_infra::jobs::{JobOutcome, JobStatus};

use crate::app::services::{Accepted, AppServices};
use crate::app::{dto, errors};
use crate::context::{REQUEST_ID_HEADER, RequestContext};

/// `POST /backup`: accept a job; the request id becomes the job id.
pub async fn submit(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    body: Result<Json<dto::BackupRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "invalid_body",
                rejection.body_text(),
            );
        }
    };

    let spec = body.into_spec(services.default_destination());
    match services.accept(ctx.request_id().clone(), spec).await {
        Ok(Accepted::Pending(id)) => (
            StatusCode::ACCEPTED,
            Json(dto::AcceptedResponse {
                id,
                status: "processing",
            }),
        )
            .into_response(),
        Ok(Accepted::Finished(_, outcome)) => outcome_response(outcome),
        Err(e) => errors::accept_error_to_response(e),
    }
}

/// `GET /backup` with `Request-Id`: consume-on-read status poll.
pub async fn poll(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
) -> axum::response::Response {
    let Some(raw) = headers.get(REQUEST_ID_HEADER) else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "missing_request_id",
            "Request-Id header is required",
        );
    };

    let id: CorrelationId = match raw.to_str().ok().and_then(|v| v.parse().ok()) {
        Some(id) => id,
        None => return errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
    };

    match services.poll(&id) {
        JobStatus::NotFound => {
            errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found")
        }
        JobStatus::Processing => {
            (StatusCode::ACCEPTED, Json(dto::StatusResponse::PROCESSING)).into_response()
        }
        JobStatus::Finished(outcome) => outcome_response(outcome),
    }
}

/// `GET /backup/list`: ids currently tracked.
pub async fn list(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    (StatusCode::OK, Json(services.list())).into_response()
}

fn outcome_response(outcome: JobOutcome) -> axum::response::Response {
    match outcome {
        JobOutcome::Succeeded => (StatusCode::OK, Json(dto::StatusResponse::DONE)).into_response(),
        JobOutcome::Failed(detail) => errors::job_failed(detail),
    }
}
