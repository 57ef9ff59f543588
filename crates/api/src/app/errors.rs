use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use crate::app::services::AcceptError;

pub fn accept_error_to_response(err: AcceptError) -> axum::response::Response {
    match &err {
        AcceptError::Invalid(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        AcceptError::SourceNotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        AcceptError::Duplicate(_) => json_error(StatusCode::CONFLICT, "conflict", err.to_string()),
        AcceptError::Runtime(_) => {
            tracing::error!(error = %err, "backup acceptance failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "runtime_error", err.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Body of a failed job's first observation: `{"error": "<detail>"}`.
pub fn job_failed(detail: impl Into<String>) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(json!({ "error": detail.into() })),
    )
        .into_response()
}
