use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use marketpulse_core::{CoreError, JobStatus};
use marketpulse_infra::jobs::{JobStoreError, QueueClientError};

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::Invalid(CoreError::Validation(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        JobStoreError::Invalid(e) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invalid_request", e.to_string())
        }
        JobStoreError::AlreadyExists(id) => {
            json_error(StatusCode::CONFLICT, "conflict", format!("job {id} already exists"))
        }
        JobStoreError::Corrupt(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "corrupt_job", msg)
        }
        JobStoreError::Storage(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_error", msg)
        }
    }
}

pub fn queue_error_to_response(err: QueueClientError) -> axum::response::Response {
    match err {
        QueueClientError::Payload(e) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_payload", e.to_string())
        }
        QueueClientError::Store(e) => store_error_to_response(e),
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

pub fn parse_status(s: &str) -> Result<JobStatus, axum::response::Response> {
    s.parse::<JobStatus>().map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_status",
            "status must be one of: pending, processing, completed, failed, retry",
        )
    })
}
