use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use marketpulse_core::JobId;
use marketpulse_infra::jobs::{JobStore, JobStoreError};

use crate::app::dto::{EnqueueRequest, EnqueueResponse, ListJobsQuery};
use crate::app::errors::{self, json_error};
use crate::app::services::AppServices;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs).post(enqueue_job))
        .route("/stats", get(stats))
        .route("/:id", get(get_job))
}

/// Run a store call on the blocking pool; stores are synchronous.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, axum::response::Response>
where
    F: FnOnce() -> Result<T, JobStoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()))?
        .map_err(errors::store_error_to_response)
}

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let window = services.stats_window;
    match blocking(move || services.store.stats(window)).await {
        Ok(stats) => Json(stats).into_response(),
        Err(resp) => resp,
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListJobsQuery>,
) -> axum::response::Response {
    let status = match query.status.as_deref().map(errors::parse_status).transpose() {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);

    match blocking(move || services.store.list(status, limit)).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(resp) => resp,
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match id.parse::<JobId>() {
        Ok(id) => id,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };

    match blocking(move || services.store.get(id)).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        Err(resp) => resp,
    }
}

pub async fn enqueue_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(req): Json<EnqueueRequest>,
) -> axum::response::Response {
    let job = req.into_new_job();
    let queue = services.queue.clone();

    let result = tokio::task::spawn_blocking(move || queue.submit(job)).await;
    match result {
        Ok(Ok(id)) => (
            StatusCode::CREATED,
            Json(EnqueueResponse { id: id.to_string() }),
        )
            .into_response(),
        Ok(Err(e)) => errors::queue_error_to_response(e),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()),
    }
}
