use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use marketpulse_infra::jobs::{diagnose, JobStore};

use crate::app::dto::HealthResponse;
use crate::app::routes::jobs::blocking;
use crate::app::services::AppServices;

/// Queue health: 200 when healthy or degraded, 503 when unhealthy.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let window = services.stats_window;
    let thresholds = services.thresholds;
    let stats = match blocking(move || services.store.stats(window)).await {
        Ok(stats) => stats,
        Err(resp) => return resp,
    };

    let report = diagnose(&stats, &thresholds);
    let status = if report.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(HealthResponse { report, stats })).into_response()
}
