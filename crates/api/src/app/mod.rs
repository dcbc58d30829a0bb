//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store selection, workers, reaper and producers
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: services::AppServices) -> Router {
    routes::router().layer(Extension(Arc::new(services)))
}
