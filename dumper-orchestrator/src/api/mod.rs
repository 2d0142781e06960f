//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod job;

use axum::{
    Router,
    routing::{get, post, put},
};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

/// Create the main API router with all endpoints
pub fn create_router(pool: PgPool) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Submission and inspection
        .route("/job", post(job::enqueue_job))
        .route("/job/list", get(job::list_jobs))
        .route("/job/{id}", get(job::get_job))
        .route("/job/{id}/cancel", post(job::cancel_job))
        // Worker endpoints
        .route("/job/claim", post(job::claim_job))
        .route("/job/{id}/lease", post(job::extend_lease))
        .route("/job/{id}/progress", post(job::append_progress))
        .route("/job/{id}/stage", post(job::advance_stage))
        .route("/job/{id}/device", put(job::set_device_info))
        .route("/job/{id}/repository", put(job::set_repository_info))
        .route("/job/{id}/finish", post(job::finish_job))
        // Add state and middleware
        .with_state(pool)
        .layer(TraceLayer::new_for_http())
}
