//! Job API Handlers
//!
//! HTTP endpoints for job lifecycle management.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use dumper_core::domain::job::Job;
use dumper_core::dto::job::{
    AdvanceStage, CancelResponse, ClaimJob, EnqueueJob, ExtendLease, FinishJob, LeaseStatus,
    ListJobsQuery, SetDeviceInfo, SetRepositoryInfo,
};
use dumper_core::dto::progress::ProgressBatch;
use sqlx::PgPool;
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::service::job_service;

// =============================================================================
// Submission and Inspection Endpoints
// =============================================================================

/// POST /job
/// Queue a new dump job
pub async fn enqueue_job(
    State(pool): State<PgPool>,
    Json(req): Json<EnqueueJob>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    tracing::info!("Enqueueing job for URL: {}", req.url);

    let job = job_service::enqueue_job(&pool, req).await?;

    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /job/{id}
/// Get job details by ID, including the progress log
pub async fn get_job(State(pool): State<PgPool>, Path(id): Path<Uuid>) -> ApiResult<Json<Job>> {
    tracing::debug!("Getting job: {}", id);

    let job = job_service::get_job(&pool, id).await?;

    Ok(Json(job))
}

/// GET /job/list
/// List jobs
///
/// Query parameters:
/// - `stage` (optional): only jobs currently in this stage
pub async fn list_jobs(
    State(pool): State<PgPool>,
    Query(params): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    match params.stage {
        Some(stage) => tracing::debug!("Listing jobs in stage: {}", stage),
        None => tracing::debug!("Listing all jobs"),
    }

    let jobs = job_service::list_jobs(&pool, params.stage).await?;

    Ok(Json(jobs))
}

/// POST /job/{id}/cancel
/// Cancel a queued job or flag a running one
pub async fn cancel_job(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CancelResponse>> {
    tracing::info!("Cancelling job: {}", id);

    let response = job_service::cancel_job(&pool, id).await?;

    Ok(Json(response))
}

// =============================================================================
// Worker Endpoints
// =============================================================================

/// POST /job/claim
/// Lease the oldest queued job; 204 when nothing is queued
pub async fn claim_job(
    State(pool): State<PgPool>,
    Json(req): Json<ClaimJob>,
) -> ApiResult<Response> {
    let claimed = job_service::claim_next_job(&pool, &req.worker_id, req.lease_seconds).await?;

    Ok(match claimed {
        Some(job) => Json(job).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// POST /job/{id}/lease
/// Heartbeat from the worker holding the job
pub async fn extend_lease(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
    Json(req): Json<ExtendLease>,
) -> ApiResult<Json<LeaseStatus>> {
    tracing::debug!("Worker {} extending lease on job {}", req.worker_id, id);

    let status = job_service::extend_lease(&pool, id, &req.worker_id, req.lease_seconds).await?;

    Ok(Json(status))
}

/// POST /job/{id}/progress
/// Append entries to the progress log
pub async fn append_progress(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
    Json(batch): Json<ProgressBatch>,
) -> ApiResult<StatusCode> {
    tracing::debug!("Adding {} progress entries for job: {}", batch.entries.len(), id);

    job_service::append_progress(&pool, id, &batch.worker_id, batch.entries).await?;

    Ok(StatusCode::CREATED)
}

/// POST /job/{id}/stage
/// Move the job to the next (or the same) stage
pub async fn advance_stage(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
    Json(req): Json<AdvanceStage>,
) -> ApiResult<Json<Job>> {
    let job = job_service::advance_stage(&pool, id, &req.worker_id, req.stage).await?;

    Ok(Json(job))
}

/// PUT /job/{id}/device
/// Record device identity (accepted once)
pub async fn set_device_info(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
    Json(req): Json<SetDeviceInfo>,
) -> ApiResult<StatusCode> {
    job_service::set_device_info(&pool, id, &req.worker_id, req.info).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// PUT /job/{id}/repository
/// Record the publication target (accepted once)
pub async fn set_repository_info(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
    Json(req): Json<SetRepositoryInfo>,
) -> ApiResult<StatusCode> {
    job_service::set_repository_info(&pool, id, &req.worker_id, req.info).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /job/{id}/finish
/// Record the terminal outcome (accepted once)
pub async fn finish_job(
    State(pool): State<PgPool>,
    Path(id): Path<Uuid>,
    Json(req): Json<FinishJob>,
) -> ApiResult<Json<Job>> {
    tracing::info!(
        "Worker {} finishing job {} as {}",
        req.worker_id,
        id,
        req.outcome.terminal_stage()
    );

    let job = job_service::finish_job(&pool, id, &req.worker_id, req.outcome).await?;

    Ok(Json(job))
}
