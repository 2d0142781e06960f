//! Job Service
//!
//! Business logic for the job lifecycle. Every mutation loads the row with
//! `FOR UPDATE`, applies the shared state machine from `dumper-core` and
//! writes the result back inside the same transaction.

use chrono::{DateTime, Utc};
use dumper_core::domain::device::{DeviceInfo, RepositoryInfo};
use dumper_core::domain::error::{ErrorContext, ErrorKind};
use dumper_core::domain::job::{CancelEffect, Job, JobOptions, JobOutcome, JobStage, TransitionError};
use dumper_core::domain::progress::ProgressEntry;
use dumper_core::dto::job::{CancelResponse, EnqueueJob, LeaseStatus};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::repository::{job_repository, progress_repository};

/// Longest lease a worker may request in one call
pub const MAX_LEASE_SECONDS: u64 = 24 * 60 * 60;

/// Service error type
#[derive(Debug)]
pub enum JobError {
    NotFound(Uuid),
    /// The URL already has an active or completed job
    Duplicate { url: String, existing: Uuid },
    /// The caller does not hold the job's lease
    NotOwner { job_id: Uuid, worker_id: String },
    Transition(TransitionError),
    ValidationError(String),
    DatabaseError(sqlx::Error),
}

impl From<sqlx::Error> for JobError {
    fn from(err: sqlx::Error) -> Self {
        JobError::DatabaseError(err)
    }
}

impl From<TransitionError> for JobError {
    fn from(err: TransitionError) -> Self {
        JobError::Transition(err)
    }
}

// =============================================================================
// Submission and Inspection
// =============================================================================

/// Create and queue a new job
pub async fn enqueue_job(pool: &PgPool, req: EnqueueJob) -> Result<Job, JobError> {
    let url = req.url.trim().to_string();
    if url.is_empty() {
        return Err(JobError::ValidationError("URL must not be empty".to_string()));
    }

    let mut tx = pool.begin().await?;

    job_repository::lock_url(&mut *tx, &url).await?;
    let existing = job_repository::find_blocking_by_url(&mut *tx, &url).await?;
    check_duplicate(&url, existing.as_ref(), req.options)?;

    let job = Job::new(
        Uuid::new_v4(),
        url,
        req.options,
        req.notification_context,
        Utc::now(),
    );
    job_repository::insert(&mut *tx, &job).await?;
    tx.commit().await?;

    tracing::info!("Job queued: {} for {}", job.job_id, job.url);

    Ok(job)
}

/// Get a job by ID, including its progress log
pub async fn get_job(pool: &PgPool, id: Uuid) -> Result<Job, JobError> {
    let mut job = job_repository::find_by_id(pool, id)
        .await?
        .ok_or(JobError::NotFound(id))?;

    job.progress_log = progress_repository::find_by_job(pool, id).await?;

    Ok(job)
}

/// List jobs, optionally filtered by stage
///
/// Listings omit progress logs; fetch a single job to read them.
pub async fn list_jobs(pool: &PgPool, stage: Option<JobStage>) -> Result<Vec<Job>, JobError> {
    let jobs = job_repository::list(pool, stage).await?;
    Ok(jobs)
}

/// Request cancellation of a job
pub async fn cancel_job(pool: &PgPool, id: Uuid) -> Result<CancelResponse, JobError> {
    let mut tx = pool.begin().await?;
    let mut job = lock_job(&mut *tx, id).await?;

    let now = Utc::now();
    let effect = job.request_cancel(now)?;
    job_repository::update(&mut *tx, &job, None).await?;
    if matches!(effect, CancelEffect::Cancelled) {
        progress_repository::add_entries(
            &mut *tx,
            id,
            &[ProgressEntry::info(JobStage::Cancelled, "Cancelled before a worker picked it up")],
        )
        .await?;
    }
    tx.commit().await?;

    tracing::info!("Cancel requested for job {}: {:?}", id, effect);

    Ok(CancelResponse { effect, job })
}

// =============================================================================
// Worker Operations
// =============================================================================

/// Lease the oldest queued job to `worker_id`
pub async fn claim_next_job(
    pool: &PgPool,
    worker_id: &str,
    lease_seconds: u64,
) -> Result<Option<Job>, JobError> {
    validate_worker_id(worker_id)?;
    let lease = lease_deadline(Utc::now(), lease_seconds)?;

    let mut tx = pool.begin().await?;
    let Some(mut job) = job_repository::lock_next_queued(&mut *tx).await? else {
        return Ok(None);
    };

    job.worker_id = Some(worker_id.to_string());
    job.started_at = Some(Utc::now());
    job_repository::update(&mut *tx, &job, Some(lease)).await?;
    tx.commit().await?;

    tracing::info!("Job {} claimed by worker {}", job.job_id, worker_id);

    Ok(Some(job))
}

/// Extend the lease a worker holds on a job
pub async fn extend_lease(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
    lease_seconds: u64,
) -> Result<LeaseStatus, JobError> {
    let lease = lease_deadline(Utc::now(), lease_seconds)?;

    match job_repository::extend_lease(pool, id, worker_id, lease).await? {
        Some(cancel_requested) => Ok(LeaseStatus { cancel_requested }),
        None => {
            // Distinguish a missing job from a lease held by someone else
            let job = job_repository::find_by_id(pool, id)
                .await?
                .ok_or(JobError::NotFound(id))?;
            if job.is_terminal() {
                return Err(TransitionError::AlreadyTerminal(job.stage).into());
            }
            Err(JobError::NotOwner {
                job_id: id,
                worker_id: worker_id.to_string(),
            })
        }
    }
}

/// Move a job to a non-terminal stage
pub async fn advance_stage(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
    stage: JobStage,
) -> Result<Job, JobError> {
    let mut tx = pool.begin().await?;
    let mut job = lock_job(&mut *tx, id).await?;
    ensure_owner(&job, worker_id)?;

    let transition = job.advance(stage)?;
    job_repository::update(&mut *tx, &job, None).await?;
    tx.commit().await?;

    tracing::info!(
        "Job {} {:?} to {} (attempt {})",
        id,
        transition,
        job.stage,
        job.stage_attempts
    );

    Ok(job)
}

/// Record the device identity for a job
pub async fn set_device_info(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
    info: DeviceInfo,
) -> Result<(), JobError> {
    let mut tx = pool.begin().await?;
    let mut job = lock_job(&mut *tx, id).await?;
    ensure_writer(&job, worker_id)?;

    job.set_device_info(info)?;
    job_repository::update(&mut *tx, &job, None).await?;
    tx.commit().await?;

    tracing::debug!("Device info recorded for job {}", id);
    Ok(())
}

/// Record the publication target for a job
pub async fn set_repository_info(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
    info: RepositoryInfo,
) -> Result<(), JobError> {
    let mut tx = pool.begin().await?;
    let mut job = lock_job(&mut *tx, id).await?;
    ensure_writer(&job, worker_id)?;

    job.set_repository_info(info)?;
    job_repository::update(&mut *tx, &job, None).await?;
    tx.commit().await?;

    tracing::debug!("Repository info recorded for job {}", id);
    Ok(())
}

/// Move a job to its terminal stage
pub async fn finish_job(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
    outcome: JobOutcome,
) -> Result<Job, JobError> {
    let mut tx = pool.begin().await?;
    let mut job = lock_job(&mut *tx, id).await?;
    ensure_owner(&job, worker_id)?;

    job.finish(&outcome, Utc::now())?;
    job_repository::update(&mut *tx, &job, None).await?;
    tx.commit().await?;

    tracing::info!("Job {} finished: {}", id, job.stage);

    Ok(job)
}

/// Append entries to the progress log of a job owned by `worker_id`
///
/// Entries are still accepted after the job turned terminal so the last
/// batch of a run is not lost, but only from the worker that ran it.
pub async fn append_progress(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
    entries: Vec<ProgressEntry>,
) -> Result<(), JobError> {
    validate_progress(&entries)?;
    if entries.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    let job = lock_job(&mut *tx, id).await?;
    ensure_owner(&job, worker_id)?;
    progress_repository::add_entries(&mut *tx, id, &entries).await?;
    tx.commit().await?;

    tracing::debug!("Added {} progress entries for job {}", entries.len(), id);
    Ok(())
}

// =============================================================================
// Maintenance
// =============================================================================

/// Fail every active job whose worker stopped renewing its lease
pub async fn expire_leases(pool: &PgPool) -> Result<u64, JobError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let jobs = job_repository::lock_expired_leases(&mut *tx, now).await?;

    let mut expired = 0;
    for mut job in jobs {
        let message = format!(
            "Lease held by {} expired",
            job.worker_id.as_deref().unwrap_or("unknown worker")
        );
        let outcome = JobOutcome::Failed {
            error: ErrorContext::new(job.stage, ErrorKind::Timeout, message.clone()),
        };
        let stage = job.stage;

        if let Err(e) = job.finish(&outcome, now) {
            tracing::warn!("Cannot expire job {}: {}", job.job_id, e);
            continue;
        }
        job_repository::update(&mut *tx, &job, None).await?;
        progress_repository::add_entries(&mut *tx, job.job_id, &[ProgressEntry::error(stage, message)])
            .await?;
        expired += 1;
    }

    tx.commit().await?;
    Ok(expired)
}

/// Delete jobs whose retention window has passed
pub async fn purge_expired(pool: &PgPool) -> Result<u64, JobError> {
    let purged = job_repository::delete_expired(pool, Utc::now()).await?;
    Ok(purged)
}

// =============================================================================
// Validation
// =============================================================================

async fn lock_job(conn: &mut PgConnection, id: Uuid) -> Result<Job, JobError> {
    job_repository::find_by_id_for_update(conn, id)
        .await?
        .ok_or(JobError::NotFound(id))
}

fn check_duplicate(url: &str, existing: Option<&Job>, options: JobOptions) -> Result<(), JobError> {
    match existing {
        Some(job) if !options.force_redump => Err(JobError::Duplicate {
            url: url.to_string(),
            existing: job.job_id,
        }),
        _ => Ok(()),
    }
}

fn ensure_owner(job: &Job, worker_id: &str) -> Result<(), JobError> {
    if job.worker_id.as_deref() == Some(worker_id) {
        Ok(())
    } else {
        Err(JobError::NotOwner {
            job_id: job.job_id,
            worker_id: worker_id.to_string(),
        })
    }
}

fn ensure_active(job: &Job) -> Result<(), JobError> {
    if job.is_terminal() {
        return Err(TransitionError::AlreadyTerminal(job.stage).into());
    }
    Ok(())
}

/// Metadata writes need an active job held by the caller
fn ensure_writer(job: &Job, worker_id: &str) -> Result<(), JobError> {
    ensure_active(job)?;
    ensure_owner(job, worker_id)
}

fn validate_worker_id(worker_id: &str) -> Result<(), JobError> {
    if worker_id.trim().is_empty() {
        return Err(JobError::ValidationError(
            "worker_id must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn lease_deadline(now: DateTime<Utc>, lease_seconds: u64) -> Result<DateTime<Utc>, JobError> {
    if lease_seconds == 0 || lease_seconds > MAX_LEASE_SECONDS {
        return Err(JobError::ValidationError(format!(
            "lease_seconds must be between 1 and {}",
            MAX_LEASE_SECONDS
        )));
    }
    // Bounded above, so the cast cannot overflow
    Ok(now + chrono::Duration::seconds(lease_seconds as i64))
}

fn validate_progress(entries: &[ProgressEntry]) -> Result<(), JobError> {
    if entries.len() > 1000 {
        return Err(JobError::ValidationError(
            "At most 1000 progress entries per batch".to_string(),
        ));
    }
    if entries.iter().any(|e| e.message.trim().is_empty()) {
        return Err(JobError::ValidationError(
            "Progress messages must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dumper_core::domain::job::NotificationContext;

    fn job_owned_by(worker: Option<&str>) -> Job {
        let mut job = Job::new(
            Uuid::new_v4(),
            "https://example.com/fw.zip".to_string(),
            JobOptions::default(),
            NotificationContext::default(),
            Utc::now(),
        );
        job.worker_id = worker.map(str::to_string);
        job
    }

    #[test]
    fn test_duplicate_url_rejected_without_force() {
        let existing = job_owned_by(None);
        let result = check_duplicate(&existing.url, Some(&existing), JobOptions::default());
        assert!(matches!(result, Err(JobError::Duplicate { existing: id, .. }) if id == existing.job_id));
    }

    #[test]
    fn test_duplicate_url_allowed_with_force() {
        let existing = job_owned_by(None);
        let options = JobOptions {
            force_redump: true,
            ..JobOptions::default()
        };
        assert!(check_duplicate(&existing.url, Some(&existing), options).is_ok());
        assert!(check_duplicate("https://other", None, JobOptions::default()).is_ok());
    }

    #[test]
    fn test_ensure_owner() {
        let job = job_owned_by(Some("worker-a"));
        assert!(ensure_owner(&job, "worker-a").is_ok());
        assert!(matches!(
            ensure_owner(&job, "worker-b"),
            Err(JobError::NotOwner { .. })
        ));
        assert!(ensure_owner(&job_owned_by(None), "worker-a").is_err());
    }

    #[test]
    fn test_ensure_active_rejects_terminal_jobs() {
        let mut job = job_owned_by(Some("worker-a"));
        assert!(ensure_active(&job).is_ok());
        job.finish(&JobOutcome::Cancelled, Utc::now()).unwrap();
        assert!(matches!(
            ensure_active(&job),
            Err(JobError::Transition(TransitionError::AlreadyTerminal(JobStage::Cancelled)))
        ));
    }

    #[test]
    fn test_metadata_writes_require_the_owning_worker() {
        let job = job_owned_by(Some("worker-a"));
        assert!(ensure_writer(&job, "worker-a").is_ok());
        assert!(matches!(
            ensure_writer(&job, "worker-b"),
            Err(JobError::NotOwner { worker_id, .. }) if worker_id == "worker-b"
        ));
        assert!(matches!(
            ensure_writer(&job_owned_by(None), "worker-a"),
            Err(JobError::NotOwner { .. })
        ));
    }

    #[test]
    fn test_metadata_writes_rejected_after_finish() {
        let mut job = job_owned_by(Some("worker-a"));
        job.finish(&JobOutcome::Cancelled, Utc::now()).unwrap();
        assert!(matches!(
            ensure_writer(&job, "worker-a"),
            Err(JobError::Transition(TransitionError::AlreadyTerminal(_)))
        ));
    }

    #[test]
    fn test_late_progress_only_from_the_owner() {
        let mut job = job_owned_by(Some("worker-a"));
        job.finish(&JobOutcome::Cancelled, Utc::now()).unwrap();
        assert!(ensure_owner(&job, "worker-a").is_ok());
        assert!(matches!(
            ensure_owner(&job, "worker-b"),
            Err(JobError::NotOwner { .. })
        ));
    }

    #[test]
    fn test_lease_deadline_bounds() {
        let now = Utc::now();
        assert!(lease_deadline(now, 0).is_err());
        assert!(lease_deadline(now, MAX_LEASE_SECONDS + 1).is_err());
        assert_eq!(
            lease_deadline(now, 300).unwrap(),
            now + chrono::Duration::seconds(300)
        );
    }

    #[test]
    fn test_validate_progress() {
        assert!(validate_progress(&[]).is_ok());
        assert!(validate_progress(&[ProgressEntry::info(JobStage::Downloading, "ok")]).is_ok());
        assert!(validate_progress(&[ProgressEntry::info(JobStage::Downloading, "  ")]).is_err());
    }

    #[tokio::test]
    #[ignore = "requires a Postgres database in DATABASE_URL"]
    async fn test_concurrent_enqueues_of_one_url_create_one_job() {
        let database_url = std::env::var("DATABASE_URL").unwrap();
        let pool = crate::db::create_pool(&database_url).await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();

        let req = EnqueueJob {
            url: format!("https://example.com/{}.zip", Uuid::new_v4()),
            options: JobOptions::default(),
            notification_context: NotificationContext::default(),
        };

        let (first, second) = tokio::join!(
            enqueue_job(&pool, req.clone()),
            enqueue_job(&pool, req.clone())
        );

        let created = [&first, &second].iter().filter(|r| r.is_ok()).count();
        assert_eq!(created, 1);
        assert!(
            matches!(first, Err(JobError::Duplicate { .. }))
                || matches!(second, Err(JobError::Duplicate { .. }))
        );
    }

    #[test]
    fn test_validate_worker_id() {
        assert!(validate_worker_id("worker-1").is_ok());
        assert!(validate_worker_id(" ").is_err());
    }
}
