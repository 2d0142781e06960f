//! Job Repository
//!
//! Handles all database operations related to jobs. Reads accept any
//! executor; the read-modify-write helpers expect a connection that is part
//! of an open transaction so the `FOR UPDATE` locks hold until commit.

use chrono::{DateTime, Utc};
use dumper_core::domain::device::{DeviceInfo, RepositoryInfo};
use dumper_core::domain::error::ErrorContext;
use dumper_core::domain::job::{Job, JobOptions, JobStage, NotificationContext, TtlClass};
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor};
use uuid::Uuid;

const JOB_COLUMNS: &str = r#"
    id, url, options, notification_context, stage, stage_attempts,
    device_info, repository_info, error_context, worker_id, cancel_requested,
    created_at, started_at, completed_at, ttl_class
"#;

/// Stages that still hold a URL against re-enqueueing
const BLOCKING_STAGES: [&str; 6] = [
    "queued",
    "downloading",
    "extracting",
    "analyzing",
    "publishing",
    "completed",
];

/// Insert a freshly queued job
pub async fn insert<'e, E>(executor: E, job: &Job) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO jobs (id, url, options, notification_context, stage, stage_attempts,
                          cancel_requested, created_at, ttl_class, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(job.job_id)
    .bind(&job.url)
    .bind(Json(&job.options))
    .bind(Json(&job.notification_context))
    .bind(job.stage.as_str())
    .bind(attempts_to_db(job.stage_attempts))
    .bind(job.cancel_requested)
    .bind(job.created_at)
    .bind(job.ttl_class.as_str())
    .bind(job.expires_at())
    .execute(executor)
    .await?;

    Ok(())
}

/// Find a job by ID (without its progress log)
pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Job>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let query = format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS);
    let row = sqlx::query_as::<_, JobRow>(&query)
        .bind(id)
        .fetch_optional(executor)
        .await?;

    Ok(row.map(|r| r.into()))
}

/// Find a job by ID and lock its row for the rest of the transaction
pub async fn find_by_id_for_update(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<Job>, sqlx::Error> {
    let query = format!("SELECT {} FROM jobs WHERE id = $1 FOR UPDATE", JOB_COLUMNS);
    let row = sqlx::query_as::<_, JobRow>(&query)
        .bind(id)
        .fetch_optional(conn)
        .await?;

    Ok(row.map(|r| r.into()))
}

/// List jobs, newest first, optionally restricted to one stage
pub async fn list<'e, E>(executor: E, stage: Option<JobStage>) -> Result<Vec<Job>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let rows = match stage {
        Some(stage) => {
            let query = format!(
                "SELECT {} FROM jobs WHERE stage = $1 ORDER BY created_at DESC",
                JOB_COLUMNS
            );
            sqlx::query_as::<_, JobRow>(&query)
                .bind(stage.as_str())
                .fetch_all(executor)
                .await?
        }
        None => {
            let query = format!("SELECT {} FROM jobs ORDER BY created_at DESC", JOB_COLUMNS);
            sqlx::query_as::<_, JobRow>(&query)
                .fetch_all(executor)
                .await?
        }
    };

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Find the most recent job for `url` that is active or completed
pub async fn find_blocking_by_url<'e, E>(executor: E, url: &str) -> Result<Option<Job>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let query = format!(
        "SELECT {} FROM jobs WHERE url = $1 AND stage = ANY($2) ORDER BY created_at DESC LIMIT 1",
        JOB_COLUMNS
    );
    let row = sqlx::query_as::<_, JobRow>(&query)
        .bind(url)
        .bind(&BLOCKING_STAGES[..])
        .fetch_optional(executor)
        .await?;

    Ok(row.map(|r| r.into()))
}

/// Serialize enqueues of the same URL until the transaction ends
///
/// The duplicate lookup and the insert run under this lock, so two
/// concurrent submissions of one URL cannot both see it as free.
pub async fn lock_url(conn: &mut PgConnection, url: &str) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(url)
        .execute(conn)
        .await?;

    Ok(())
}

/// Lock the oldest unclaimed queued job, skipping rows other workers hold
pub async fn lock_next_queued(conn: &mut PgConnection) -> Result<Option<Job>, sqlx::Error> {
    let query = format!(
        r#"
        SELECT {} FROM jobs
        WHERE stage = 'queued' AND worker_id IS NULL AND cancel_requested = FALSE
        ORDER BY created_at ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
        JOB_COLUMNS
    );
    let row = sqlx::query_as::<_, JobRow>(&query)
        .fetch_optional(conn)
        .await?;

    Ok(row.map(|r| r.into()))
}

/// Lock non-terminal jobs whose lease ran out before `now`
pub async fn lock_expired_leases(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> Result<Vec<Job>, sqlx::Error> {
    let query = format!(
        r#"
        SELECT {} FROM jobs
        WHERE lease_expires_at IS NOT NULL
          AND lease_expires_at < $1
          AND stage IN ('queued', 'downloading', 'extracting', 'analyzing', 'publishing')
        FOR UPDATE SKIP LOCKED
        "#,
        JOB_COLUMNS
    );
    let rows = sqlx::query_as::<_, JobRow>(&query)
        .bind(now)
        .fetch_all(conn)
        .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Write back every mutable column of a job
///
/// A `Some` lease replaces the stored one, `None` keeps it. The lease is
/// cleared once the job is terminal.
pub async fn update(
    conn: &mut PgConnection,
    job: &Job,
    lease_expires_at: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET stage = $1, stage_attempts = $2, device_info = $3, repository_info = $4,
            error_context = $5, worker_id = $6, cancel_requested = $7,
            lease_expires_at = CASE WHEN $14 THEN NULL ELSE COALESCE($8, lease_expires_at) END,
            started_at = $9, completed_at = $10,
            ttl_class = $11, expires_at = $12
        WHERE id = $13
        "#,
    )
    .bind(job.stage.as_str())
    .bind(attempts_to_db(job.stage_attempts))
    .bind(job.device_info.as_ref().map(Json))
    .bind(job.repository_info.as_ref().map(Json))
    .bind(job.error_context.as_ref().map(Json))
    .bind(&job.worker_id)
    .bind(job.cancel_requested)
    .bind(lease_expires_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.ttl_class.as_str())
    .bind(job.expires_at())
    .bind(job.job_id)
    .bind(job.is_terminal())
    .execute(conn)
    .await?;

    Ok(())
}

/// Move the lease of a job owned by `worker_id`
///
/// # Returns
/// The job's `cancel_requested` flag, or `None` when no such active lease exists
pub async fn extend_lease<'e, E>(
    executor: E,
    id: Uuid,
    worker_id: &str,
    lease_expires_at: DateTime<Utc>,
) -> Result<Option<bool>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let row: Option<(bool,)> = sqlx::query_as(
        r#"
        UPDATE jobs
        SET lease_expires_at = $1
        WHERE id = $2 AND worker_id = $3
          AND stage IN ('queued', 'downloading', 'extracting', 'analyzing', 'publishing')
        RETURNING cancel_requested
        "#,
    )
    .bind(lease_expires_at)
    .bind(id)
    .bind(worker_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|r| r.0))
}

/// Delete every job whose retention window has passed
pub async fn delete_expired<'e, E>(executor: E, now: DateTime<Utc>) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM jobs WHERE expires_at < $1")
        .bind(now)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn attempts_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn attempts_from_db(attempts: i32) -> u32 {
    u32::try_from(attempts).unwrap_or(1).max(1)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    url: String,
    options: Json<JobOptions>,
    notification_context: Json<NotificationContext>,
    stage: String,
    stage_attempts: i32,
    device_info: Option<Json<DeviceInfo>>,
    repository_info: Option<Json<RepositoryInfo>>,
    error_context: Option<Json<ErrorContext>>,
    worker_id: Option<String>,
    cancel_requested: bool,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    ttl_class: String,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        // An unreadable stage is treated as failed so the job is never claimed
        let stage = JobStage::parse(&row.stage).unwrap_or(JobStage::Failed);

        Job {
            job_id: row.id,
            url: row.url,
            options: row.options.0,
            notification_context: row.notification_context.0,
            stage,
            stage_attempts: attempts_from_db(row.stage_attempts),
            progress_log: Vec::new(),
            device_info: row.device_info.map(|j| j.0),
            repository_info: row.repository_info.map(|j| j.0),
            error_context: row.error_context.map(|j| j.0),
            worker_id: row.worker_id,
            cancel_requested: row.cancel_requested,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            ttl_class: TtlClass::parse(&row.ttl_class),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_stages_match_domain_names() {
        for name in BLOCKING_STAGES {
            let stage = JobStage::parse(name).unwrap();
            assert!(!matches!(
                stage,
                JobStage::Failed | JobStage::Aborted | JobStage::Cancelled
            ));
        }
    }

    #[test]
    fn test_attempts_conversion_clamps() {
        assert_eq!(attempts_to_db(u32::MAX), i32::MAX);
        assert_eq!(attempts_from_db(-4), 1);
        assert_eq!(attempts_from_db(0), 1);
        assert_eq!(attempts_from_db(2), 2);
    }
}
