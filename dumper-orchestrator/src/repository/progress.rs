//! Progress Repository
//!
//! Handles all database operations related to job progress logs.
//! Entries are only ever inserted; nothing here updates a row.

use dumper_core::domain::job::JobStage;
use dumper_core::domain::progress::{LogLevel, ProgressEntry};
use sqlx::{PgConnection, PgExecutor};
use uuid::Uuid;

/// Append progress entries for a job
pub async fn add_entries(
    conn: &mut PgConnection,
    job_id: Uuid,
    entries: &[ProgressEntry],
) -> Result<(), sqlx::Error> {
    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO job_progress (job_id, timestamp, stage, level, message)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(job_id)
        .bind(entry.timestamp)
        .bind(entry.stage.as_str())
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Get all progress entries for a job in insertion order
pub async fn find_by_job<'e, E>(executor: E, job_id: Uuid) -> Result<Vec<ProgressEntry>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, ProgressRow>(
        r#"
        SELECT timestamp, stage, level, message
        FROM job_progress
        WHERE job_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ProgressRow {
    timestamp: chrono::DateTime<chrono::Utc>,
    stage: String,
    level: String,
    message: String,
}

impl From<ProgressRow> for ProgressEntry {
    fn from(row: ProgressRow) -> Self {
        ProgressEntry {
            timestamp: row.timestamp,
            stage: JobStage::parse(&row.stage).unwrap_or(JobStage::Queued),
            level: LogLevel::parse(&row.level),
            message: row.message,
        }
    }
}
