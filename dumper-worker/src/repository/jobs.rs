//! Jobs repository
//!
//! Handles communication with the orchestrator for job-related operations:
//! - Claiming the next queued job under a lease
//! - Renewing the lease and learning about cancellation requests
//! - Streaming progress entries
//! - Recording stage moves, device and repository records
//! - Finishing jobs with a typed outcome

use anyhow::{Context, Result};
use async_trait::async_trait;
use dumper_client::{ClientError, OrchestratorClient};
use dumper_core::domain::device::{DeviceInfo, RepositoryInfo};
use dumper_core::domain::job::{Job, JobOutcome, JobStage};
use dumper_core::domain::progress::ProgressEntry;
use dumper_core::dto::job::LeaseStatus;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Repository trait for job-related operations with the orchestrator
///
/// Every call is made on behalf of the worker the repository was built for.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Leases the oldest queued job
    ///
    /// # Returns
    /// `None` when nothing is queued
    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>>;

    /// Renews the lease on a job this worker holds
    async fn extend_lease(&self, job_id: Uuid, lease: Duration) -> Result<LeaseStatus>;

    /// Appends entries to the job's progress log
    async fn append_progress(&self, job_id: Uuid, entries: Vec<ProgressEntry>) -> Result<()>;

    /// Moves the job to `stage`
    ///
    /// # Arguments
    /// * `job_id` - The job to move
    /// * `stage` - Either the successor of the current stage or the current stage (retry)
    async fn advance_stage(&self, job_id: Uuid, stage: JobStage) -> Result<Job>;

    async fn set_device_info(&self, job_id: Uuid, info: DeviceInfo) -> Result<()>;

    async fn set_repository_info(&self, job_id: Uuid, info: RepositoryInfo) -> Result<()>;

    /// Records the terminal outcome
    async fn finish(&self, job_id: Uuid, outcome: JobOutcome) -> Result<Job>;
}

/// HTTP implementation of JobRepository
pub struct HttpJobRepository {
    client: Arc<OrchestratorClient>,
    worker_id: String,
}

impl HttpJobRepository {
    /// Creates a new HTTP job repository
    ///
    /// # Arguments
    /// * `client` - Shared orchestrator client
    /// * `worker_id` - Unique identifier for this worker
    pub fn new(client: Arc<OrchestratorClient>, worker_id: String) -> Self {
        Self { client, worker_id }
    }
}

#[async_trait]
impl JobRepository for HttpJobRepository {
    async fn claim_next(&self, lease: Duration) -> Result<Option<Job>> {
        self.client
            .claim_next_job(&self.worker_id, lease.as_secs())
            .await
            .context("Failed to claim job")
    }

    async fn extend_lease(&self, job_id: Uuid, lease: Duration) -> Result<LeaseStatus> {
        self.client
            .extend_lease(job_id, &self.worker_id, lease.as_secs())
            .await
            .context("Failed to extend lease")
    }

    async fn append_progress(&self, job_id: Uuid, entries: Vec<ProgressEntry>) -> Result<()> {
        self.client
            .append_progress(job_id, &self.worker_id, entries)
            .await
            .context("Failed to send progress")
    }

    async fn advance_stage(&self, job_id: Uuid, stage: JobStage) -> Result<Job> {
        self.client
            .advance_stage(job_id, &self.worker_id, stage)
            .await
            .with_context(|| format!("Failed to move job to {}", stage))
    }

    async fn set_device_info(&self, job_id: Uuid, info: DeviceInfo) -> Result<()> {
        self.client
            .set_device_info(job_id, &self.worker_id, info)
            .await
            .context("Failed to record device info")
    }

    async fn set_repository_info(&self, job_id: Uuid, info: RepositoryInfo) -> Result<()> {
        self.client
            .set_repository_info(job_id, &self.worker_id, info)
            .await
            .context("Failed to record repository info")
    }

    async fn finish(&self, job_id: Uuid, outcome: JobOutcome) -> Result<Job> {
        self.client
            .finish_job(job_id, &self.worker_id, outcome)
            .await
            .context("Failed to finish job")
    }
}

/// Whether a failed store call may succeed when repeated
///
/// Rejections from the orchestrator (4xx) are final; transport failures,
/// server errors and anything not coming from the client are retried.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ClientError>()
        .is_none_or(ClientError::is_transient)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_are_not_retried() {
        let conflict = anyhow::Error::new(ClientError::api_error(409, "already terminal"))
            .context("Failed to finish job");
        assert!(!is_retryable(&conflict));
    }

    #[test]
    fn test_server_and_unknown_errors_are_retried() {
        let unavailable = anyhow::Error::new(ClientError::api_error(503, "unavailable"))
            .context("Failed to finish job");
        assert!(is_retryable(&unavailable));
        assert!(is_retryable(&anyhow::anyhow!("connection reset")));
    }
}
