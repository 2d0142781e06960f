//! Job-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use dumper_core::domain::device::{DeviceInfo, RepositoryInfo};
use dumper_core::domain::job::{Job, JobOutcome, JobStage};
use dumper_core::domain::progress::ProgressEntry;
use dumper_core::dto::job::{
    AdvanceStage, CancelResponse, ClaimJob, EnqueueJob, ExtendLease, FinishJob, LeaseStatus,
    SetDeviceInfo, SetRepositoryInfo,
};
use dumper_core::dto::progress::ProgressBatch;
use uuid::Uuid;

impl OrchestratorClient {
    // =============================================================================
    // Job Submission
    // =============================================================================

    /// Enqueue a new dump job
    ///
    /// # Arguments
    /// * `req` - URL, option flags and notification addressing
    ///
    /// # Returns
    /// The queued job. A 409 error means the URL was already dumped and
    /// `force_redump` was not set.
    pub async fn enqueue_job(&self, req: EnqueueJob) -> Result<Job> {
        let url = format!("{}/job", self.base_url);
        let response = self.client.post(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// Get a job by ID
    pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        let url = format!("{}/job/{}", self.base_url, job_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// List jobs, optionally restricted to one stage
    pub async fn list_jobs(&self, stage: Option<JobStage>) -> Result<Vec<Job>> {
        let url = format!("{}/job/list", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(stage) = stage {
            request = request.query(&[("stage", stage.as_str())]);
        }
        let response = request.send().await?;

        self.handle_response(response).await
    }

    /// Request cancellation of a job
    ///
    /// Idempotent while the job is not terminal; cancelling a finished job
    /// returns a 409 error.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<CancelResponse> {
        let url = format!("{}/job/{}/cancel", self.base_url, job_id);
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Job Execution (Worker-specific)
    // =============================================================================

    /// Lease the oldest queued job
    ///
    /// # Returns
    /// `None` when the queue is empty
    pub async fn claim_next_job(&self, worker_id: &str, lease_seconds: u64) -> Result<Option<Job>> {
        let url = format!("{}/job/claim", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&ClaimJob {
                worker_id: worker_id.to_string(),
                lease_seconds,
            })
            .send()
            .await?;

        self.handle_optional_response(response).await
    }

    /// Extend the lease held on a job
    pub async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_seconds: u64,
    ) -> Result<LeaseStatus> {
        let url = format!("{}/job/{}/lease", self.base_url, job_id);
        let response = self
            .client
            .post(&url)
            .json(&ExtendLease {
                worker_id: worker_id.to_string(),
                lease_seconds,
            })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Append entries to a job's progress log
    pub async fn append_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        entries: Vec<ProgressEntry>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let url = format!("{}/job/{}/progress", self.base_url, job_id);
        let response = self
            .client
            .post(&url)
            .json(&ProgressBatch {
                worker_id: worker_id.to_string(),
                entries,
            })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Move a job to its next (or the same) non-terminal stage
    pub async fn advance_stage(&self, job_id: Uuid, worker_id: &str, stage: JobStage) -> Result<Job> {
        let url = format!("{}/job/{}/stage", self.base_url, job_id);
        let response = self
            .client
            .post(&url)
            .json(&AdvanceStage {
                worker_id: worker_id.to_string(),
                stage,
            })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Record the analysed device identity (accepted once)
    pub async fn set_device_info(&self, job_id: Uuid, worker_id: &str, info: DeviceInfo) -> Result<()> {
        let url = format!("{}/job/{}/device", self.base_url, job_id);
        let response = self
            .client
            .put(&url)
            .json(&SetDeviceInfo {
                worker_id: worker_id.to_string(),
                info,
            })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Record where the dump was published (accepted once)
    pub async fn set_repository_info(
        &self,
        job_id: Uuid,
        worker_id: &str,
        info: RepositoryInfo,
    ) -> Result<()> {
        let url = format!("{}/job/{}/repository", self.base_url, job_id);
        let response = self
            .client
            .put(&url)
            .json(&SetRepositoryInfo {
                worker_id: worker_id.to_string(),
                info,
            })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Report the terminal outcome of a job
    pub async fn finish_job(&self, job_id: Uuid, worker_id: &str, outcome: JobOutcome) -> Result<Job> {
        let url = format!("{}/job/{}/finish", self.base_url, job_id);
        let response = self
            .client
            .post(&url)
            .json(&FinishJob {
                worker_id: worker_id.to_string(),
                outcome,
            })
            .send()
            .await?;

        self.handle_response(response).await
    }
}
