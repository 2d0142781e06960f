//! Job DTOs for inter-service communication

use serde::{Deserialize, Serialize};

use crate::domain::device::{DeviceInfo, RepositoryInfo};
use crate::domain::job::{CancelEffect, Job, JobOptions, JobOutcome, JobStage, NotificationContext};

/// Request to enqueue a new dump job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueJob {
    pub url: String,
    #[serde(default)]
    pub options: JobOptions,
    pub notification_context: NotificationContext,
}

/// Request from a worker to lease the next queued job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimJob {
    pub worker_id: String,
    pub lease_seconds: u64,
}

/// Lease heartbeat from the owning worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendLease {
    pub worker_id: String,
    pub lease_seconds: u64,
}

/// Answer to a lease heartbeat
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LeaseStatus {
    pub cancel_requested: bool,
}

/// Stage change requested by the owning worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvanceStage {
    pub worker_id: String,
    pub stage: JobStage,
}

/// Device identity reported by the owning worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDeviceInfo {
    pub worker_id: String,
    pub info: DeviceInfo,
}

/// Publication target reported by the owning worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetRepositoryInfo {
    pub worker_id: String,
    pub info: RepositoryInfo,
}

/// Terminal report from the owning worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishJob {
    pub worker_id: String,
    pub outcome: JobOutcome,
}

/// Result of a cancellation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub effect: CancelEffect,
    pub job: Job,
}

/// Filters for job listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListJobsQuery {
    pub stage: Option<JobStage>,
}
