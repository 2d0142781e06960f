//! Job domain types
//!
//! The job record and the state machine that governs it. Both the store
//! (when validating worker requests) and the worker (when tracking its own
//! copy) apply transitions through the methods defined here.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::device::{DeviceInfo, RepositoryInfo};
use crate::domain::error::ErrorContext;
use crate::domain::progress::ProgressEntry;

/// How many times a worker may enter the same stage before the job has to
/// progress or terminate
pub const MAX_STAGE_ATTEMPTS: u32 = 3;

/// Firmware dump job
///
/// Structure shared between orchestrator (persists) and worker (updates).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub url: String,
    pub options: JobOptions,
    pub notification_context: NotificationContext,
    pub stage: JobStage,
    /// Number of times the current stage has been entered
    pub stage_attempts: u32,
    pub progress_log: Vec<ProgressEntry>,
    pub device_info: Option<DeviceInfo>,
    pub repository_info: Option<RepositoryInfo>,
    pub error_context: Option<ErrorContext>,
    pub worker_id: Option<String>,
    pub cancel_requested: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ttl_class: TtlClass,
}

/// Per-job option flags chosen at enqueue time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Use the partition-by-partition toolkit instead of the default extractor
    #[serde(default)]
    pub use_alternate_extractor: bool,
    /// Enqueue even if the URL was already dumped
    #[serde(default)]
    pub force_redump: bool,
    /// Announce the dump even when the URL is allowlisted
    #[serde(default)]
    pub add_to_blocklist: bool,
    /// Hide the source URL and skip the public announcement
    #[serde(default)]
    pub private_mode: bool,
}

/// Addressing for progress messages
///
/// `origin_*` is absent in same-conversation mode. When present, the live
/// status message threads back to the origin message across conversations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationContext {
    pub origin_conversation_id: Option<i64>,
    pub origin_message_id: Option<i64>,
    pub report_conversation_id: i64,
    pub report_message_id: Option<i64>,
}

impl NotificationContext {
    /// Whether replies must use explicit cross-conversation threading
    pub fn is_cross_conversation(&self) -> bool {
        match (self.origin_conversation_id, self.origin_message_id) {
            (Some(origin), Some(_)) => origin != self.report_conversation_id,
            _ => false,
        }
    }
}

/// Position of a job in the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    Downloading,
    Extracting,
    Analyzing,
    Publishing,
    Completed,
    Failed,
    Aborted,
    Cancelled,
}

impl JobStage {
    /// The non-terminal stages in execution order
    pub const PIPELINE: [JobStage; 5] = [
        JobStage::Queued,
        JobStage::Downloading,
        JobStage::Extracting,
        JobStage::Analyzing,
        JobStage::Publishing,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStage::Completed | JobStage::Failed | JobStage::Aborted | JobStage::Cancelled
        )
    }

    /// Stage that follows this one on the success path
    pub fn successor(&self) -> Option<JobStage> {
        match self {
            JobStage::Queued => Some(JobStage::Downloading),
            JobStage::Downloading => Some(JobStage::Extracting),
            JobStage::Extracting => Some(JobStage::Analyzing),
            JobStage::Analyzing => Some(JobStage::Publishing),
            JobStage::Publishing => Some(JobStage::Completed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Queued => "queued",
            JobStage::Downloading => "downloading",
            JobStage::Extracting => "extracting",
            JobStage::Analyzing => "analyzing",
            JobStage::Publishing => "publishing",
            JobStage::Completed => "completed",
            JobStage::Failed => "failed",
            JobStage::Aborted => "aborted",
            JobStage::Cancelled => "cancelled",
        }
    }

    /// Parses the persisted form of a stage
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStage::Queued),
            "downloading" => Some(JobStage::Downloading),
            "extracting" => Some(JobStage::Extracting),
            "analyzing" => Some(JobStage::Analyzing),
            "publishing" => Some(JobStage::Publishing),
            "completed" => Some(JobStage::Completed),
            "failed" => Some(JobStage::Failed),
            "aborted" => Some(JobStage::Aborted),
            "cancelled" => Some(JobStage::Cancelled),
            _ => None,
        }
    }

    /// Validates a move from `self` to `to`
    ///
    /// `attempts` is how many times the current stage has been entered.
    pub fn check_transition(&self, to: JobStage, attempts: u32) -> Result<Transition, TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(*self));
        }

        if to.is_terminal() {
            if to == JobStage::Completed && *self != JobStage::Publishing {
                return Err(TransitionError::Invalid { from: *self, to });
            }
            return Ok(Transition::Terminate);
        }

        if to == *self {
            if attempts >= MAX_STAGE_ATTEMPTS {
                return Err(TransitionError::RetryLimit {
                    stage: *self,
                    max: MAX_STAGE_ATTEMPTS,
                });
            }
            return Ok(Transition::Retry);
        }

        if self.successor() == Some(to) {
            Ok(Transition::Advance)
        } else {
            Err(TransitionError::Invalid { from: *self, to })
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an accepted transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advance,
    Retry,
    Terminate,
}

/// Rejected state change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job already reached terminal stage {0}")]
    AlreadyTerminal(JobStage),

    #[error("cannot move from {from} to {to}")]
    Invalid { from: JobStage, to: JobStage },

    #[error("stage {stage} was entered {max} times already")]
    RetryLimit { stage: JobStage, max: u32 },

    #[error("{0} is already set")]
    AlreadySet(&'static str),
}

/// Retention class of a job record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlClass {
    Completed,
    Failed,
    Running,
}

impl TtlClass {
    /// Retention window enforced by the store
    pub fn retention(&self) -> chrono::Duration {
        match self {
            TtlClass::Completed => chrono::Duration::days(60),
            TtlClass::Failed => chrono::Duration::days(15),
            TtlClass::Running => chrono::Duration::days(7),
        }
    }

    /// Class for a given stage; aborted and cancelled jobs share the failed window
    pub fn for_stage(stage: JobStage) -> Self {
        match stage {
            JobStage::Completed => TtlClass::Completed,
            JobStage::Failed | JobStage::Aborted | JobStage::Cancelled => TtlClass::Failed,
            _ => TtlClass::Running,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TtlClass::Completed => "completed",
            TtlClass::Failed => "failed",
            TtlClass::Running => "running",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => TtlClass::Completed,
            "failed" => TtlClass::Failed,
            _ => TtlClass::Running,
        }
    }
}

/// Typed terminal result of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { repository: RepositoryInfo },
    Failed { error: ErrorContext },
    /// Conflict, not an error: never retried
    Aborted { reason: String },
    Cancelled,
}

impl JobOutcome {
    pub fn terminal_stage(&self) -> JobStage {
        match self {
            JobOutcome::Completed { .. } => JobStage::Completed,
            JobOutcome::Failed { .. } => JobStage::Failed,
            JobOutcome::Aborted { .. } => JobStage::Aborted,
            JobOutcome::Cancelled => JobStage::Cancelled,
        }
    }
}

/// Effect of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelEffect {
    /// The job had not been claimed and is now cancelled
    Cancelled,
    /// A worker owns the job and will stop at its next checkpoint
    Requested,
    /// Repeated request, nothing changed
    AlreadyCancelled,
}

impl Job {
    /// Creates a freshly queued job
    pub fn new(
        job_id: Uuid,
        url: String,
        options: JobOptions,
        notification_context: NotificationContext,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            job_id,
            url,
            options,
            notification_context,
            stage: JobStage::Queued,
            stage_attempts: 1,
            progress_log: Vec::new(),
            device_info: None,
            repository_info: None,
            error_context: None,
            worker_id: None,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            ttl_class: TtlClass::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Moves to a non-terminal stage
    pub fn advance(&mut self, to: JobStage) -> Result<Transition, TransitionError> {
        if to.is_terminal() {
            return Err(TransitionError::Invalid {
                from: self.stage,
                to,
            });
        }

        let transition = self.stage.check_transition(to, self.stage_attempts)?;
        match transition {
            Transition::Retry => self.stage_attempts += 1,
            _ => {
                self.stage = to;
                self.stage_attempts = 1;
            }
        }
        Ok(transition)
    }

    /// Moves to the terminal stage described by `outcome`
    pub fn finish(
        &mut self,
        outcome: &JobOutcome,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), TransitionError> {
        let to = outcome.terminal_stage();
        self.stage.check_transition(to, self.stage_attempts)?;

        match outcome {
            JobOutcome::Completed { repository } => {
                if self.repository_info.is_none() {
                    self.repository_info = Some(repository.clone());
                }
                self.error_context = None;
            }
            JobOutcome::Failed { error } => self.error_context = Some(error.clone()),
            JobOutcome::Aborted { .. } | JobOutcome::Cancelled => self.error_context = None,
        }

        self.stage = to;
        self.stage_attempts = 1;
        self.ttl_class = TtlClass::for_stage(to);
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn set_device_info(&mut self, info: DeviceInfo) -> Result<(), TransitionError> {
        if self.device_info.is_some() {
            return Err(TransitionError::AlreadySet("device_info"));
        }
        self.device_info = Some(info);
        Ok(())
    }

    pub fn set_repository_info(&mut self, info: RepositoryInfo) -> Result<(), TransitionError> {
        if self.repository_info.is_some() {
            return Err(TransitionError::AlreadySet("repository_info"));
        }
        self.repository_info = Some(info);
        Ok(())
    }

    /// Records a cancellation request
    ///
    /// Queued jobs are cancelled immediately; claimed jobs are flagged and
    /// stop at the next checkpoint.
    pub fn request_cancel(
        &mut self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<CancelEffect, TransitionError> {
        match self.stage {
            JobStage::Cancelled => Ok(CancelEffect::AlreadyCancelled),
            stage if stage.is_terminal() => Err(TransitionError::AlreadyTerminal(stage)),
            JobStage::Queued if self.worker_id.is_none() => {
                self.cancel_requested = true;
                self.finish(&JobOutcome::Cancelled, now)?;
                Ok(CancelEffect::Cancelled)
            }
            _ if self.cancel_requested => Ok(CancelEffect::AlreadyCancelled),
            _ => {
                self.cancel_requested = true;
                Ok(CancelEffect::Requested)
            }
        }
    }

    /// Time at which the store may delete this record
    pub fn expires_at(&self) -> chrono::DateTime<chrono::Utc> {
        let anchor = self.completed_at.unwrap_or(self.created_at);
        anchor + self.ttl_class.retention()
    }
}
