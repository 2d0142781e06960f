//! Stage failure type
//!
//! Every pipeline step returns `Result<_, StageError>`; the pipeline turns
//! the error into the job's terminal outcome.

use dumper_core::domain::error::{ErrorContext, ErrorKind};
use dumper_core::domain::job::{JobOutcome, JobStage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    /// The step failed for a classified reason
    #[error("{message}")]
    Failed { kind: ErrorKind, message: String },

    /// The publication target already exists; the job ends as aborted
    #[error("{0}")]
    Conflict(String),

    #[error("job was cancelled")]
    Cancelled,

    /// Store or filesystem failure inside the worker
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StageError {
    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        StageError::Failed {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Failed { kind, .. } => *kind,
            StageError::Conflict(_) => ErrorKind::PublishConflict,
            StageError::Cancelled => ErrorKind::Cancelled,
            StageError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Terminal outcome for a failure that happened in `stage`
    pub fn into_outcome(self, stage: JobStage) -> JobOutcome {
        match self {
            StageError::Conflict(reason) => JobOutcome::Aborted { reason },
            StageError::Cancelled => JobOutcome::Cancelled,
            other => {
                let kind = other.kind();
                JobOutcome::Failed {
                    error: ErrorContext::new(stage, kind, format!("{:#}", other)),
                }
            }
        }
    }
}
