//! Failure taxonomy

use serde::{Deserialize, Serialize};

use crate::domain::job::JobStage;

/// Class of the underlying cause of a terminal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DownloadFailed,
    ExtractionFailed,
    CodenameUnresolved,
    /// Target branch already exists; ends the job as aborted
    PublishConflict,
    PublishApiError,
    Cancelled,
    /// Job deadline exceeded or worker lease expired
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DownloadFailed => "download_failed",
            ErrorKind::ExtractionFailed => "extraction_failed",
            ErrorKind::CodenameUnresolved => "codename_unresolved",
            ErrorKind::PublishConflict => "publish_conflict",
            ErrorKind::PublishApiError => "publish_api_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure record, present iff the job ended as `failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Stage the job was in when it failed
    pub stage: JobStage,
    pub message: String,
    pub kind: ErrorKind,
    /// Optional automated log analysis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
}

impl ErrorContext {
    pub fn new(stage: JobStage, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
            analysis: None,
        }
    }
}
