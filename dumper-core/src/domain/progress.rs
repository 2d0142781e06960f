//! Progress log domain types

use serde::{Deserialize, Serialize};

use crate::domain::job::JobStage;

/// A single entry of a job's append-only progress log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stage: JobStage,
    pub level: LogLevel,
    pub message: String,
}

impl ProgressEntry {
    /// Creates an entry stamped with the current time
    pub fn now(stage: JobStage, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            stage,
            level,
            message: message.into(),
        }
    }

    pub fn info(stage: JobStage, message: impl Into<String>) -> Self {
        Self::now(stage, LogLevel::Info, message)
    }

    pub fn warning(stage: JobStage, message: impl Into<String>) -> Self {
        Self::now(stage, LogLevel::Warning, message)
    }

    pub fn error(stage: JobStage, message: impl Into<String>) -> Self {
        Self::now(stage, LogLevel::Error, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "Debug",
            LogLevel::Info => "Info",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
        }
    }

    /// Parses the persisted form, falling back to `Info` for unknown values
    pub fn parse(s: &str) -> Self {
        match s {
            "Debug" => LogLevel::Debug,
            "Warning" => LogLevel::Warning,
            "Error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}
