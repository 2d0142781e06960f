//! Progress DTOs for inter-service communication

use serde::{Deserialize, Serialize};

use crate::domain::progress::ProgressEntry;

/// Progress batch sent from worker to orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressBatch {
    pub worker_id: String,
    pub entries: Vec<ProgressEntry>,
}
