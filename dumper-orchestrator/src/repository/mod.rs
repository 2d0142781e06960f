//! Repository Module
//!
//! Data access layer for the orchestrator.
//! Each repository handles database operations for a specific domain entity.

pub mod job;
pub mod progress;

// Re-export for convenience
pub use job as job_repository;
pub use progress as progress_repository;
