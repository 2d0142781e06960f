//! Data Transfer Objects for inter-service communication
//!
//! This module contains DTOs used for communication between dumper services
//! (orchestrator, worker, CLI). Requests are lightweight wrappers around
//! domain values.

pub mod job;
pub mod progress;
