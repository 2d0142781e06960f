//! Dumper Core
//!
//! Core types and abstractions for the firmware dump pipeline.
//!
//! This crate contains:
//! - Domain types: Job, stages, device and repository records, progress entries
//! - The job state machine shared by the store and the workers
//! - DTOs: Data transfer objects for inter-service communication

pub mod domain;
pub mod dto;
