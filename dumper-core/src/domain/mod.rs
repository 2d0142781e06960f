//! Core domain types
//!
//! This module contains the core domain structures used across dumper services.
//! These types represent the fundamental business entities and are shared between
//! orchestrator (for persistence) and worker (for execution).

pub mod device;
pub mod error;
pub mod job;
pub mod progress;
