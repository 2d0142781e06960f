//! Scheduler layer for the worker
//!
//! This layer claims jobs from the orchestrator and coordinates their
//! execution. It owns the lifecycle of a job from claim to terminal
//! outcome: work directory, lease heartbeat and progress streaming.

pub mod poller;

pub use poller::JobPoller;
