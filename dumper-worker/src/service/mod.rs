//! Service layer
//!
//! Services contain the dump logic of the worker. Each stage of the
//! pipeline has its own service; they reach the outside world only
//! through the repository traits, so every one of them can be tested
//! against fakes.

pub mod analysis;
pub mod boot;
pub mod download;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod properties;
pub mod publish;
pub mod retry;
pub mod status;

pub use pipeline::DumpPipeline;
pub use status::Allowlist;
