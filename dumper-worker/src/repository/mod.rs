//! Repository layer
//!
//! Repositories are thin clients for everything outside the worker process:
//! the orchestrator, external programs, the GitLab instance, the chat
//! transport and the log analysis model. They carry no pipeline logic.
//!
//! All repositories are trait-based to enable testing and mocking.

pub mod gemini;
pub mod gitlab;
pub mod jobs;
pub mod reachability;
pub mod telegram;
pub mod tools;

// Re-export traits
pub use gemini::FailureAnalyzer;
pub use gitlab::RepositoryHost;
pub use jobs::JobRepository;
pub use reachability::UrlChecker;
pub use telegram::MessageChannel;
pub use tools::ToolRunner;

// Re-export implementations
pub use gemini::GeminiAnalyzer;
pub use gitlab::GitLabHost;
pub use jobs::HttpJobRepository;
pub use reachability::HttpUrlChecker;
pub use telegram::{LogOnlyChannel, TelegramChannel};
pub use tools::ProcessToolRunner;
