//! Worker configuration
//!
//! Defines all configurable parameters for the worker: polling and lease
//! timing, local directories for firmware work, and the credentials of the
//! external services a dump talks to.

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::service::extract::PartitionFailurePolicy;

/// Worker configuration
///
/// All timeouts and intervals are configurable to allow tuning
/// for different deployment scenarios (dev vs prod, fast vs slow networks).
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this worker instance
    pub worker_id: String,

    /// Orchestrator base URL (e.g., "http://localhost:8080")
    pub orchestrator_url: String,

    /// How often to poll the orchestrator for new jobs
    pub poll_interval: Duration,

    /// Max parallel jobs the worker can handle
    pub max_parallel_jobs: usize,

    /// Maximum time a job can run before it is failed with a timeout
    pub job_timeout: Duration,

    /// Lease requested on claim; the heartbeat renews it every third of this
    pub lease_duration: Duration,

    /// How often buffered progress entries are sent to the orchestrator
    pub progress_send_interval: Duration,

    /// Parent directory of the per-job temporary work directories
    pub work_root: PathBuf,

    /// Checkout of the partition-by-partition extraction toolkit
    pub extractor_home: PathBuf,

    /// Which partition extraction failures end the job
    pub partition_failure_policy: PartitionFailurePolicy,

    /// File with one allowlisted URL fragment per line
    pub allowlist_path: Option<PathBuf>,

    pub gitlab: GitLabConfig,

    pub telegram: TelegramConfig,

    pub gemini: GeminiConfig,
}

/// Source hosting settings
#[derive(Debug, Clone)]
pub struct GitLabConfig {
    /// Host name of the GitLab instance
    pub server: String,
    /// Top-level group the vendor subgroups live under
    pub org: String,
    /// Numeric id of `org`, used as parent when creating subgroups
    pub parent_group_id: u64,
    /// SSH host alias used for `git push`
    pub push_host: String,
    /// API token; publishing fails when absent
    pub token: Option<String>,
}

/// Chat transport settings
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Bot token; without it progress is only logged
    pub bot_token: Option<String>,
    pub api_url: String,
    /// Public channel that receives completed dump announcements
    pub announce_channel: String,
}

/// Log analysis settings
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// API key; analysis is disabled when absent
    pub api_key: Option<String>,
    pub model: String,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(worker_id: String, orchestrator_url: String) -> Self {
        Self {
            worker_id,
            orchestrator_url,
            poll_interval: Duration::from_secs(5),
            max_parallel_jobs: 2,
            job_timeout: Duration::from_secs(7200), // 2 hours
            lease_duration: Duration::from_secs(300),
            progress_send_interval: Duration::from_secs(3),
            work_root: std::env::temp_dir(),
            extractor_home: PathBuf::from("Firmware_extractor"),
            partition_failure_policy: PartitionFailurePolicy::First,
            allowlist_path: None,
            gitlab: GitLabConfig::default(),
            telegram: TelegramConfig::default(),
            gemini: GeminiConfig::default(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - WORKER_ID (optional, default: random UUID)
    /// - ORCHESTRATOR_URL (optional, default: http://localhost:8080)
    /// - POLL_INTERVAL (optional, seconds, default: 5)
    /// - MAX_PARALLEL_JOBS (optional, default: 2)
    /// - JOB_TIMEOUT (optional, seconds, default: 7200)
    /// - LEASE_DURATION (optional, seconds, default: 300)
    /// - PROGRESS_SEND_INTERVAL (optional, seconds, default: 3)
    /// - WORK_ROOT, EXTRACTOR_HOME, ALLOWLIST_PATH (optional paths)
    /// - PARTITION_FAILURE_POLICY (optional, first|strict|lenient, default: first)
    /// - GITLAB_SERVER, GITLAB_ORG, GITLAB_PARENT_GROUP_ID, GITLAB_PUSH_HOST, DUMPER_TOKEN
    /// - TELEGRAM_BOT_TOKEN, TELEGRAM_API_URL, ANNOUNCE_CHANNEL
    /// - GEMINI_API_KEY, GEMINI_MODEL
    ///
    /// # Errors
    /// Returns an error when a variable is set but cannot be parsed
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Creates configuration from a variable lookup
    ///
    /// Only the worker identity and orchestrator address fall back to
    /// defaults when missing; every other unset variable keeps its default
    /// and every malformed one is an error.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let worker_id = var("WORKER_ID").unwrap_or_else(|| {
            warn!("WORKER_ID not set, using {}", defaults.worker_id);
            defaults.worker_id.clone()
        });
        let orchestrator_url = var("ORCHESTRATOR_URL").unwrap_or_else(|| {
            warn!("ORCHESTRATOR_URL not set, using {}", defaults.orchestrator_url);
            defaults.orchestrator_url.clone()
        });

        let mut config = Self::new(worker_id, orchestrator_url);

        if let Some(interval) = parse_var::<u64>(&var, "POLL_INTERVAL")? {
            config.poll_interval = Duration::from_secs(interval);
        }
        if let Some(max) = parse_var::<usize>(&var, "MAX_PARALLEL_JOBS")? {
            config.max_parallel_jobs = max;
        }
        if let Some(timeout) = parse_var::<u64>(&var, "JOB_TIMEOUT")? {
            config.job_timeout = Duration::from_secs(timeout);
        }
        if let Some(lease) = parse_var::<u64>(&var, "LEASE_DURATION")? {
            config.lease_duration = Duration::from_secs(lease);
        }
        if let Some(interval) = parse_var::<u64>(&var, "PROGRESS_SEND_INTERVAL")? {
            config.progress_send_interval = Duration::from_secs(interval);
        }

        if let Some(root) = var("WORK_ROOT") {
            config.work_root = PathBuf::from(root);
        }
        if let Some(home) = var("EXTRACTOR_HOME") {
            config.extractor_home = PathBuf::from(home);
        }
        if let Some(policy) = var("PARTITION_FAILURE_POLICY") {
            config.partition_failure_policy = PartitionFailurePolicy::parse(&policy)
                .ok_or_else(|| anyhow::anyhow!("Unknown PARTITION_FAILURE_POLICY: {}", policy))?;
        }
        config.allowlist_path = var("ALLOWLIST_PATH").map(PathBuf::from);

        if let Some(server) = var("GITLAB_SERVER") {
            config.gitlab.server = server;
        }
        if let Some(org) = var("GITLAB_ORG") {
            config.gitlab.org = org;
        }
        if let Some(id) = parse_var::<u64>(&var, "GITLAB_PARENT_GROUP_ID")? {
            config.gitlab.parent_group_id = id;
        }
        if let Some(host) = var("GITLAB_PUSH_HOST") {
            config.gitlab.push_host = host;
        }
        config.gitlab.token = non_empty(&var, "DUMPER_TOKEN");

        config.telegram.bot_token = non_empty(&var, "TELEGRAM_BOT_TOKEN");
        if let Some(api_url) = var("TELEGRAM_API_URL") {
            config.telegram.api_url = api_url;
        }
        if let Some(channel) = var("ANNOUNCE_CHANNEL") {
            config.telegram.announce_channel = channel;
        }

        config.gemini.api_key = non_empty(&var, "GEMINI_API_KEY");
        if let Some(model) = var("GEMINI_MODEL") {
            config.gemini.model = model;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }

        if self.orchestrator_url.is_empty() {
            anyhow::bail!("orchestrator_url cannot be empty");
        }

        if !self.orchestrator_url.starts_with("http://")
            && !self.orchestrator_url.starts_with("https://")
        {
            anyhow::bail!("orchestrator_url must start with http:// or https://");
        }

        if self.poll_interval.as_secs() == 0 {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.max_parallel_jobs == 0 {
            anyhow::bail!("max_parallel_jobs must be greater than 0");
        }

        // The heartbeat fires every third of the lease
        if self.lease_duration.as_secs() < 3 {
            anyhow::bail!("lease_duration must be at least 3 seconds");
        }

        if self.progress_send_interval.is_zero() {
            anyhow::bail!("progress_send_interval must be greater than 0");
        }

        if self.job_timeout.is_zero() {
            anyhow::bail!("job_timeout must be greater than 0");
        }

        if self.gitlab.server.is_empty() || self.gitlab.org.is_empty() {
            anyhow::bail!("gitlab server and org cannot be empty");
        }

        Ok(())
    }

    /// Interval between lease renewals
    pub fn heartbeat_interval(&self) -> Duration {
        self.lease_duration / 3
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            "http://localhost:8080".to_string(),
        )
    }
}

impl Default for GitLabConfig {
    fn default() -> Self {
        Self {
            server: "dumps.tadiphone.dev".to_string(),
            org: "dumps".to_string(),
            parent_group_id: 64,
            push_host: "dumps".to_string(),
            token: None,
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_url: "https://api.telegram.org".to_string(),
            announce_channel: "@android_dumps".to_string(),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gemini-2.5-pro".to_string(),
        }
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", name, value, e))
        })
        .transpose()
}

fn non_empty(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    var(name).filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.job_timeout, Duration::from_secs(7200));
        assert_eq!(config.lease_duration, Duration::from_secs(300));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(100));
        assert_eq!(config.partition_failure_policy, PartitionFailurePolicy::First);
        assert_eq!(config.gitlab.parent_group_id, 64);
        assert_eq!(config.telegram.announce_channel, "@android_dumps");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        // Valid config should pass
        assert!(config.validate().is_ok());

        // Empty worker_id should fail
        config.worker_id = String::new();
        assert!(config.validate().is_err());

        config.worker_id = "test".to_string();

        // Invalid URL should fail
        config.orchestrator_url = "not-a-url".to_string();
        assert!(config.validate().is_err());

        config.orchestrator_url = "http://localhost:8080".to_string();
        assert!(config.validate().is_ok());

        config.lease_duration = Duration::from_secs(2);
        assert!(config.validate().is_err());

        config.lease_duration = Duration::from_secs(300);
        config.max_parallel_jobs = 0;
        assert!(config.validate().is_err());
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: std::collections::HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_from_vars_reads_every_setting() {
        let config = Config::from_vars(vars(&[
            ("WORKER_ID", "worker-7"),
            ("ORCHESTRATOR_URL", "http://orch:9000"),
            ("LEASE_DURATION", "90"),
            ("PARTITION_FAILURE_POLICY", "strict"),
            ("DUMPER_TOKEN", "secret"),
            ("TELEGRAM_BOT_TOKEN", " "),
        ]))
        .unwrap();

        assert_eq!(config.worker_id, "worker-7");
        assert_eq!(config.orchestrator_url, "http://orch:9000");
        assert_eq!(config.lease_duration, Duration::from_secs(90));
        assert_eq!(config.partition_failure_policy, PartitionFailurePolicy::Strict);
        assert_eq!(config.gitlab.token.as_deref(), Some("secret"));
        assert!(config.telegram.bot_token.is_none());
    }

    #[test]
    fn test_missing_identity_falls_back_to_defaults() {
        let config = Config::from_vars(vars(&[("DUMPER_TOKEN", "secret")])).unwrap();

        assert_eq!(config.orchestrator_url, "http://localhost:8080");
        assert!(!config.worker_id.is_empty());
        assert_eq!(config.gitlab.token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_malformed_values_are_errors() {
        let err = Config::from_vars(vars(&[
            ("WORKER_ID", "worker-7"),
            ("ORCHESTRATOR_URL", "http://orch:9000"),
            ("DUMPER_TOKEN", "secret"),
            ("PARTITION_FAILURE_POLICY", "bogus"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("PARTITION_FAILURE_POLICY"));

        let err = Config::from_vars(vars(&[("MAX_PARALLEL_JOBS", "two")])).unwrap_err();
        assert!(err.to_string().starts_with("Invalid MAX_PARALLEL_JOBS 'two'"));
    }
}
