//! Dumper Worker
//!
//! A stateless worker that turns firmware URLs into published source dumps.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Repositories: Thin clients for the orchestrator, external tools, GitLab,
//!   Telegram and the log analysis model
//! - Services: Dump stages (download, extract, analyze, publish) and status reporting
//! - Scheduler: Job claiming, lease heartbeat and progress streaming
//!
//! The worker claims queued jobs from the orchestrator, runs each through
//! the dump pipeline in its own work directory, and streams progress back
//! periodically.

mod config;
mod context;
mod repository;
mod scheduler;
mod service;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::repository::{
    FailureAnalyzer, GeminiAnalyzer, GitLabHost, HttpJobRepository, HttpUrlChecker, JobRepository,
    LogOnlyChannel, MessageChannel, ProcessToolRunner, TelegramChannel, ToolRunner,
};
use crate::scheduler::JobPoller;
use crate::service::{Allowlist, DumpPipeline};
use dumper_client::OrchestratorClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dumper_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Dumper Worker");

    // Load configuration
    let config = load_config()?;
    info!(
        "Loaded configuration: worker_id={}, orchestrator_url={}",
        config.worker_id, config.orchestrator_url
    );

    // Initialize orchestrator client
    let client = Arc::new(OrchestratorClient::new(config.orchestrator_url.clone()));
    wait_for_orchestrator(&client).await?;
    info!("Orchestrator is reachable");

    // Initialize repositories
    let jobs: Arc<dyn JobRepository> =
        Arc::new(HttpJobRepository::new(Arc::clone(&client), config.worker_id.clone()));
    let tools: Arc<dyn ToolRunner> = Arc::new(ProcessToolRunner::new());
    let checker = Arc::new(HttpUrlChecker::new().context("Failed to create HTTP client")?);
    let host = Arc::new(GitLabHost::new(config.gitlab.clone(), Arc::clone(&tools)));

    let channel: Arc<dyn MessageChannel> = match &config.telegram.bot_token {
        Some(token) => Arc::new(TelegramChannel::new(&config.telegram.api_url, token)),
        None => {
            warn!("TELEGRAM_BOT_TOKEN not set, status messages are only logged");
            Arc::new(LogOnlyChannel::new())
        }
    };

    let allowlist = Allowlist::load(config.allowlist_path.as_deref())?;

    // Initialize services
    let mut pipeline = DumpPipeline::new(&config, Arc::clone(&jobs), tools, checker, host, channel)
        .with_allowlist(allowlist);

    match &config.gemini.api_key {
        Some(key) => {
            let analyzer: Arc<dyn FailureAnalyzer> = Arc::new(
                GeminiAnalyzer::new(key.clone(), config.gemini.model.clone())
                    .context("Failed to create log analyzer")?,
            );
            pipeline = pipeline.with_analyzer(analyzer);
            info!("Failure analysis enabled ({})", config.gemini.model);
        }
        None => info!("GEMINI_API_KEY not set, failure analysis disabled"),
    }

    info!("Services initialized");

    // Create job poller
    let poller = JobPoller::new(config.clone(), jobs, Arc::new(pipeline));

    info!("Worker initialized successfully");
    info!(
        "Poll interval: {:?}, lease: {:?}, job timeout: {:?}",
        config.poll_interval, config.lease_duration, config.job_timeout
    );

    // Start polling loop
    info!("Starting job polling loop");
    if let Err(e) = poller.run().await {
        error!("Poller error: {}", e);
        return Err(e);
    }

    Ok(())
}

/// Loads and validates configuration from environment variables
///
/// Unset variables keep their defaults; malformed ones stop the worker.
fn load_config() -> Result<Config> {
    let config = Config::from_env().context("Invalid worker configuration")?;
    config.validate()?;
    Ok(config)
}

/// Waits for the orchestrator with exponential backoff
///
/// This handles the case where the orchestrator may not be ready yet when
/// the worker starts (common in container environments).
async fn wait_for_orchestrator(client: &OrchestratorClient) -> Result<()> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match client.health_check().await {
            Ok(()) => {
                if attempt > 1 {
                    info!("Orchestrator answered after {} attempt(s)", attempt);
                }
                return Ok(());
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Orchestrator unreachable after {} attempts", MAX_RETRIES);
                    return Err(anyhow::anyhow!("Orchestrator is not reachable: {}", e));
                }

                warn!(
                    "Orchestrator not ready (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
