//! Dump pipeline
//!
//! Drives one claimed job through its stages:
//!
//! ```text
//! queued → downloading → extracting → analyzing → publishing → completed
//! ```
//!
//! Every stage starts at a cancellation checkpoint and is recorded with the
//! orchestrator before any work happens. The first error ends the run; it is
//! turned into a typed outcome, reported in chat and stored on the job.

use dumper_core::domain::device::{DeviceInfo, RepositoryInfo};
use dumper_core::domain::error::ErrorKind;
use dumper_core::domain::job::{JobOutcome, JobStage};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::context::JobContext;
use crate::repository::gemini::FailureAnalyzer;
use crate::repository::gitlab::RepositoryHost;
use crate::repository::jobs::{JobRepository, is_retryable};
use crate::repository::reachability::UrlChecker;
use crate::repository::telegram::{ChatId, MessageChannel};
use crate::repository::tools::ToolRunner;
use crate::service::analysis;
use crate::service::boot::BootImageService;
use crate::service::download::DownloadService;
use crate::service::error::StageError;
use crate::service::extract::ExtractService;
use crate::service::properties::DeviceProperties;
use crate::service::publish::PublishService;
use crate::service::retry::{RetryPolicy, with_backoff};
use crate::service::status::{
    Allowlist, StatusBoard, StatusHeader, Step, format_announcement, should_announce,
};

/// Runs dump jobs end to end
pub struct DumpPipeline {
    jobs: Arc<dyn JobRepository>,
    download: DownloadService,
    extract: ExtractService,
    boot: BootImageService,
    publish: PublishService,
    channel: Arc<dyn MessageChannel>,
    analyzer: Option<Arc<dyn FailureAnalyzer>>,
    allowlist: Allowlist,
    worker_id: String,
    announce_channel: String,
    job_timeout: Duration,
    record_retry: RetryPolicy,
}

impl DumpPipeline {
    /// Creates a pipeline from its collaborators
    ///
    /// # Arguments
    /// * `config` - Worker configuration (toolkit location, timeouts, channel)
    /// * `jobs` - Job store the stages are recorded in
    /// * `tools` - Runner for every external program
    /// * `checker` - Mirror reachability checks
    /// * `host` - Repository host the dump is published to
    /// * `channel` - Chat transport for status messages
    pub fn new(
        config: &Config,
        jobs: Arc<dyn JobRepository>,
        tools: Arc<dyn ToolRunner>,
        checker: Arc<dyn UrlChecker>,
        host: Arc<dyn RepositoryHost>,
        channel: Arc<dyn MessageChannel>,
    ) -> Self {
        Self {
            jobs,
            download: DownloadService::new(Arc::clone(&tools), checker),
            extract: ExtractService::new(
                Arc::clone(&tools),
                config.extractor_home.clone(),
                config.partition_failure_policy,
            ),
            boot: BootImageService::new(Arc::clone(&tools), config.extractor_home.clone()),
            publish: PublishService::new(host, tools),
            channel,
            analyzer: None,
            allowlist: Allowlist::default(),
            worker_id: config.worker_id.clone(),
            announce_channel: config.telegram.announce_channel.clone(),
            job_timeout: config.job_timeout,
            record_retry: RetryPolicy::API,
        }
    }

    /// Enables failure analysis
    pub fn with_analyzer(mut self, analyzer: Arc<dyn FailureAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Backoff used when recording the final progress and outcome
    pub fn with_record_retry(mut self, retry: RetryPolicy) -> Self {
        self.record_retry = retry;
        self
    }

    /// URLs whose dumps are not announced
    pub fn with_allowlist(mut self, allowlist: Allowlist) -> Self {
        self.allowlist = allowlist;
        self
    }

    /// Runs the job to a terminal state and records it
    ///
    /// Never fails: every error becomes part of the returned outcome.
    pub async fn run(&self, ctx: &JobContext) -> JobOutcome {
        let board = StatusBoard::new(
            Arc::clone(&self.channel),
            StatusHeader::new(ctx, &self.worker_id),
        );

        let result = match tokio::time::timeout(self.job_timeout, self.execute(ctx, &board)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::failed(
                ErrorKind::Timeout,
                format!("Job exceeded {}s", self.job_timeout.as_secs()),
            )),
        };

        let outcome = match result {
            Ok(repository) => JobOutcome::Completed { repository },
            Err(e) => self.report_failure(ctx, &board, e).await,
        };

        self.send_remaining_progress(ctx).await;

        let recorded = with_backoff(&self.record_retry, "Recording outcome", is_retryable, || {
            self.jobs.finish(ctx.job_id, outcome.clone())
        })
        .await;
        if let Err(e) = recorded {
            error!("Failed to record outcome of job {}: {:#}", ctx.job_id, e);
        }

        info!(
            "Job {} finished as {}",
            ctx.job_id,
            outcome.terminal_stage()
        );
        outcome
    }

    async fn execute(&self, ctx: &JobContext, board: &StatusBoard) -> Result<RepositoryInfo, StageError> {
        self.enter(ctx, JobStage::Downloading).await?;
        board.step(ctx, Step::Setup).await;
        board.step(ctx, Step::Download).await;
        let firmware = self.download.download(ctx).await?;
        board.retain(format!("📦 {}", firmware.summary())).await;

        self.enter(ctx, JobStage::Extracting).await?;
        board.step(ctx, Step::Extract).await;
        self.extract.extract(ctx, &firmware.path).await?;
        board.step(ctx, Step::BootImages).await;
        self.boot.process(ctx).await;

        self.enter(ctx, JobStage::Analyzing).await?;
        board.step(ctx, Step::Properties).await;
        let props = self.resolve_properties(ctx).await?;
        let device = props.to_device_info();
        ctx.log_info(format!(
            "Detected {} {} ({})",
            device.brand, device.codename, props.branch
        ));
        self.jobs.set_device_info(ctx.job_id, device.clone()).await?;
        board.step(ctx, Step::FileGeneration).await;
        self.generate_files(ctx).await;

        self.enter(ctx, JobStage::Publishing).await?;
        board.step(ctx, Step::DeviceTree).await;
        self.publish.generate_device_tree(ctx).await;
        board.step(ctx, Step::GitLab).await;
        let repository = self.publish.publish(ctx, &props).await?;
        self.jobs
            .set_repository_info(ctx.job_id, repository.clone())
            .await?;

        board.step(ctx, Step::Notification).await;
        self.announce(ctx, &device, &repository.url).await;
        board.complete(ctx, &repository.url, &device).await;

        Ok(repository)
    }

    /// Cancellation checkpoint followed by the stage transition
    async fn enter(&self, ctx: &JobContext, stage: JobStage) -> Result<(), StageError> {
        if ctx.is_cancel_requested() {
            return Err(StageError::Cancelled);
        }

        self.jobs.advance_stage(ctx.job_id, stage).await?;
        ctx.set_stage(stage);
        ctx.log_info(format!("Entering {}", stage));
        Ok(())
    }

    /// Property lookup walks the whole tree, so it runs off the async workers
    async fn resolve_properties(&self, ctx: &JobContext) -> Result<DeviceProperties, StageError> {
        let tree = ctx.tree_dir();
        tokio::task::spawn_blocking(move || DeviceProperties::resolve(&tree))
            .await
            .map_err(|e| {
                StageError::failed(
                    ErrorKind::Internal,
                    format!("Property resolution task failed: {}", e),
                )
            })?
    }

    /// board-info.txt and all_files.txt; failures are warnings
    async fn generate_files(&self, ctx: &JobContext) {
        let tree: PathBuf = ctx.tree_dir();
        let result = tokio::task::spawn_blocking(move || {
            let board_info = analysis::write_board_info(&tree);
            let file_list = analysis::write_file_list(&tree);
            (board_info, file_list)
        })
        .await;

        match result {
            Ok((board_info, file_list)) => {
                match board_info {
                    Ok(0) => ctx.log_info("No board information found"),
                    Ok(n) => ctx.log_info(format!("Wrote board-info.txt ({} entries)", n)),
                    Err(e) => ctx.log_warning(format!("Failed to write board-info.txt: {:#}", e)),
                }
                match file_list {
                    Ok(n) => ctx.log_info(format!("Listed {} files", n)),
                    Err(e) => ctx.log_warning(format!("Failed to write all_files.txt: {:#}", e)),
                }
            }
            Err(e) => ctx.log_warning(format!("File generation task failed: {}", e)),
        }
    }

    /// Posts the channel announcement unless the options or allowlist forbid it
    async fn announce(&self, ctx: &JobContext, device: &DeviceInfo, repo_url: &str) {
        let allowlisted = self.allowlist.contains(&ctx.url);
        if !should_announce(&ctx.options, allowlisted) {
            ctx.log_info("Skipping channel announcement");
            return;
        }

        let text = format_announcement(device, repo_url, Some(&ctx.url));
        let channel = ChatId::Username(self.announce_channel.clone());
        match self.channel.send(channel, &text).await {
            Ok(_) => ctx.log_info(format!("Announced in {}", self.announce_channel)),
            Err(e) => ctx.log_warning(format!("Channel announcement failed: {:#}", e)),
        }
    }

    /// Converts a stage error into the job outcome and tells the chat
    async fn report_failure(&self, ctx: &JobContext, board: &StatusBoard, e: StageError) -> JobOutcome {
        let mut outcome = e.into_outcome(ctx.stage());

        match &mut outcome {
            JobOutcome::Failed { error } => {
                ctx.log_error(format!("{}: {}", error.kind, error.message));
                error.analysis = self.analyze(ctx).await;
                board
                    .fail(ctx, &error.message, error.analysis.as_deref())
                    .await;
            }
            JobOutcome::Aborted { reason } => {
                ctx.log_warning(format!("Aborted: {}", reason));
                board.stop(ctx, &format!("Aborted: {}", reason)).await;
            }
            JobOutcome::Cancelled => {
                ctx.log_warning("Cancelled on request");
                board.stop(ctx, "Cancelled on request").await;
            }
            JobOutcome::Completed { .. } => {}
        }

        outcome
    }

    /// Last progress flush of a run, retried like the outcome itself
    async fn send_remaining_progress(&self, ctx: &JobContext) {
        let entries = ctx.drain_progress();
        if entries.is_empty() {
            return;
        }

        let sent = with_backoff(&self.record_retry, "Sending progress", is_retryable, || {
            self.jobs.append_progress(ctx.job_id, entries.clone())
        })
        .await;
        if let Err(e) = sent {
            warn!("Failed to send progress of job {}: {:#}", ctx.job_id, e);
            ctx.requeue_progress(entries);
        }
    }

    async fn analyze(&self, ctx: &JobContext) -> Option<String> {
        let analyzer = self.analyzer.as_ref()?;
        match analyzer.analyze(&ctx.transcript()).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("Failure analysis for job {} failed: {:#}", ctx.job_id, e);
                None
            }
        }
    }
}

/// Sends buffered progress entries; they are kept for the next try on failure
pub async fn flush_progress(jobs: &dyn JobRepository, ctx: &JobContext) {
    let entries = ctx.drain_progress();
    if entries.is_empty() {
        return;
    }

    if let Err(e) = jobs.append_progress(ctx.job_id, entries.clone()).await {
        warn!("Failed to send progress of job {}: {:#}", ctx.job_id, e);
        ctx.requeue_progress(entries);
    }
}
