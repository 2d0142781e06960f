//! Job poller
//!
//! Claims queued jobs from the orchestrator and runs each one through the
//! dump pipeline in its own task. While a job runs, two companion tasks keep
//! it alive: the heartbeat renews the lease and picks up cancellation
//! requests, the progress sender streams buffered entries.

use anyhow::{Context as AnyhowContext, Result};
use dumper_core::domain::error::{ErrorContext, ErrorKind};
use dumper_core::domain::job::{Job, JobOutcome};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::context::JobContext;
use crate::repository::JobRepository;
use crate::service::DumpPipeline;
use crate::service::pipeline::flush_progress;

/// Job poller that continuously claims and executes jobs
pub struct JobPoller {
    config: Config,
    jobs: Arc<dyn JobRepository>,
    pipeline: Arc<DumpPipeline>,
    semaphore: Arc<Semaphore>,
}

impl JobPoller {
    /// Creates a new job poller
    pub fn new(config: Config, jobs: Arc<dyn JobRepository>, pipeline: Arc<DumpPipeline>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_jobs));
        Self {
            config,
            jobs,
            pipeline,
            semaphore,
        }
    }

    /// Starts the polling loop
    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting job poller (interval: {:?}, max parallel jobs: {})",
            self.config.poll_interval, self.config.max_parallel_jobs
        );

        let mut interval = time::interval(self.config.poll_interval);

        loop {
            interval.tick().await;

            debug!("Polling for queued jobs");

            match self.poll_and_execute_once().await {
                Ok(claimed) => {
                    if claimed > 0 {
                        info!("Claimed {} job(s) this cycle", claimed);
                    }
                }
                Err(e) => {
                    error!("Error during poll cycle: {:#}", e);
                }
            }
        }
    }

    /// Claims jobs until the queue is empty or every slot is busy
    ///
    /// # Returns
    /// The number of jobs started
    async fn poll_and_execute_once(&self) -> Result<usize> {
        let mut claimed = 0;

        loop {
            // A slot is reserved before claiming so a claimed job never waits
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                debug!("Max parallel jobs reached");
                break;
            };

            let job = self
                .jobs
                .claim_next(self.config.lease_duration)
                .await
                .context("Failed to claim job")?;

            let Some(job) = job else {
                debug!("No jobs available");
                break;
            };

            info!("Claimed job {} for {}", job.job_id, job.url);
            self.spawn_job_task(job, permit);
            claimed += 1;
        }

        Ok(claimed)
    }

    /// Spawns a task to execute a single job
    fn spawn_job_task(&self, job: Job, permit: OwnedSemaphorePermit) {
        let config = self.config.clone();
        let jobs = Arc::clone(&self.jobs);
        let pipeline = Arc::clone(&self.pipeline);

        tokio::spawn(async move {
            let job_id = job.job_id;
            if let Err(e) = Self::execute_job(job, &config, jobs, pipeline).await {
                error!("Failed to execute job {}: {:#}", job_id, e);
            }
            // Permit is released when dropped
            drop(permit);
        });
    }

    /// Runs one claimed job in a fresh work directory
    async fn execute_job(
        job: Job,
        config: &Config,
        jobs: Arc<dyn JobRepository>,
        pipeline: Arc<DumpPipeline>,
    ) -> Result<JobOutcome> {
        let workdir = match create_workdir(config, job.job_id) {
            Ok(dir) => dir,
            Err(e) => {
                let error = ErrorContext::new(job.stage, ErrorKind::Internal, format!("{:#}", e));
                jobs.finish(job.job_id, JobOutcome::Failed { error })
                    .await
                    .context("Failed to record outcome")?;
                return Err(e);
            }
        };

        let ctx = JobContext::new(&job, workdir.path().to_path_buf());
        ctx.log_info(format!("Claimed by worker {}", config.worker_id));

        let heartbeat = Self::spawn_heartbeat(
            Arc::clone(&jobs),
            Arc::clone(&ctx),
            config.lease_duration,
            config.heartbeat_interval(),
        );
        let progress_sender = Self::spawn_progress_sender(
            Arc::clone(&jobs),
            Arc::clone(&ctx),
            config.progress_send_interval,
        );

        let outcome = pipeline.run(&ctx).await;

        // Always stop the companions
        heartbeat.abort();
        progress_sender.abort();

        if let Err(e) = workdir.close() {
            warn!("Failed to remove work directory of job {}: {}", job.job_id, e);
        }

        Ok(outcome)
    }

    /// Renews the lease every `interval` and raises the cancellation flag
    fn spawn_heartbeat(
        jobs: Arc<dyn JobRepository>,
        ctx: Arc<JobContext>,
        lease: Duration,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            // The claim itself granted the first lease
            ticker.tick().await;

            loop {
                ticker.tick().await;

                match jobs.extend_lease(ctx.job_id, lease).await {
                    Ok(status) => {
                        if status.cancel_requested && !ctx.cancel_flag().swap(true, Ordering::SeqCst) {
                            ctx.log_warning("Cancellation requested");
                        }
                    }
                    Err(e) => warn!("Failed to extend lease of job {}: {:#}", ctx.job_id, e),
                }
            }
        })
    }

    /// Sends buffered progress every `interval`
    fn spawn_progress_sender(
        jobs: Arc<dyn JobRepository>,
        ctx: Arc<JobContext>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);

            loop {
                ticker.tick().await;
                flush_progress(jobs.as_ref(), &ctx).await;
            }
        })
    }
}

fn create_workdir(config: &Config, job_id: Uuid) -> Result<tempfile::TempDir> {
    std::fs::create_dir_all(&config.work_root)
        .with_context(|| format!("Failed to create {}", config.work_root.display()))?;

    tempfile::Builder::new()
        .prefix(&format!("dump-{}-", job_id))
        .tempdir_in(&config.work_root)
        .context("Failed to create work directory")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::jobs::MockJobRepository;
    use crate::repository::reachability::MockUrlChecker;
    use crate::testing::{FakeHost, FakeTools, MemoryJobStore, RecordingChannel, fail};
    use dumper_core::domain::job::{JobOptions, JobStage, NotificationContext};
    use dumper_core::dto::job::LeaseStatus;

    fn job() -> Job {
        Job::new(
            Uuid::new_v4(),
            "https://example.com/fw.zip".to_string(),
            JobOptions::default(),
            NotificationContext::default(),
            chrono::Utc::now(),
        )
    }

    fn config(root: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.work_root = root.join("work");
        config.extractor_home = root.join("toolkit");
        config
    }

    fn pipeline(config: &Config, jobs: Arc<dyn JobRepository>) -> Arc<DumpPipeline> {
        let mut checker = MockUrlChecker::new();
        checker.expect_head().never();
        Arc::new(DumpPipeline::new(
            config,
            jobs,
            FakeTools::new(|_| Ok(fail(1))),
            Arc::new(checker),
            FakeHost::new(),
            RecordingChannel::new(),
        ))
    }

    #[tokio::test]
    async fn test_empty_queue_claims_nothing() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());

        let mut jobs = MockJobRepository::new();
        jobs.expect_claim_next().times(1).returning(|_| Ok(None));
        let jobs: Arc<dyn JobRepository> = Arc::new(jobs);

        let poller = JobPoller::new(config.clone(), Arc::clone(&jobs), pipeline(&config, jobs));
        assert_eq!(poller.poll_and_execute_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_full_worker_does_not_claim() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());

        let mut jobs = MockJobRepository::new();
        jobs.expect_claim_next().never();
        let jobs: Arc<dyn JobRepository> = Arc::new(jobs);

        let poller = JobPoller::new(config.clone(), Arc::clone(&jobs), pipeline(&config, jobs));
        let _held = poller
            .semaphore
            .clone()
            .acquire_many_owned(config.max_parallel_jobs as u32)
            .await
            .unwrap();

        assert_eq!(poller.poll_and_execute_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_executed_job_is_finished_and_workdir_removed() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let job = job();
        let store = MemoryJobStore::new(job.clone());

        let outcome = JobPoller::execute_job(job, &config, store.clone(), pipeline(&config, store.clone()))
            .await
            .unwrap();

        let JobOutcome::Failed { error } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(error.kind, ErrorKind::DownloadFailed);
        assert_eq!(store.job().stage, JobStage::Failed);
        assert!(
            store
                .progress()
                .iter()
                .any(|e| e.message.starts_with("Claimed by worker"))
        );
        assert_eq!(std::fs::read_dir(&config.work_root).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_raises_cancel_flag() {
        let root = tempfile::tempdir().unwrap();
        let ctx = JobContext::new(&job(), root.path().to_path_buf());

        let mut jobs = MockJobRepository::new();
        jobs.expect_extend_lease().returning(|_, _| {
            Ok(LeaseStatus {
                cancel_requested: true,
            })
        });

        let heartbeat = JobPoller::spawn_heartbeat(
            Arc::new(jobs),
            Arc::clone(&ctx),
            Duration::from_secs(30),
            Duration::from_millis(10),
        );
        time::sleep(Duration::from_millis(100)).await;
        heartbeat.abort();

        assert!(ctx.is_cancel_requested());
        let warnings = ctx
            .drain_progress()
            .into_iter()
            .filter(|e| e.message == "Cancellation requested")
            .count();
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_failures_do_not_cancel() {
        let root = tempfile::tempdir().unwrap();
        let ctx = JobContext::new(&job(), root.path().to_path_buf());

        let mut jobs = MockJobRepository::new();
        jobs.expect_extend_lease()
            .returning(|_, _| Err(anyhow::anyhow!("connection refused")));

        let heartbeat = JobPoller::spawn_heartbeat(
            Arc::new(jobs),
            Arc::clone(&ctx),
            Duration::from_secs(30),
            Duration::from_millis(10),
        );
        time::sleep(Duration::from_millis(50)).await;
        heartbeat.abort();

        assert!(!ctx.is_cancel_requested());
    }
}
