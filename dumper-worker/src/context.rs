//! Execution context for dump jobs
//!
//! Contains all state owned by one running job:
//! - Identity, URL and option flags of the job
//! - The stage the job is currently in
//! - Progress buffer, drained periodically to the orchestrator
//! - Full transcript, kept for failure analysis
//! - Cancellation flag, raised by the lease heartbeat
//! - Per-job working directories

use dumper_core::domain::job::{Job, JobOptions, JobStage, NotificationContext};
use dumper_core::domain::progress::{LogLevel, ProgressEntry};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Execution context shared across one pipeline run
pub struct JobContext {
    pub job_id: Uuid,
    pub url: String,
    pub options: JobOptions,
    pub notification: NotificationContext,

    /// Root of this job's temporary directory
    workdir: PathBuf,

    stage: Mutex<JobStage>,

    /// Entries not yet sent to the orchestrator
    progress_buffer: Mutex<Vec<ProgressEntry>>,

    /// Every entry of this run, in order
    transcript: Mutex<Vec<ProgressEntry>>,

    cancel_requested: Arc<AtomicBool>,

    started: Instant,
}

impl JobContext {
    /// Creates a new execution context
    ///
    /// # Arguments
    /// * `job` - The claimed job
    /// * `workdir` - Empty directory owned by this job
    pub fn new(job: &Job, workdir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            job_id: job.job_id,
            url: job.url.clone(),
            options: job.options,
            notification: job.notification_context.clone(),
            workdir,
            stage: Mutex::new(job.stage),
            progress_buffer: Mutex::new(Vec::new()),
            transcript: Mutex::new(Vec::new()),
            cancel_requested: Arc::new(AtomicBool::new(job.cancel_requested)),
            started: Instant::now(),
        })
    }

    /// Directory the firmware is downloaded into
    pub fn download_dir(&self) -> PathBuf {
        self.workdir.join("download")
    }

    /// Directory the firmware is extracted into; this is what gets published
    pub fn tree_dir(&self) -> PathBuf {
        self.workdir.join("dump")
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn stage(&self) -> JobStage {
        *lock(&self.stage)
    }

    pub fn set_stage(&self, stage: JobStage) {
        *lock(&self.stage) = stage;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Flag shared with the heartbeat task
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_requested)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Adds an entry to the progress buffer and the transcript
    pub fn add_entry(&self, entry: ProgressEntry) {
        lock(&self.transcript).push(entry.clone());
        lock(&self.progress_buffer).push(entry);
    }

    fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Error => error!("[job {}] {}", self.job_id, message),
            LogLevel::Warning => warn!("[job {}] {}", self.job_id, message),
            _ => info!("[job {}] {}", self.job_id, message),
        }
        self.add_entry(ProgressEntry::now(self.stage(), level, message));
    }

    /// Logs an info message
    pub fn log_info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message.into());
    }

    /// Logs a warning message
    pub fn log_warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message.into());
    }

    /// Logs an error message
    pub fn log_error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message.into());
    }

    /// Drains all buffered progress entries
    ///
    /// Returns all buffered entries and clears the buffer
    pub fn drain_progress(&self) -> Vec<ProgressEntry> {
        let mut buffer = lock(&self.progress_buffer);
        buffer.drain(..).collect()
    }

    /// Puts entries back at the front of the buffer after a failed send
    pub fn requeue_progress(&self, mut entries: Vec<ProgressEntry>) {
        let mut buffer = lock(&self.progress_buffer);
        entries.append(&mut buffer);
        *buffer = entries;
    }

    /// Renders every entry of this run, one per line
    pub fn transcript(&self) -> String {
        lock(&self.transcript)
            .iter()
            .map(|e| {
                format!(
                    "{} [{}] [{}] {}",
                    e.timestamp.format("%H:%M:%S"),
                    e.stage,
                    e.level.as_str(),
                    e.message
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Locks `mutex`, recovering the data if a holder panicked
///
/// Guarded values are consistent between statements.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            Uuid::new_v4(),
            "https://example.com/fw.zip".to_string(),
            JobOptions::default(),
            NotificationContext::default(),
            chrono::Utc::now(),
        )
    }

    #[test]
    fn test_entries_carry_current_stage() {
        let ctx = JobContext::new(&job(), PathBuf::from("/tmp/job"));
        ctx.log_info("claimed");
        ctx.set_stage(JobStage::Downloading);
        ctx.log_warning("mirror slow");

        let entries = ctx.drain_progress();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].stage, JobStage::Queued);
        assert_eq!(entries[1].stage, JobStage::Downloading);
        assert_eq!(entries[1].level, LogLevel::Warning);
        assert!(ctx.drain_progress().is_empty());
    }

    #[test]
    fn test_requeue_keeps_order() {
        let ctx = JobContext::new(&job(), PathBuf::from("/tmp/job"));
        ctx.log_info("one");
        let first = ctx.drain_progress();
        ctx.log_info("two");
        ctx.requeue_progress(first);

        let messages: Vec<_> = ctx.drain_progress().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["one", "two"]);
    }

    #[test]
    fn test_transcript_survives_drain() {
        let ctx = JobContext::new(&job(), PathBuf::from("/tmp/job"));
        ctx.log_error("aria2c exited with 3");
        ctx.drain_progress();

        assert!(ctx.transcript().contains("[Error] aria2c exited with 3"));
    }

    #[test]
    fn test_directories_live_under_workdir() {
        let ctx = JobContext::new(&job(), PathBuf::from("/tmp/job"));
        assert_eq!(ctx.download_dir(), PathBuf::from("/tmp/job/download"));
        assert_eq!(ctx.tree_dir(), PathBuf::from("/tmp/job/dump"));
    }

    #[test]
    fn test_logging_survives_a_poisoned_buffer() {
        let ctx = JobContext::new(&job(), PathBuf::from("/tmp/job"));
        ctx.log_info("before");

        let shared = Arc::clone(&ctx);
        let _ = std::thread::spawn(move || {
            let _guard = shared.progress_buffer.lock().unwrap();
            panic!("progress writer died");
        })
        .join();
        assert!(ctx.progress_buffer.is_poisoned());

        ctx.log_info("after");
        ctx.set_stage(JobStage::Extracting);

        let messages: Vec<_> = ctx.drain_progress().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["before", "after"]);
        assert_eq!(ctx.stage(), JobStage::Extracting);
    }
}
