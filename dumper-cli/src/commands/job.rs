//! Job command handlers
//!
//! Handles all job-related CLI commands: submitting URLs, inspecting and
//! listing jobs, cancelling them and reading their progress log.

use anyhow::{Result, anyhow};
use clap::{Args, Subcommand};
use colored::*;
use dumper_client::OrchestratorClient;
use dumper_core::domain::job::{CancelEffect, Job, JobOptions, JobStage, NotificationContext};
use dumper_core::domain::progress::{LogLevel, ProgressEntry};
use dumper_core::dto::job::EnqueueJob;
use std::time::Duration;

use crate::config::Config;
use crate::id_resolver::{JobRef, resolve_job_id};

/// Delay between polls while following a job
const FOLLOW_INTERVAL: Duration = Duration::from_secs(2);

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// Queue a firmware URL for dumping
    Enqueue(EnqueueArgs),
    /// Get job details
    Get {
        /// Job ID or unambiguous prefix
        id: JobRef,

        /// Print the raw JSON record
        #[arg(long)]
        json: bool,
    },
    /// List jobs
    List {
        /// Only jobs in this stage
        #[arg(long, value_parser = parse_stage)]
        stage: Option<JobStage>,
    },
    /// Request cancellation of a job
    Cancel {
        /// Job ID or unambiguous prefix
        id: JobRef,
    },
    /// Show the progress log of a job
    Progress {
        /// Job ID or unambiguous prefix
        id: JobRef,

        /// Keep polling until the job finishes
        #[arg(short, long)]
        follow: bool,
    },
}

#[derive(Args)]
pub struct EnqueueArgs {
    /// Firmware URL
    url: String,

    /// Conversation that receives status messages
    #[arg(long, env = "DUMPER_REPORT_CHAT", allow_negative_numbers = true)]
    chat: i64,

    /// Conversation the request came from, when different from --chat
    #[arg(long, requires = "origin_message", allow_negative_numbers = true)]
    origin_chat: Option<i64>,

    /// Message the request came from
    #[arg(long)]
    origin_message: Option<i64>,

    /// Use the partition-by-partition extractor
    #[arg(long)]
    alt: bool,

    /// Dump again even if the URL was already dumped
    #[arg(long)]
    force: bool,

    /// Announce the dump even if the URL is allowlisted
    #[arg(long)]
    blocklist: bool,

    /// Hide the URL and skip the public announcement
    #[arg(long)]
    private: bool,
}

impl EnqueueArgs {
    fn into_request(self) -> EnqueueJob {
        EnqueueJob {
            url: self.url,
            options: JobOptions {
                use_alternate_extractor: self.alt,
                force_redump: self.force,
                add_to_blocklist: self.blocklist,
                private_mode: self.private,
            },
            notification_context: NotificationContext {
                origin_conversation_id: self.origin_chat.or(self.origin_message.map(|_| self.chat)),
                origin_message_id: self.origin_message,
                report_conversation_id: self.chat,
                report_message_id: None,
            },
        }
    }
}

fn parse_stage(s: &str) -> Result<JobStage> {
    JobStage::parse(&s.to_lowercase()).ok_or_else(|| anyhow!("Unknown stage '{}'", s))
}

/// Handle job commands
///
/// Routes job subcommands to their respective handlers.
pub async fn handle_job_command(command: JobCommands, config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        JobCommands::Enqueue(args) => enqueue_job(&client, args).await,
        JobCommands::Get { id, json } => get_job(&client, &id, json).await,
        JobCommands::List { stage } => list_jobs(&client, stage).await,
        JobCommands::Cancel { id } => cancel_job(&client, &id).await,
        JobCommands::Progress { id, follow } => show_progress(&client, &id, follow).await,
    }
}

async fn enqueue_job(client: &OrchestratorClient, args: EnqueueArgs) -> Result<()> {
    match client.enqueue_job(args.into_request()).await {
        Ok(job) => {
            println!("{}", "✓ Job queued".green());
            print_job_details(&job);
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            println!("{}", "This URL has already been dumped.".yellow());
            println!("{}", "  Use --force to dump it again.".dimmed());
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn get_job(client: &OrchestratorClient, id: &JobRef, json: bool) -> Result<()> {
    let uuid = resolve_job_id(client, id).await?;
    let job = client.get_job(uuid).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_job_details(&job);
    }

    Ok(())
}

async fn list_jobs(client: &OrchestratorClient, stage: Option<JobStage>) -> Result<()> {
    let jobs = client.list_jobs(stage).await?;

    if jobs.is_empty() {
        println!("{}", "No jobs found.".yellow());
    } else {
        println!("{}", format!("Found {} job(s):", jobs.len()).bold());
        println!();
        for job in jobs {
            print_job_summary(&job);
        }
    }

    Ok(())
}

async fn cancel_job(client: &OrchestratorClient, id: &JobRef) -> Result<()> {
    let uuid = resolve_job_id(client, id).await?;
    let response = client.cancel_job(uuid).await?;

    match response.effect {
        CancelEffect::Cancelled => println!("{}", format!("✓ Job {} cancelled", uuid).green()),
        CancelEffect::Requested => println!(
            "{}",
            format!("✓ Cancellation requested, job {} stops at its next stage", uuid).green()
        ),
        CancelEffect::AlreadyCancelled => {
            println!("{}", format!("Job {} was already cancelled", uuid).yellow())
        }
    }
    println!("  Stage: {}", colorize_stage(response.job.stage));

    Ok(())
}

async fn show_progress(client: &OrchestratorClient, id: &JobRef, follow: bool) -> Result<()> {
    let uuid = resolve_job_id(client, id).await?;

    println!("{}", format!("Progress of job {}:", uuid).bold());
    println!("{}", "─".repeat(80).dimmed());

    let mut shown = 0;
    loop {
        let job = client.get_job(uuid).await?;

        for entry in job.progress_log.iter().skip(shown) {
            print_progress_entry(entry);
        }
        shown = shown.max(job.progress_log.len());

        if !follow || job.is_terminal() {
            println!("{}", "─".repeat(80).dimmed());
            println!("Stage: {}", colorize_stage(job.stage));
            return Ok(());
        }

        tokio::time::sleep(FOLLOW_INTERVAL).await;
    }
}

/// Print a one-block job summary
fn print_job_summary(job: &Job) {
    println!("  {} Job {}", "▸".cyan(), job.job_id.to_string().dimmed());
    println!("    URL:      {}", job.url);
    println!("    Stage:    {}", colorize_stage(job.stage));
    println!(
        "    Created:  {}",
        job.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    if let Some(worker) = &job.worker_id {
        println!("    Worker:   {}", worker.dimmed());
    }
    println!();
}

/// Print detailed job information
fn print_job_details(job: &Job) {
    println!("{}", "Job Details:".bold());
    println!("  ID:          {}", job.job_id.to_string().cyan());
    println!("  URL:         {}", job.url);
    println!("  Stage:       {}", colorize_stage(job.stage));
    if job.stage_attempts > 1 {
        println!("  Attempts:    {}", job.stage_attempts);
    }
    if job.cancel_requested && !job.is_terminal() {
        println!("  {}", "Cancellation requested".yellow());
    }
    println!("  Created:     {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));

    if let Some(started) = job.started_at {
        println!("  Started:     {}", started.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(completed) = job.completed_at {
        println!("  Completed:   {}", completed.format("%Y-%m-%d %H:%M:%S"));

        if let Some(started) = job.started_at {
            let seconds = completed.signed_duration_since(started).num_seconds();
            println!("  Duration:    {}s", seconds);
        }
    }

    if let Some(worker) = &job.worker_id {
        println!("  Worker:      {}", worker);
    }

    let options = option_names(&job.options);
    if !options.is_empty() {
        println!("  Options:     {}", options.join(", "));
    }

    if let Some(device) = &job.device_info {
        println!("\n{}", "Device:".bold());
        println!("  Brand:       {}", device.brand);
        println!("  Codename:    {}", device.codename.cyan());
        if let Some(version) = &device.android_version {
            println!("  Android:     {}", version);
        }
        if let Some(fingerprint) = &device.fingerprint {
            println!("  Fingerprint: {}", fingerprint.dimmed());
        }
    }

    if let Some(repository) = &job.repository_info {
        println!("\n{}", "Repository:".bold());
        println!("  Branch:      {}", repository.branch);
        println!("  URL:         {}", repository.url.cyan());
    }

    if let Some(error) = &job.error_context {
        println!("\n{}", "Error:".bold());
        println!("  Kind:        {}", error.kind.to_string().red());
        println!("  Stage:       {}", error.stage);
        println!("  {}", error.message.red());
        if let Some(analysis) = &error.analysis {
            println!("\n{}", "Analysis:".bold());
            println!("{}", analysis);
        }
    }
}

fn option_names(options: &JobOptions) -> Vec<&'static str> {
    [
        (options.use_alternate_extractor, "alt extractor"),
        (options.force_redump, "force"),
        (options.add_to_blocklist, "blocklist"),
        (options.private_mode, "private"),
    ]
    .into_iter()
    .filter_map(|(set, name)| set.then_some(name))
    .collect()
}

/// Print a progress entry
fn print_progress_entry(entry: &ProgressEntry) {
    let level_str = entry.level.as_str().to_uppercase();
    let level_colored = match entry.level {
        LogLevel::Debug => level_str.dimmed(),
        LogLevel::Info => level_str.cyan(),
        LogLevel::Warning => level_str.yellow(),
        LogLevel::Error => level_str.red(),
    };

    println!(
        "{} [{}] [{}] {}",
        entry.timestamp.format("%H:%M:%S").to_string().dimmed(),
        entry.stage.as_str().dimmed(),
        level_colored,
        entry.message
    );
}

/// Colorize a job stage for display
fn colorize_stage(stage: JobStage) -> ColoredString {
    let text = stage.as_str();
    match stage {
        JobStage::Queued => text.yellow(),
        JobStage::Downloading
        | JobStage::Extracting
        | JobStage::Analyzing
        | JobStage::Publishing => text.cyan(),
        JobStage::Completed => text.green(),
        JobStage::Failed => text.red(),
        JobStage::Aborted => text.magenta(),
        JobStage::Cancelled => text.dimmed(),
    }
}
