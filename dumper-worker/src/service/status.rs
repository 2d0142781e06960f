//! Chat status reporting
//!
//! Each job owns one live status message that is edited as the pipeline
//! advances. The message body has two parts: retained lines, which stay
//! once written, and a live line that the next update overwrites.

use anyhow::{Context, Result};
use dumper_core::domain::device::DeviceInfo;
use dumper_core::domain::job::JobOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::context::JobContext;
use crate::repository::telegram::{ChatId, MessageChannel, MessageRef};

const TOTAL_STEPS: u8 = 10;
const URL_DISPLAY_LIMIT: usize = 60;
const PRIVATE_URL: &str = "(private)";

/// Pipeline steps as shown in the progress bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Setup,
    Download,
    Extract,
    BootImages,
    Properties,
    FileGeneration,
    DeviceTree,
    GitLab,
    Notification,
    Completed,
}

impl Step {
    pub fn number(&self) -> u8 {
        match self {
            Step::Setup => 1,
            Step::Download => 2,
            Step::Extract => 3,
            Step::BootImages => 4,
            Step::Properties => 5,
            Step::FileGeneration => 6,
            Step::DeviceTree => 7,
            Step::GitLab => 8,
            Step::Notification => 9,
            Step::Completed => 10,
        }
    }

    pub fn percent(&self) -> u8 {
        self.number() * 10
    }

    /// Live line shown while the step runs
    pub fn text(&self) -> &'static str {
        match self {
            Step::Setup => "🔍 Validating URL and setting up environment...",
            Step::Download => "📥 Downloading firmware...",
            Step::Extract => "📦 Extracting firmware partitions...",
            Step::BootImages => "🥾 Processing boot images...",
            Step::Properties => "📋 Extracting device properties...",
            Step::FileGeneration => "📄 Generating board info and file listings...",
            Step::DeviceTree => "🌳 Generating device tree...",
            Step::GitLab => "🗂️ Creating GitLab repository...",
            Step::Notification => "📢 Sending channel notification...",
            Step::Completed => "✅ *Dump completed successfully!*",
        }
    }
}

/// Where the job stands, as rendered in the header and progress bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running(Step),
    Failed,
    /// Aborted or cancelled
    Stopped,
}

/// Fixed part of the status message
#[derive(Debug, Clone)]
pub struct StatusHeader {
    pub job_id: uuid::Uuid,
    pub url: String,
    pub options: JobOptions,
    pub worker_id: String,
}

impl StatusHeader {
    pub fn new(ctx: &JobContext, worker_id: &str) -> Self {
        Self {
            job_id: ctx.job_id,
            url: ctx.url.clone(),
            options: ctx.options,
            worker_id: worker_id.to_string(),
        }
    }
}

/// Renders the full status message
pub fn render_status(
    header: &StatusHeader,
    phase: Phase,
    body: &str,
    elapsed: Duration,
    error: Option<&str>,
) -> String {
    let (emoji, title, percent, step) = match phase {
        Phase::Failed => ("❌", "Firmware Dump Failed", 0, 0),
        Phase::Stopped => ("⏹️", "Firmware Dump Stopped", 0, 0),
        Phase::Running(step) if step.percent() >= 100 => {
            ("✅", "Firmware Dump Completed", step.percent(), step.number())
        }
        Phase::Running(step) => ("🚀", "Firmware Dump in Progress", step.percent(), step.number()),
    };

    let url = if header.options.private_mode {
        PRIVATE_URL.to_string()
    } else {
        format_url_display(&header.url)
    };

    let mut message = format!("{} *{}*\n\n", emoji, title);
    message.push_str(&format!("📥 *URL:* `{}`\n", url));
    message.push_str(&format!("🆔 *Job ID:* `{}`\n", header.job_id));

    let options = format_options(&header.options);
    if !options.is_empty() {
        message.push_str(&format!("⚙️ *Options:* {}\n", options.join(", ")));
    }

    message.push_str(&format!(
        "\n📊 *Progress:* [{}] {}% (Step {}/{})\n",
        progress_bar(percent),
        percent,
        step,
        TOTAL_STEPS
    ));
    message.push_str(body);
    message.push_str("\n\n");
    message.push_str(&format!("⏱️ *Elapsed:* {}\n", format_elapsed(elapsed)));
    message.push_str(&format!("👷 *Worker:* `{}`\n", header.worker_id));

    if let Some(error) = error {
        message.push_str(&format!("❌ *Error:* {}\n", error));
    }

    message
}

/// Ten-cell bar, one `=` per full ten percent
pub fn progress_bar(percent: u8) -> String {
    let filled = usize::from(percent.min(100) / 10);
    format!("{}{}", "=".repeat(filled), "-".repeat(10 - filled))
}

pub fn format_options(options: &JobOptions) -> Vec<&'static str> {
    let mut labels = Vec::new();
    if options.use_alternate_extractor {
        labels.push("Alt Dumper");
    }
    if options.add_to_blocklist {
        labels.push("Blacklist");
    }
    if options.private_mode {
        labels.push("Private");
    }
    labels
}

/// Shortens long URLs to 57 characters plus an ellipsis
pub fn format_url_display(url: &str) -> String {
    if url.chars().count() > URL_DISPLAY_LIMIT {
        let head: String = url.chars().take(URL_DISPLAY_LIMIT - 3).collect();
        format!("{}...", head)
    } else {
        url.to_string()
    }
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    if total < 60 {
        format!("{}s", total)
    } else if total < 3600 {
        format!("{}m {}s", total / 60, total % 60)
    } else {
        format!("{}h {}m", total / 3600, (total % 3600) / 60)
    }
}

/// Escapes text for Telegram's legacy Markdown
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '\\' | '*' | '_' | '`' | '{' | '}' | '[' | ']' | '(' | ')' | '#' | '+' | '-' | '.' | '!'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Channel post announcing a finished dump
pub fn format_announcement(device: &DeviceInfo, repo_url: &str, firmware_url: Option<&str>) -> String {
    let field = |value: Option<&str>| escape_markdown(value.unwrap_or("Unknown"));

    let mut message = format!(
        "*Brand*: `{}`\n*Device*: `{}`\n*Version*: `{}`\n*Fingerprint*: `{}`\n*Platform*: `{}`\n[[repo]({})]",
        field(Some(&device.brand)),
        field(Some(&device.codename)),
        field(device.android_version.as_deref()),
        field(device.fingerprint.as_deref()),
        field(device.platform.as_deref()),
        repo_url
    );
    if let Some(url) = firmware_url {
        message.push_str(&format!(" [[firmware]({})]", url));
    }
    message
}

/// Whether the finished dump gets a channel post
pub fn should_announce(options: &JobOptions, allowlisted: bool) -> bool {
    !options.private_mode && (!allowlisted || options.add_to_blocklist)
}

/// URL fragments whose dumps are not announced
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    entries: Vec<String>,
}

impl Allowlist {
    pub fn new(entries: Vec<String>) -> Self {
        Self { entries }
    }

    /// Reads one entry per line; a missing file is an empty list
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            warn!("Allowlist {} not found", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read allowlist {}", path.display()))?;
        let entries = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();

        info!("Loaded {} allowlist entries", entries.len());
        Ok(Self::new(entries))
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.iter().any(|entry| url.contains(entry.as_str()))
    }
}

/// Live status message of one job
pub struct StatusBoard {
    channel: Arc<dyn MessageChannel>,
    header: StatusHeader,
    message: Mutex<Option<MessageRef>>,
    retained: Mutex<Vec<String>>,
}

impl StatusBoard {
    pub fn new(channel: Arc<dyn MessageChannel>, header: StatusHeader) -> Self {
        Self {
            channel,
            header,
            message: Mutex::new(None),
            retained: Mutex::new(Vec::new()),
        }
    }

    /// Shows `step` with its default live line
    pub async fn step(&self, ctx: &JobContext, step: Step) {
        self.show(ctx, Phase::Running(step), step.text(), None).await;
    }

    /// Adds a line kept above every later live line
    pub async fn retain(&self, line: impl Into<String>) {
        self.retained.lock().await.push(line.into());
    }

    pub async fn complete(&self, ctx: &JobContext, repo_url: &str, device: &DeviceInfo) {
        let text = format!(
            "{}\n\n📁 *Repository:* {}\n📱 *Device:* {} {}",
            Step::Completed.text(),
            repo_url,
            escape_markdown(&device.brand),
            escape_markdown(&device.codename)
        );
        self.show(ctx, Phase::Running(Step::Completed), &text, None).await;
    }

    /// Final message of a job that did not complete
    pub async fn fail(&self, ctx: &JobContext, error: &str, analysis: Option<&str>) {
        let escaped = escape_markdown(error);
        let mut text = format!("❌ *Job failed:* {}", escaped);
        if let Some(analysis) = analysis {
            text.push_str(&format!("\n\n🔍 *Analysis:*\n{}", analysis));
        }
        self.show(ctx, Phase::Failed, &text, Some(&escaped)).await;
    }

    /// Final message of an aborted or cancelled job
    pub async fn stop(&self, ctx: &JobContext, reason: &str) {
        let text = format!("⏹️ *Job stopped:* {}", escape_markdown(reason));
        self.show(ctx, Phase::Stopped, &text, None).await;
    }

    async fn show(&self, ctx: &JobContext, phase: Phase, live: &str, error: Option<&str>) {
        let body = {
            let retained = self.retained.lock().await;
            let mut lines: Vec<&str> = retained.iter().map(String::as_str).collect();
            lines.push(live);
            lines.join("\n")
        };
        let text = render_status(&self.header, phase, &body, ctx.elapsed(), error);

        if let Err(e) = self.deliver(ctx, &text).await {
            ctx.log_warning(format!("Could not update status message: {:#}", e));
        }
    }

    /// Edits the live message, creating it on first use
    async fn deliver(&self, ctx: &JobContext, text: &str) -> Result<()> {
        let mut message = self.message.lock().await;

        if let Some(existing) = *message {
            return self.channel.edit(existing, text).await;
        }

        let notification = &ctx.notification;
        let report = notification.report_conversation_id;

        let created = match (notification.report_message_id, notification.origin_message_id) {
            (Some(message_id), _) => {
                let existing = MessageRef {
                    conversation_id: report,
                    message_id,
                };
                self.channel.edit(existing, text).await?;
                existing
            }
            (None, Some(origin_message)) => {
                let target = MessageRef {
                    conversation_id: notification.origin_conversation_id.unwrap_or(report),
                    message_id: origin_message,
                };
                self.channel.reply(report, target, text).await?
            }
            (None, None) => self.channel.send(ChatId::Id(report), text).await?,
        };

        *message = Some(created);
        Ok(())
    }
}
