//! Gemini failure analysis
//!
//! Sends the progress transcript of a failed job to the Gemini REST API and
//! returns a short root cause summary for the failure notification.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Transcripts shorter than this carry too little to analyse
pub const MIN_LOG_CHARS: usize = 50;

/// Longer transcripts keep their head and tail only
pub const MAX_LOG_CHARS: usize = 50_000;

const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(120);

const ANALYSIS_PROMPT: &str = r#"You are reviewing the log of a firmware dump pipeline run that failed.
The pipeline downloads an Android firmware image, extracts its partitions and
boot images, reads device properties from build.prop files, publishes the
tree to a GitLab repository and then sends chat notifications.

Pipeline stages: Download, Extraction, Analysis, GitLab, Notification.
Failure categories: Network, Disk space, Unsupported format, Corrupted archive,
Missing tool, Authentication, Rate limit, Timeout, Configuration.

Identify the failure itself, not earlier warnings. Look for error exit codes,
tool error output and the last error entry. If the category already names the
stage, combine them (for example "Download failure") and leave the stage out.

Log:
```
{log}
```

Answer in exactly this format:
Root Cause: <one sentence>
Error Category: <category>
Pipeline Stage: <stage, only if different from the category>
"#;

/// Produces a human readable explanation of a failed run
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FailureAnalyzer: Send + Sync {
    /// Analyzes a failure transcript
    ///
    /// # Returns
    /// `None` when the transcript is too short or the model had nothing to say
    async fn analyze(&self, transcript: &str) -> Result<Option<String>>;
}

/// Gemini REST implementation of FailureAnalyzer
pub struct GeminiAnalyzer {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiAnalyzer {
    /// Creates a new analyzer
    ///
    /// # Arguments
    /// * `api_key` - Generative Language API key
    /// * `model` - Model name (e.g., "gemini-2.5-pro")
    pub fn new(api_key: String, model: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(ANALYSIS_TIMEOUT)
            .build()
            .context("Failed to build Gemini HTTP client")?;
        Ok(Self {
            client,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl FailureAnalyzer for GeminiAnalyzer {
    async fn analyze(&self, transcript: &str) -> Result<Option<String>> {
        let Some(log) = prepare_log(transcript) else {
            return Ok(None);
        };

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );
        let prompt = ANALYSIS_PROMPT.replace("{log}", &log);

        let response = self
            .client
            .post(&url)
            .query(&[("key", &self.api_key)])
            .json(&json!({
                "contents": [{ "parts": [{ "text": prompt }] }]
            }))
            .send()
            .await
            .context("Failed to reach Gemini")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini returned {}: {}", status, body);
        }

        let parsed = response
            .json::<GenerateResponse>()
            .await
            .context("Failed to parse Gemini response")?;

        let text = parsed
            .candidates
            .into_iter()
            .flat_map(|c| c.content.parts)
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");

        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        Ok(Some(format_analysis(text)))
    }
}

/// Trims a transcript to what is worth sending
///
/// Returns `None` below `MIN_LOG_CHARS`. Above `MAX_LOG_CHARS` the first and
/// last halves of the budget are kept around a truncation marker.
pub fn prepare_log(transcript: &str) -> Option<String> {
    if transcript.trim().chars().count() < MIN_LOG_CHARS {
        return None;
    }

    let chars: Vec<char> = transcript.chars().collect();
    if chars.len() <= MAX_LOG_CHARS {
        return Some(transcript.to_string());
    }

    let half = MAX_LOG_CHARS / 2;
    let head: String = chars[..half].iter().collect();
    let tail: String = chars[chars.len() - half..].iter().collect();
    Some(format!("{}\n\n... [LOG TRUNCATED] ...\n\n{}", head, tail))
}

/// Bolds the labelled lines and drops a stage that repeats the category
pub fn format_analysis(raw: &str) -> String {
    let mut lines = Vec::new();
    let mut category = String::new();
    let mut stage = String::new();

    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix("Root Cause:") {
            lines.push(format!("*Root Cause:* {}", rest.trim()));
        } else if let Some(rest) = line.strip_prefix("Error Category:") {
            category = rest.trim().to_string();
            lines.push(format!("*Error Category:* {}", category));
        } else if let Some(rest) = line.strip_prefix("Pipeline Stage:") {
            stage = rest.trim().to_string();
        } else {
            lines.push(line.to_string());
        }
    }

    let stage_lower = stage.to_lowercase();
    if !stage.is_empty()
        && stage != "N/A"
        && stage != "-"
        && !category.to_lowercase().contains(&stage_lower)
    {
        lines.push(format!("*Pipeline Stage:* {}", stage));
    }

    lines.join("\n")
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_logs_are_skipped() {
        assert!(prepare_log("   too short   ").is_none());
        assert!(prepare_log(&"x".repeat(MIN_LOG_CHARS)).is_some());
    }

    #[test]
    fn test_long_logs_keep_head_and_tail() {
        let log = format!("{}{}", "a".repeat(40_000), "b".repeat(40_000));
        let prepared = prepare_log(&log).unwrap();

        assert!(prepared.starts_with(&"a".repeat(25_000)));
        assert!(prepared.ends_with(&"b".repeat(25_000)));
        assert!(prepared.contains("[LOG TRUNCATED]"));
        assert!(prepared.len() < log.len());
    }

    #[test]
    fn test_format_analysis_hides_redundant_stage() {
        let raw = "Root Cause: aria2c and wget both got HTTP 403\nError Category: Download failure\nPipeline Stage: Download";
        let formatted = format_analysis(raw);

        assert_eq!(
            formatted,
            "*Root Cause:* aria2c and wget both got HTTP 403\n*Error Category:* Download failure"
        );
    }

    #[test]
    fn test_format_analysis_keeps_distinct_stage() {
        let raw = "Root Cause: disk full\nError Category: Disk space\nPipeline Stage: Extraction";
        assert!(format_analysis(raw).ends_with("*Pipeline Stage:* Extraction"));
    }

    #[test]
    fn test_response_text_extraction() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"Root Cause: x"}],"role":"model"}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed.candidates[0].content.parts[0].text.as_deref(),
            Some("Root Cause: x")
        );
    }
}
