//! External tool runner
//!
//! Every firmware operation (downloaders, extractors, boot image tools, git)
//! is an external program. This module is the single place that spawns them,
//! so the services above can be exercised against a scripted fake.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Upper bound for any single tool run without an explicit timeout
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(3600);

/// A fully described external program call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory; inherits the worker's when `None`
    pub cwd: Option<PathBuf>,
    /// Redirect stdout into this file instead of capturing it
    pub stdout_path: Option<PathBuf>,
    pub timeout: Duration,
}

impl ToolInvocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            stdout_path: None,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_path = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shell-like rendering for logs
    pub fn display(&self) -> String {
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

/// Result of a finished tool run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last non-empty stderr line, useful in short error messages
    pub fn error_summary(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| match self.exit_code {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            })
    }
}

/// Runs external programs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs the program to completion
    ///
    /// # Returns
    /// The exit status and captured output. Spawn failures (missing binary)
    /// and timeouts are errors.
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput>;
}

/// Runs tools as child processes of the worker
pub struct ProcessToolRunner;

impl ProcessToolRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcessToolRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        debug!("Running: {}", invocation.display());

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &invocation.cwd {
            command.current_dir(dir);
        }

        match &invocation.stdout_path {
            Some(path) => {
                let file = std::fs::File::create(path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                command.stdout(Stdio::from(file));
            }
            None => {
                command.stdout(Stdio::piped());
            }
        }

        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", invocation.program))?;

        let output = tokio::time::timeout(invocation.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "'{}' timed out after {:?}",
                    invocation.program,
                    invocation.timeout
                )
            })?
            .with_context(|| format!("Failed to wait for '{}'", invocation.program))?;

        Ok(ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs a tool and reports whether it exited with status 0
///
/// Spawn errors and timeouts count as failures and are logged at debug level.
pub async fn succeeded(runner: &dyn ToolRunner, invocation: &ToolInvocation) -> bool {
    match runner.run(invocation).await {
        Ok(output) => {
            if !output.success() {
                debug!(
                    "'{}' failed: {}",
                    invocation.display(),
                    output.error_summary()
                );
            }
            output.success()
        }
        Err(e) => {
            debug!("'{}' could not run: {:#}", invocation.display(), e);
            false
        }
    }
}

/// Renders a path as a tool argument
pub fn arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
