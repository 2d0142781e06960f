//! URL reachability check
//!
//! Used to pick the fastest reachable download mirror.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Timeout for a single HEAD request
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Repository trait for checking candidate URLs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UrlChecker: Send + Sync {
    /// Issues a HEAD request
    ///
    /// # Returns
    /// The HTTP status code. Transport failures (DNS, connect, timeout) are errors.
    async fn head(&self, url: &str) -> Result<u16>;
}

/// reqwest implementation of UrlChecker
pub struct HttpUrlChecker {
    client: Client,
}

impl HttpUrlChecker {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(CHECK_TIMEOUT)
            .build()
            .context("Failed to build reachability HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UrlChecker for HttpUrlChecker {
    async fn head(&self, url: &str) -> Result<u16> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .with_context(|| format!("HEAD {} failed", url))?;

        Ok(response.status().as_u16())
    }
}
