//! GitLab repository host
//!
//! Handles communication with the dump GitLab instance:
//! - Looking up or creating the vendor subgroup and the device project
//! - Checking whether a firmware branch was already published
//! - Pushing the extracted tree with git
//! - Switching the project's default branch

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::GitLabConfig;
use crate::repository::tools::{ToolInvocation, ToolRunner};

/// Errors returned by a repository host
#[derive(Debug, Error)]
pub enum HostError {
    #[error("GitLab request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("GitLab API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("git {step} failed: {message}")]
    Git { step: &'static str, message: String },

    #[error("DUMPER_TOKEN is not configured")]
    MissingToken,

    #[error("Invalid GitLab server: {0}")]
    InvalidServer(String),
}

impl HostError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            HostError::Transport(_) => true,
            HostError::Api { status, .. } => *status >= 500 || *status == 429,
            HostError::Git { .. } | HostError::MissingToken | HostError::InvalidServer(_) => false,
        }
    }
}

/// Everything needed to publish one extracted tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    /// Root of the extracted firmware tree
    pub tree: PathBuf,
    pub namespace: String,
    pub project: String,
    pub branch: String,
    /// Commit message (the build description)
    pub message: String,
}

/// Source hosting operations used by the publisher
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepositoryHost: Send + Sync {
    /// Returns the id of the vendor subgroup, creating it when missing
    async fn get_or_create_namespace(&self, subgroup: &str) -> Result<u64, HostError>;

    /// Returns the id of the device project, creating it when missing
    ///
    /// # Arguments
    /// * `namespace_id` - Id returned by `get_or_create_namespace`
    /// * `namespace` - Path of the subgroup
    /// * `project` - Project path (the device codename)
    async fn get_or_create_project(
        &self,
        namespace_id: u64,
        namespace: &str,
        project: &str,
    ) -> Result<u64, HostError>;

    async fn branch_exists(&self, project_id: u64, branch: &str) -> Result<bool, HostError>;

    /// Commits the whole tree and pushes it as a new branch
    async fn push(&self, request: &PushRequest) -> Result<(), HostError>;

    async fn set_default_branch(&self, project_id: u64, branch: &str) -> Result<(), HostError>;

    /// Browsable URL of a published branch
    fn repository_url(&self, namespace: &str, project: &str, branch: &str) -> String;
}

/// GitLab implementation of RepositoryHost
pub struct GitLabHost {
    client: Client,
    config: GitLabConfig,
    tools: Arc<dyn ToolRunner>,
}

impl GitLabHost {
    /// Creates a new GitLab host
    ///
    /// # Arguments
    /// * `config` - Server, organisation and token
    /// * `tools` - Runner used for the git commands of `push`
    pub fn new(config: GitLabConfig, tools: Arc<dyn ToolRunner>) -> Self {
        Self {
            client: Client::new(),
            config,
            tools,
        }
    }

    /// API endpoint built from path segments
    ///
    /// Each segment is percent-encoded on its own, so a `/` inside a
    /// namespaced path or a branch name never splits the route.
    fn api_url(&self, segments: &[&str]) -> Result<Url, HostError> {
        let invalid = || HostError::InvalidServer(self.config.server.clone());

        let mut url = Url::parse(&format!("https://{}/api/v4", self.config.server))
            .map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .extend(segments);
        Ok(url)
    }

    fn token(&self) -> Result<&str, HostError> {
        self.config.token.as_deref().ok_or(HostError::MissingToken)
    }

    /// GETs a group or project by full path and returns its id when it exists
    async fn lookup_id(&self, kind: &str, full_path: &str) -> Result<Option<u64>, HostError> {
        let response = self
            .client
            .get(self.api_url(&[kind, full_path])?)
            .bearer_auth(self.token()?)
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(Some(response.json::<IdResponse>().await?.id)),
            404 => Ok(None),
            status => Err(api_error(status, response).await),
        }
    }

    async fn lookup_namespace(&self, subgroup: &str) -> Result<Option<u64>, HostError> {
        self.lookup_id("groups", &format!("{}/{}", self.config.org, subgroup))
            .await
    }

    async fn git(&self, request: &PushRequest, step: &'static str, args: &[&str]) -> Result<(), HostError> {
        let invocation = ToolInvocation::new("git", args.iter().copied()).current_dir(&request.tree);

        let output = self.tools.run(&invocation).await.map_err(|e| HostError::Git {
            step,
            message: format!("{:#}", e),
        })?;

        if !output.success() {
            return Err(HostError::Git {
                step,
                message: output.error_summary(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl RepositoryHost for GitLabHost {
    async fn get_or_create_namespace(&self, subgroup: &str) -> Result<u64, HostError> {
        if let Some(id) = self.lookup_namespace(subgroup).await? {
            debug!("Subgroup {} exists with id {}", subgroup, id);
            return Ok(id);
        }

        info!("Creating subgroup {}/{}", self.config.org, subgroup);

        let response = self
            .client
            .post(self.api_url(&["groups"])?)
            .bearer_auth(self.token()?)
            .form(&[
                ("name", capitalize(subgroup)),
                ("parent_id", self.config.parent_group_id.to_string()),
                ("path", subgroup.to_string()),
                ("visibility", "public".to_string()),
            ])
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(response.json::<IdResponse>().await?.id);
        }

        // A concurrent worker may have created it in the meantime
        let err = api_error(response.status().as_u16(), response).await;
        match self.lookup_namespace(subgroup).await? {
            Some(id) => {
                warn!("Subgroup creation failed but {} now exists: {}", subgroup, err);
                Ok(id)
            }
            None => Err(err),
        }
    }

    async fn get_or_create_project(
        &self,
        namespace_id: u64,
        namespace: &str,
        project: &str,
    ) -> Result<u64, HostError> {
        let path = format!("{}/{}/{}", self.config.org, namespace, project);
        if let Some(id) = self.lookup_id("projects", &path).await? {
            debug!("Project {}/{} exists with id {}", namespace, project, id);
            return Ok(id);
        }

        info!("Creating project {}/{}", namespace, project);

        let response = self
            .client
            .post(self.api_url(&["projects"])?)
            .bearer_auth(self.token()?)
            .form(&[
                ("namespace_id", namespace_id.to_string()),
                ("name", project.to_string()),
                ("visibility", "public".to_string()),
            ])
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(response.json::<IdResponse>().await?.id);
        }

        let err = api_error(response.status().as_u16(), response).await;
        match self.lookup_id("projects", &path).await? {
            Some(id) => Ok(id),
            None => Err(err),
        }
    }

    async fn branch_exists(&self, project_id: u64, branch: &str) -> Result<bool, HostError> {
        let project_id = project_id.to_string();
        let url = self.api_url(&["projects", &project_id, "repository", "branches", branch])?;

        let response = self
            .client
            .get(url)
            .bearer_auth(self.token()?)
            .send()
            .await?;

        match response.status().as_u16() {
            200 => {
                let found = response.json::<BranchResponse>().await?;
                Ok(found.name == branch)
            }
            404 => Ok(false),
            status => Err(api_error(status, response).await),
        }
    }

    async fn push(&self, request: &PushRequest) -> Result<(), HostError> {
        let email = format!("dumper@{}", self.config.server);
        let remote = format!(
            "{}:{}/{}/{}.git",
            self.config.push_host, self.config.org, request.namespace, request.project
        );
        let refspec = format!("HEAD:refs/heads/{}", request.branch);

        info!("Pushing {} to {}", request.branch, remote);

        self.git(request, "init", &["init", "--initial-branch", &request.branch])
            .await?;
        self.git(request, "config", &["config", "user.name", "dumper"])
            .await?;
        self.git(request, "config", &["config", "user.email", &email])
            .await?;
        self.git(request, "add", &["add", "--ignore-errors", "-A"])
            .await?;
        self.git(
            request,
            "commit",
            &["commit", "--quiet", "--signoff", "--message", &request.message],
        )
        .await?;
        self.git(request, "push", &["push", &remote, &refspec]).await?;

        Ok(())
    }

    async fn set_default_branch(&self, project_id: u64, branch: &str) -> Result<(), HostError> {
        let response = self
            .client
            .put(self.api_url(&["projects", &project_id.to_string()])?)
            .bearer_auth(self.token()?)
            .form(&[("default_branch", branch)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response.status().as_u16(), response).await);
        }

        Ok(())
    }

    fn repository_url(&self, namespace: &str, project: &str, branch: &str) -> String {
        format!(
            "https://{}/{}/{}/{}/tree/{}",
            self.config.server, self.config.org, namespace, project, branch
        )
    }
}

async fn api_error(status: u16, response: reqwest::Response) -> HostError {
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    HostError::Api { status, message }
}

/// Uppercases the first character, as GitLab group display names do
fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    name: String,
}
