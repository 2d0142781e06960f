//! Publication of an extracted tree
//!
//! The vendor subgroup and device project are created on demand. A branch
//! is never overwritten: when it already exists the job is aborted and
//! nothing is pushed.

use dumper_core::domain::device::RepositoryInfo;
use dumper_core::domain::error::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use crate::context::JobContext;
use crate::repository::gitlab::{HostError, PushRequest, RepositoryHost};
use crate::repository::tools::{ToolInvocation, ToolRunner};
use crate::service::analysis::DEVICE_TREE_DIR;
use crate::service::error::StageError;
use crate::service::properties::DeviceProperties;
use crate::service::retry::{RetryPolicy, with_backoff};

const DEVICE_TREE_TIMEOUT: Duration = Duration::from_secs(180);

pub struct PublishService {
    host: Arc<dyn RepositoryHost>,
    tools: Arc<dyn ToolRunner>,
    retry: RetryPolicy,
}

impl PublishService {
    pub fn new(host: Arc<dyn RepositoryHost>, tools: Arc<dyn ToolRunner>) -> Self {
        Self {
            host,
            tools,
            retry: RetryPolicy::API,
        }
    }

    /// Overrides the retry policy for API calls
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Generates an AOSP device tree into the dump; failure is only a warning
    pub async fn generate_device_tree(&self, ctx: &JobContext) {
        let tree = ctx.tree_dir();
        if let Err(e) = std::fs::create_dir_all(tree.join(DEVICE_TREE_DIR)) {
            ctx.log_warning(format!("Could not create {}: {}", DEVICE_TREE_DIR, e));
            return;
        }

        let invocation = ToolInvocation::new(
            "uvx",
            ["aospdtgen@1.1.1", ".", "--output", "./aosp-device-tree"],
        )
        .current_dir(&tree)
        .timeout(DEVICE_TREE_TIMEOUT);

        match self.tools.run(&invocation).await {
            Ok(output) if output.success() => ctx.log_info("Device tree generated"),
            Ok(output) => ctx.log_warning(format!(
                "Failed to generate device tree: {}",
                output.error_summary()
            )),
            Err(e) => ctx.log_warning(format!("Failed to generate device tree: {:#}", e)),
        }
    }

    /// Pushes the tree as a new branch of the device project
    ///
    /// # Errors
    /// `StageError::Conflict` when the branch already exists, a
    /// `publish_api_error` failure for anything the host rejects.
    pub async fn publish(
        &self,
        ctx: &JobContext,
        props: &DeviceProperties,
    ) -> Result<RepositoryInfo, StageError> {
        let namespace = props.repo_subgroup.as_str();
        let project = props.repo_name.as_str();
        let branch = props.branch.as_str();

        let namespace_id = self
            .call("namespace lookup", || self.host.get_or_create_namespace(namespace))
            .await?;
        let project_id = self
            .call("project lookup", || {
                self.host.get_or_create_project(namespace_id, namespace, project)
            })
            .await?;

        let exists = self
            .call("branch lookup", || self.host.branch_exists(project_id, branch))
            .await?;
        if exists {
            return Err(StageError::Conflict(format!(
                "Branch {} already exists in {}/{}",
                branch, namespace, project
            )));
        }

        ctx.log_info(format!("Pushing {}/{} branch {}", namespace, project, branch));
        let request = PushRequest {
            tree: ctx.tree_dir(),
            namespace: namespace.to_string(),
            project: project.to_string(),
            branch: branch.to_string(),
            message: props.description.clone(),
        };
        self.host.push(&request).await.map_err(host_failure)?;

        let result = self
            .call("default branch update", || {
                self.host.set_default_branch(project_id, branch)
            })
            .await;
        if let Err(e) = result {
            ctx.log_warning(format!("Could not set default branch: {}", e));
        }

        let url = self.host.repository_url(namespace, project, branch);
        ctx.log_info(format!("Published to {}", url));
        Ok(props.repository_info(url))
    }

    async fn call<T, F, Fut>(&self, label: &str, op: F) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, HostError>>,
    {
        with_backoff(&self.retry, label, HostError::is_transient, op)
            .await
            .map_err(host_failure)
    }
}

fn host_failure(e: HostError) -> StageError {
    StageError::failed(ErrorKind::PublishApiError, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::gitlab::MockRepositoryHost;
    use crate::testing::{FakeHost, FakeTools, fail};
    use dumper_core::domain::job::{Job, JobOptions, NotificationContext};
    use uuid::Uuid;

    const INSTANT: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };

    fn context(root: &std::path::Path) -> Arc<JobContext> {
        let job = Job::new(
            Uuid::new_v4(),
            "https://example.com/fw.zip".to_string(),
            JobOptions::default(),
            NotificationContext::default(),
            chrono::Utc::now(),
        );
        JobContext::new(&job, root.to_path_buf())
    }

    fn properties() -> DeviceProperties {
        DeviceProperties {
            codename: "marble".to_string(),
            description: "marble-user 14 UKQ1 V816 release-keys".to_string(),
            branch: "marble-user-14-UKQ1-V816-release-keys".to_string(),
            repo_subgroup: "xiaomi".to_string(),
            repo_name: "marble".to_string(),
            top_codename: "marble".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_second_publish_of_same_branch_is_a_conflict() {
        let root = tempfile::tempdir().unwrap();
        let host = FakeHost::new();
        let service = PublishService::new(host.clone(), FakeTools::succeeding());

        let info = service.publish(&context(root.path()), &properties()).await.unwrap();
        assert_eq!(
            info.url,
            "https://dumps.example.dev/dumps/xiaomi/marble/tree/marble-user-14-UKQ1-V816-release-keys"
        );
        assert_eq!(info.namespace, "xiaomi");

        let err = service
            .publish(&context(root.path()), &properties())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Conflict(_)));
        assert_eq!(host.pushes().len(), 1);
        assert_eq!(host.pushes()[0].message, "marble-user 14 UKQ1 V816 release-keys");
    }

    #[tokio::test]
    async fn test_rejected_request_is_not_retried() {
        let root = tempfile::tempdir().unwrap();
        let mut host = MockRepositoryHost::new();
        host.expect_get_or_create_namespace().times(1).returning(|_| {
            Err(HostError::Api {
                status: 403,
                message: "forbidden".to_string(),
            })
        });
        host.expect_push().never();

        let service =
            PublishService::new(Arc::new(host), FakeTools::succeeding()).with_retry(INSTANT);
        let err = service
            .publish(&context(root.path()), &properties())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PublishApiError);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let root = tempfile::tempdir().unwrap();
        let mut host = MockRepositoryHost::new();
        let mut failures = 2;
        host.expect_get_or_create_namespace().times(3).returning(move |_| {
            if failures > 0 {
                failures -= 1;
                Err(HostError::Api {
                    status: 502,
                    message: "bad gateway".to_string(),
                })
            } else {
                Ok(7)
            }
        });
        host.expect_get_or_create_project().returning(|_, _, _| Ok(9));
        host.expect_branch_exists().returning(|_, _| Ok(false));
        host.expect_push().times(1).returning(|_| Ok(()));
        host.expect_set_default_branch().returning(|_, _| {
            Err(HostError::Api {
                status: 400,
                message: "protected".to_string(),
            })
        });
        host.expect_repository_url()
            .returning(|ns, p, b| format!("https://host/dumps/{}/{}/tree/{}", ns, p, b));

        let service =
            PublishService::new(Arc::new(host), FakeTools::succeeding()).with_retry(INSTANT);
        let ctx = context(root.path());
        let info = service.publish(&ctx, &properties()).await.unwrap();

        assert!(info.url.ends_with("/xiaomi/marble/tree/marble-user-14-UKQ1-V816-release-keys"));
        assert!(
            ctx.drain_progress()
                .iter()
                .any(|e| e.message.starts_with("Could not set default branch"))
        );
    }

    #[tokio::test]
    async fn test_device_tree_failure_is_a_warning() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path());
        let tools = FakeTools::new(|_| Ok(fail(1)));

        let service = PublishService::new(FakeHost::new(), tools.clone());
        service.generate_device_tree(&ctx).await;

        let call = &tools.calls()[0];
        assert_eq!(call.args[0], "aospdtgen@1.1.1");
        assert_eq!(call.timeout, DEVICE_TREE_TIMEOUT);
        assert_eq!(call.cwd.as_deref(), Some(ctx.tree_dir().as_path()));
        assert!(ctx.tree_dir().join(DEVICE_TREE_DIR).is_dir());
    }
}
