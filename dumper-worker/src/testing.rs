//! In-memory fakes shared by the service tests
//!
//! mockall covers single expectations; these fakes cover the multi-call
//! flows (tool chains, a whole pipeline run) where recording what happened
//! reads better than a wall of expectations.

use anyhow::Result;
use async_trait::async_trait;
use dumper_core::domain::device::{DeviceInfo, RepositoryInfo};
use dumper_core::domain::job::{Job, JobOutcome, JobStage};
use dumper_core::domain::progress::ProgressEntry;
use dumper_core::dto::job::LeaseStatus;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::repository::gitlab::{HostError, PushRequest, RepositoryHost};
use crate::repository::jobs::JobRepository;
use crate::repository::telegram::{ChatId, MessageChannel, MessageRef};
use crate::repository::tools::{ToolInvocation, ToolOutput, ToolRunner};

pub fn ok() -> ToolOutput {
    ToolOutput {
        exit_code: Some(0),
        ..Default::default()
    }
}

pub fn fail(code: i32) -> ToolOutput {
    ToolOutput {
        exit_code: Some(code),
        stdout: String::new(),
        stderr: format!("failed with {}", code),
    }
}

type Handler = Box<dyn Fn(&ToolInvocation) -> Result<ToolOutput> + Send + Sync>;

/// Tool runner that records every call and answers from a closure
pub struct FakeTools {
    calls: Mutex<Vec<ToolInvocation>>,
    handler: Handler,
}

impl FakeTools {
    pub fn new(
        handler: impl Fn(&ToolInvocation) -> Result<ToolOutput> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        })
    }

    /// Every tool exits with status 0 and touches nothing
    pub fn succeeding() -> Arc<Self> {
        Self::new(|_| Ok(ok()))
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }

    /// Calls whose program or first argument equals `name`
    pub fn calls_to(&self, name: &str) -> Vec<ToolInvocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == name || c.args.first().map(String::as_str) == Some(name))
            .collect()
    }
}

#[async_trait]
impl ToolRunner for FakeTools {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push(invocation.clone());
        (self.handler)(invocation)
    }
}

/// Value following `flag` in an argument list (`-o <value>`)
pub fn arg_after(invocation: &ToolInvocation, flag: &str) -> Option<PathBuf> {
    invocation
        .args
        .iter()
        .position(|a| a == flag)
        .and_then(|i| invocation.args.get(i + 1))
        .map(PathBuf::from)
}

pub fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// Job store applying the shared state machine, like the orchestrator does
pub struct MemoryJobStore {
    job: Mutex<Job>,
    stages: Mutex<Vec<JobStage>>,
    progress: Mutex<Vec<ProgressEntry>>,
    cancel_on_lease: Mutex<bool>,
}

impl MemoryJobStore {
    pub fn new(job: Job) -> Arc<Self> {
        Arc::new(Self {
            stages: Mutex::new(vec![job.stage]),
            job: Mutex::new(job),
            progress: Mutex::new(Vec::new()),
            cancel_on_lease: Mutex::new(false),
        })
    }

    pub fn job(&self) -> Job {
        self.job.lock().unwrap().clone()
    }

    /// Every stage the job was in, in order
    pub fn stages(&self) -> Vec<JobStage> {
        self.stages.lock().unwrap().clone()
    }

    pub fn progress(&self) -> Vec<ProgressEntry> {
        self.progress.lock().unwrap().clone()
    }

    pub fn request_cancel(&self) {
        *self.cancel_on_lease.lock().unwrap() = true;
    }
}

#[async_trait]
impl JobRepository for MemoryJobStore {
    async fn claim_next(&self, _lease: Duration) -> Result<Option<Job>> {
        Ok(None)
    }

    async fn extend_lease(&self, _job_id: Uuid, _lease: Duration) -> Result<LeaseStatus> {
        Ok(LeaseStatus {
            cancel_requested: *self.cancel_on_lease.lock().unwrap(),
        })
    }

    async fn append_progress(&self, _job_id: Uuid, entries: Vec<ProgressEntry>) -> Result<()> {
        self.progress.lock().unwrap().extend(entries);
        Ok(())
    }

    async fn advance_stage(&self, _job_id: Uuid, stage: JobStage) -> Result<Job> {
        let mut job = self.job.lock().unwrap();
        job.advance(stage)?;
        self.stages.lock().unwrap().push(stage);
        Ok(job.clone())
    }

    async fn set_device_info(&self, _job_id: Uuid, info: DeviceInfo) -> Result<()> {
        self.job.lock().unwrap().set_device_info(info)?;
        Ok(())
    }

    async fn set_repository_info(&self, _job_id: Uuid, info: RepositoryInfo) -> Result<()> {
        self.job.lock().unwrap().set_repository_info(info)?;
        Ok(())
    }

    async fn finish(&self, _job_id: Uuid, outcome: JobOutcome) -> Result<Job> {
        let mut job = self.job.lock().unwrap();
        job.finish(&outcome, chrono::Utc::now())?;
        self.stages.lock().unwrap().push(job.stage);
        Ok(job.clone())
    }
}

/// GitLab stand-in remembering pushed branches per project
#[derive(Default)]
pub struct FakeHost {
    branches: Mutex<HashSet<(String, String, String)>>,
    pushes: Mutex<Vec<PushRequest>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_branch(namespace: &str, project: &str, branch: &str) -> Arc<Self> {
        let host = Self::default();
        host.branches.lock().unwrap().insert((
            namespace.to_string(),
            project.to_string(),
            branch.to_string(),
        ));
        Arc::new(host)
    }

    pub fn pushes(&self) -> Vec<PushRequest> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl RepositoryHost for FakeHost {
    async fn get_or_create_namespace(&self, _subgroup: &str) -> Result<u64, HostError> {
        Ok(1)
    }

    async fn get_or_create_project(
        &self,
        _namespace_id: u64,
        _namespace: &str,
        _project: &str,
    ) -> Result<u64, HostError> {
        Ok(2)
    }

    /// The fake serves a single project, so only the branch name matters
    async fn branch_exists(&self, _project_id: u64, branch: &str) -> Result<bool, HostError> {
        Ok(self
            .branches
            .lock()
            .unwrap()
            .iter()
            .any(|(_, _, b)| b == branch))
    }

    async fn push(&self, request: &PushRequest) -> Result<(), HostError> {
        self.branches.lock().unwrap().insert((
            request.namespace.clone(),
            request.project.clone(),
            request.branch.clone(),
        ));
        self.pushes.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn set_default_branch(&self, _project_id: u64, _branch: &str) -> Result<(), HostError> {
        Ok(())
    }

    fn repository_url(&self, namespace: &str, project: &str, branch: &str) -> String {
        format!(
            "https://dumps.example.dev/dumps/{}/{}/tree/{}",
            namespace, project, branch
        )
    }
}

/// Chat channel that records every text it was given
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<(String, String)>>,
    edits: Mutex<Vec<(MessageRef, String)>>,
    next_id: Mutex<i64>,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(chat, text)` of every new message, replies included
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn edits(&self) -> Vec<(MessageRef, String)> {
        self.edits.lock().unwrap().clone()
    }

    /// Text of the last send or edit
    pub fn last_text(&self) -> Option<String> {
        let edit = self.edits.lock().unwrap().last().map(|(_, t)| t.clone());
        edit.or_else(|| self.sent.lock().unwrap().last().map(|(_, t)| t.clone()))
    }

    fn next(&self) -> i64 {
        let mut id = self.next_id.lock().unwrap();
        *id += 1;
        *id
    }
}

#[async_trait]
impl MessageChannel for RecordingChannel {
    async fn send(&self, chat: ChatId, text: &str) -> Result<MessageRef> {
        self.sent
            .lock()
            .unwrap()
            .push((chat.to_string(), text.to_string()));
        let conversation_id = match chat {
            ChatId::Id(id) => id,
            ChatId::Username(_) => -1,
        };
        Ok(MessageRef {
            conversation_id,
            message_id: self.next(),
        })
    }

    async fn reply(&self, conversation_id: i64, _target: MessageRef, text: &str) -> Result<MessageRef> {
        self.sent
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), text.to_string()));
        Ok(MessageRef {
            conversation_id,
            message_id: self.next(),
        })
    }

    async fn edit(&self, message: MessageRef, text: &str) -> Result<()> {
        self.edits.lock().unwrap().push((message, text.to_string()));
        Ok(())
    }
}
