use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MAX_STATUS_MESSAGES: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Repository,
    Organization,
    Enterprise,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Repository => "repository",
            EntityKind::Organization => "organization",
            EntityKind::Enterprise => "enterprise",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Config derived at load time and swapped atomically on RefreshState.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InternalConfig {
    pub controller_id: String,
    pub forge_base_url: String,
    pub callback_url: String,
    pub metadata_url: String,
}

/// A forge-side scope (repository, organization or enterprise) owning pools.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    /// `owner/repo` for repositories, the login/slug otherwise.
    pub name: String,
    pub credentials_name: String,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    #[serde(default)]
    pub internal: InternalConfig,
    pub created_at: DateTime<Utc>,
}

impl Entity {
    /// URL of the forge-side entity, used as the runner registration target.
    pub fn forge_url(&self) -> String {
        let base = if self.internal.forge_base_url.is_empty() {
            "https://github.com"
        } else {
            self.internal.forge_base_url.trim_end_matches('/')
        };
        match self.kind {
            EntityKind::Repository | EntityKind::Organization => {
                format!("{}/{}", base, self.name)
            }
            EntityKind::Enterprise => format!("{}/enterprises/{}", base, self.name),
        }
    }
}

/// Fields RefreshState is allowed to replace while a manager is running.
#[derive(Clone, Debug, Default)]
pub struct EntityUpdate {
    pub credentials_name: Option<String>,
    pub webhook_secret: Option<String>,
    pub internal: Option<InternalConfig>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsType {
    Linux,
    Windows,
}

impl OsType {
    /// Matches the `os` field of a runner application download.
    pub fn tool_os(&self) -> &'static str {
        match self {
            OsType::Linux => "linux",
            OsType::Windows => "win",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsArch {
    Amd64,
    Arm64,
}

impl OsArch {
    pub fn tool_arch(&self) -> &'static str {
        match self {
            OsArch::Amd64 => "x64",
            OsArch::Arm64 => "arm64",
        }
    }
}

/// A recipe for like runners.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    pub entity_id: String,
    pub provider_name: String,
    pub image: String,
    pub flavor: String,
    pub os_type: OsType,
    pub os_arch: OsArch,
    pub tags: Vec<String>,
    pub min_idle_runners: u32,
    pub max_runners: u32,
    /// Minutes an instance may spend bootstrapping before it is reaped.
    pub runner_bootstrap_timeout: u32,
    pub enabled: bool,
    /// Lower value wins when several pools match a queued job.
    pub priority: u32,
    #[serde(default)]
    pub extra_specs: serde_json::Value,
    #[serde(default)]
    pub github_runner_group: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Pool {
    pub fn validate(&self) -> Result<()> {
        if self.tags.is_empty() {
            return Err(Error::bad_request("pool tags cannot be empty"));
        }
        let mut seen = std::collections::HashSet::new();
        for tag in &self.tags {
            if !seen.insert(tag.to_lowercase()) {
                return Err(Error::bad_request(format!("duplicate pool tag: {tag}")));
            }
        }
        if self.min_idle_runners > self.max_runners {
            return Err(Error::bad_request(
                "min_idle_runners cannot be larger than max_runners",
            ));
        }
        if self.enabled && self.max_runners == 0 {
            return Err(Error::bad_request(
                "an enabled pool must allow at least one runner",
            ));
        }
        Ok(())
    }

    /// A pool can take a job when every requested label is one of its tags.
    pub fn matches_labels(&self, labels: &[String]) -> bool {
        if labels.is_empty() {
            return false;
        }
        labels.iter().all(|label| {
            self.tags
                .iter()
                .any(|tag| tag.eq_ignore_ascii_case(label))
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    PendingCreate,
    Creating,
    Running,
    Stopped,
    Error,
    PendingDelete,
    Deleting,
    Unknown,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::PendingCreate => "pending_create",
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
            InstanceStatus::PendingDelete => "pending_delete",
            InstanceStatus::Deleting => "deleting",
            InstanceStatus::Unknown => "unknown",
        }
    }

    /// Legal transitions of the instance lifecycle. `Unknown` is transient
    /// in both directions; a self-transition is always a no-op.
    pub fn can_transition_to(&self, to: InstanceStatus) -> bool {
        use InstanceStatus::*;
        if *self == to || to == Unknown || *self == Unknown {
            return true;
        }
        matches!(
            (*self, to),
            (PendingCreate, Creating)
                | (PendingCreate, Error)
                | (PendingCreate, PendingDelete)
                | (Creating, Running)
                | (Creating, Stopped)
                | (Creating, Error)
                | (Creating, PendingDelete)
                | (Running, Stopped)
                | (Running, Error)
                | (Running, PendingDelete)
                | (Stopped, Running)
                | (Stopped, Error)
                | (Stopped, PendingDelete)
                | (Error, PendingDelete)
                | (PendingDelete, Deleting)
                | (Deleting, PendingDelete)
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Pending,
    Installing,
    Idle,
    Active,
    Failed,
    Terminated,
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Pending => "pending",
            RunnerStatus::Installing => "installing",
            RunnerStatus::Idle => "idle",
            RunnerStatus::Active => "active",
            RunnerStatus::Failed => "failed",
            RunnerStatus::Terminated => "terminated",
        }
    }

    /// The runner axis only moves forward; `Failed` is reachable from the
    /// two bootstrap states. Used to ignore stale forge observations.
    pub fn can_advance_to(&self, to: RunnerStatus) -> bool {
        use RunnerStatus::*;
        if *self == to {
            return true;
        }
        matches!(
            (*self, to),
            (Pending, Installing)
                | (Pending, Idle)
                | (Pending, Failed)
                | (Installing, Idle)
                | (Installing, Failed)
                | (Idle, Active)
                | (Idle, Failed)
                | (Pending, Terminated)
                | (Installing, Terminated)
                | (Idle, Terminated)
                | (Active, Terminated)
                | (Failed, Terminated)
        )
    }
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states a provider is allowed to report. Anything else the
/// backing cloud knows about must be mapped to `Unknown` by the adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderInstanceStatus {
    Running,
    Stopped,
    Error,
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderInstance {
    pub provider_id: String,
    pub name: String,
    pub status: ProviderInstanceStatus,
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusMessage {
    pub created_at: DateTime<Utc>,
    pub message: String,
}

/// One live VM/container produced from a pool. Owned and mutated only by
/// the pool manager of the owning entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub pool_id: String,
    pub provider_id: Option<String>,
    /// Forge-side runner id, set once registration completes.
    pub agent_id: Option<i64>,
    pub status: InstanceStatus,
    pub runner_status: RunnerStatus,
    #[serde(default)]
    pub addresses: Vec<String>,
    pub job_id: Option<i64>,
    pub token_fetched: bool,
    pub create_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status_messages: Vec<StatusMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(name: impl Into<String>, pool_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Instance {
            name: name.into(),
            pool_id: pool_id.into(),
            provider_id: None,
            agent_id: None,
            status: InstanceStatus::PendingCreate,
            runner_status: RunnerStatus::Pending,
            addresses: Vec::new(),
            job_id: None,
            token_fetched: false,
            create_attempts: 0,
            next_retry_at: None,
            status_messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Appends to the human-readable trail, FIFO-truncated at 20 entries.
    pub fn push_status_message(&mut self, now: DateTime<Utc>, message: impl Into<String>) {
        self.status_messages.push(StatusMessage {
            created_at: now,
            message: message.into(),
        });
        while self.status_messages.len() > MAX_STATUS_MESSAGES {
            self.status_messages.remove(0);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Queued,
    InProgress,
    Completed,
}

impl JobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Queued => "queued",
            JobAction::InProgress => "in_progress",
            JobAction::Completed => "completed",
        }
    }
}

/// The slice of a `workflow_job` webhook payload the fleet consumes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub action: JobAction,
    pub workflow_job: WorkflowJobDetails,
    #[serde(default)]
    pub repository: Option<RepositoryRef>,
    #[serde(default)]
    pub organization: Option<OrganizationRef>,
    #[serde(default)]
    pub enterprise: Option<EnterpriseRef>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowJobDetails {
    pub id: i64,
    pub run_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub runner_name: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub full_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrganizationRef {
    pub login: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnterpriseRef {
    pub slug: String,
}

/// Store-side audit record of a workflow job, unique on `id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub run_id: i64,
    pub action: JobAction,
    pub conclusion: Option<String>,
    pub labels: Vec<String>,
    pub assigned_runner: Option<String>,
    /// Pool-manager id that claimed the job.
    pub locked_by: Option<String>,
    /// Set when no matching pool had headroom at queue time.
    pub overflow: bool,
    pub entity_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn from_webhook(job: &WorkflowJob, entity_id: &str, now: DateTime<Utc>) -> Self {
        JobRecord {
            id: job.workflow_job.id,
            run_id: job.workflow_job.run_id,
            action: job.action,
            conclusion: job.workflow_job.conclusion.clone(),
            labels: job.workflow_job.labels.clone(),
            assigned_runner: job.workflow_job.runner_name.clone(),
            locked_by: None,
            overflow: false,
            entity_id: entity_id.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// The forge's view of a registered runner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForgeRunner {
    pub id: i64,
    pub name: String,
    /// Raw forge status string, `online` / `offline` for GitHub.
    pub status: String,
    pub busy: bool,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl ForgeRunner {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }
}

/// One downloadable runner application build.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerApplication {
    pub os: String,
    pub architecture: String,
    pub download_url: String,
    pub filename: String,
    #[serde(default)]
    pub sha256_checksum: Option<String>,
}

/// JIT registration credentials bound to one runner name.
#[derive(Clone, Debug)]
pub struct JitConfig {
    pub encoded_jit_config: String,
    pub runner_id: i64,
}

/// Everything a provider needs to boot one instance.
#[derive(Clone, Debug)]
pub struct BootstrapParams {
    pub name: String,
    pub pool_id: String,
    pub image: String,
    pub flavor: String,
    pub os_type: OsType,
    pub os_arch: OsArch,
    pub labels: Vec<String>,
    pub tools: Vec<RunnerApplication>,
    pub repo_url: String,
    pub callback_url: String,
    pub metadata_url: String,
    pub instance_token: String,
    pub jit_config: Option<String>,
    pub registration_token: Option<String>,
    pub github_runner_group: Option<String>,
    pub extra_specs: serde_json::Value,
    /// Rendered cloud-init document; adapters encode it as they need.
    pub user_data: String,
}
