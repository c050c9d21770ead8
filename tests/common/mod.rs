#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use gha_fleet::backoff::Clock;
use gha_fleet::crypto::SecretCipher;
use gha_fleet::error::{Error, Result};
use gha_fleet::forge::{ForgeClient, ForgeFactory, HookInfo};
use gha_fleet::params::{
    BootstrapParams, Entity, EntityKind, ForgeRunner, InternalConfig, JitConfig, JobAction,
    OrganizationRef, OsArch, OsType, Pool, ProviderInstance, ProviderInstanceStatus,
    RunnerApplication, WorkflowJob, WorkflowJobDetails,
};
use gha_fleet::pool::{NullSink, PoolManager, PoolManagerConfig};
use gha_fleet::provider::Provider;
use gha_fleet::store::{MemoryStore, Store};

#[derive(Clone)]
pub struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

impl ManualClock {
    pub fn new() -> Self {
        ManualClock(Arc::new(Mutex::new(Utc::now())))
    }

    pub fn advance(&self, delta: Duration) {
        *self.0.lock().unwrap() += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

#[derive(Default)]
pub struct ProviderState {
    pub instances: HashMap<String, ProviderInstance>,
    pub create_calls: Vec<String>,
    pub delete_calls: Vec<String>,
    /// The next N create calls fail with a transient error.
    pub fail_creates: u32,
}

#[derive(Default)]
pub struct FakeProvider {
    pub state: Mutex<ProviderState>,
}

impl FakeProvider {
    pub fn create_calls(&self) -> usize {
        self.state.lock().unwrap().create_calls.len()
    }

    pub fn delete_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().delete_calls.clone()
    }

    pub fn live_instances(&self) -> usize {
        self.state.lock().unwrap().instances.len()
    }

    pub fn fail_next_creates(&self, n: u32) {
        self.state.lock().unwrap().fail_creates = n;
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn create_instance(&self, bootstrap: &BootstrapParams) -> Result<ProviderInstance> {
        let mut state = self.state.lock().unwrap();
        state.create_calls.push(bootstrap.name.clone());
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(Error::transient("compute quota momentarily exceeded"));
        }
        let instance = ProviderInstance {
            provider_id: format!("prov-{}", bootstrap.name),
            name: bootstrap.name.clone(),
            status: ProviderInstanceStatus::Running,
            addresses: vec!["10.0.0.5".to_string()],
        };
        state
            .instances
            .insert(bootstrap.name.clone(), instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, name: &str) -> Result<ProviderInstance> {
        self.state
            .lock()
            .unwrap()
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("server {name}")))
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.delete_calls.push(name.to_string());
        state.instances.remove(name);
        Ok(())
    }

    async fn stop_instance(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn start_instance(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn list_instances(&self, _pool_id: &str) -> Result<Vec<ProviderInstance>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .instances
            .values()
            .cloned()
            .collect())
    }

    async fn remove_all_instances(&self) -> Result<()> {
        self.state.lock().unwrap().instances.clear();
        Ok(())
    }
}

pub struct ForgeState {
    pub runners: Vec<ForgeRunner>,
    pub removed: Vec<i64>,
    pub next_runner_id: i64,
    /// When true a JIT-registered runner comes up online immediately.
    pub auto_online: bool,
    /// Forces the registration-token fallback.
    pub fail_jit: bool,
    pub tools_fetches: u32,
    pub tokens_issued: u32,
}

impl Default for ForgeState {
    fn default() -> Self {
        ForgeState {
            runners: Vec::new(),
            removed: Vec::new(),
            next_runner_id: 100,
            auto_online: true,
            fail_jit: false,
            tools_fetches: 0,
            tokens_issued: 0,
        }
    }
}

#[derive(Default)]
pub struct FakeForge {
    pub state: Mutex<ForgeState>,
}

impl FakeForge {
    pub fn removed(&self) -> Vec<i64> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn add_runner(&self, id: i64, name: &str, status: &str, busy: bool) {
        self.state.lock().unwrap().runners.push(ForgeRunner {
            id,
            name: name.to_string(),
            status: status.to_string(),
            busy,
            labels: vec!["self-hosted".to_string()],
        });
    }

    pub fn set_auto_online(&self, auto_online: bool) {
        self.state.lock().unwrap().auto_online = auto_online;
    }
}

#[async_trait]
impl ForgeClient for FakeForge {
    async fn list_runners(&self) -> Result<Vec<ForgeRunner>> {
        Ok(self.state.lock().unwrap().runners.clone())
    }

    async fn remove_runner(&self, runner_id: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.removed.push(runner_id);
        state.runners.retain(|r| r.id != runner_id);
        Ok(())
    }

    async fn registration_token(&self) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.tokens_issued += 1;
        Ok(format!("reg-token-{}", state.tokens_issued))
    }

    async fn jit_runner_config(
        &self,
        runner_name: &str,
        labels: &[String],
        _runner_group: Option<&str>,
    ) -> Result<JitConfig> {
        let mut state = self.state.lock().unwrap();
        if state.fail_jit {
            return Err(Error::bad_request("jit config is disabled on this forge"));
        }
        state.next_runner_id += 1;
        let id = state.next_runner_id;
        let status = if state.auto_online { "online" } else { "offline" };
        state.runners.push(ForgeRunner {
            id,
            name: runner_name.to_string(),
            status: status.to_string(),
            busy: false,
            labels: labels.to_vec(),
        });
        Ok(JitConfig {
            encoded_jit_config: format!("jit-{id}"),
            runner_id: id,
        })
    }

    async fn install_webhook(&self, url: &str, _secret: &str) -> Result<HookInfo> {
        Ok(HookInfo {
            id: 1,
            url: url.to_string(),
            active: true,
            events: vec!["workflow_job".to_string()],
        })
    }

    async fn uninstall_webhook(&self, _url: &str) -> Result<()> {
        Ok(())
    }

    async fn webhook_info(&self) -> Result<Option<HookInfo>> {
        Ok(None)
    }

    async fn fetch_tools(&self) -> Result<Vec<RunnerApplication>> {
        self.state.lock().unwrap().tools_fetches += 1;
        Ok(vec![RunnerApplication {
            os: "linux".to_string(),
            architecture: "x64".to_string(),
            download_url: "https://example.com/actions-runner-linux-x64.tar.gz".to_string(),
            filename: "actions-runner-linux-x64.tar.gz".to_string(),
            sha256_checksum: Some("deadbeef".to_string()),
        }])
    }
}

pub struct FakeForgeFactory {
    pub forge: Arc<FakeForge>,
}

impl ForgeFactory for FakeForgeFactory {
    fn for_entity(&self, _entity: &Entity) -> Result<Arc<dyn ForgeClient>> {
        Ok(self.forge.clone())
    }
}

pub fn test_entity() -> Entity {
    Entity {
        id: "entity-1".to_string(),
        kind: EntityKind::Organization,
        name: "acme".to_string(),
        credentials_name: "default".to_string(),
        webhook_secret: "s3cret".to_string(),
        internal: InternalConfig {
            controller_id: "controller-1".to_string(),
            forge_base_url: String::new(),
            callback_url: "https://fleet.example.com/api/v1/callbacks/status".to_string(),
            metadata_url: "https://fleet.example.com/api/v1/metadata".to_string(),
        },
        created_at: Utc::now(),
    }
}

pub fn test_pool(id: &str, min_idle: u32, max: u32) -> Pool {
    Pool {
        id: id.to_string(),
        entity_id: "entity-1".to_string(),
        provider_name: "fake".to_string(),
        image: "ubuntu-24.04".to_string(),
        flavor: "m1.small".to_string(),
        os_type: OsType::Linux,
        os_arch: OsArch::Amd64,
        tags: vec!["self-hosted".to_string(), "linux".to_string()],
        min_idle_runners: min_idle,
        max_runners: max,
        runner_bootstrap_timeout: 5,
        enabled: true,
        priority: 10,
        extra_specs: serde_json::Value::Null,
        github_runner_group: None,
        created_at: Utc::now(),
    }
}

pub struct Harness {
    pub manager: PoolManager,
    pub store: Arc<dyn Store>,
    pub provider: Arc<FakeProvider>,
    pub forge: Arc<FakeForge>,
    pub clock: ManualClock,
}

impl Harness {
    /// One full control-loop cycle, the way the background workers run it.
    pub async fn cycle(&self) {
        self.manager.reconcile_once().await.unwrap();
        self.manager.drain_creates().await.unwrap();
        self.manager.observe_once().await.unwrap();
    }
}

pub async fn harness(min_idle: u32, max: u32) -> Harness {
    harness_with(min_idle, max, PoolManagerConfig::default()).await
}

pub async fn harness_with(min_idle: u32, max: u32, cfg: PoolManagerConfig) -> Harness {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new(SecretCipher::new("test-passphrase")));
    let entity = test_entity();
    store.create_entity(entity.clone()).await.unwrap();
    store.create_pool(test_pool("pool-1", min_idle, max)).await.unwrap();

    let provider = Arc::new(FakeProvider::default());
    let forge = Arc::new(FakeForge::default());
    let clock = ManualClock::new();

    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("fake".to_string(), provider.clone());

    let manager = PoolManager::new(
        entity,
        store.clone(),
        providers,
        forge.clone(),
        cfg,
        Arc::new(clock.clone()),
        Arc::new(NullSink),
        42,
    );

    Harness {
        manager,
        store,
        provider,
        forge,
        clock,
    }
}

pub fn queued_job(id: i64, labels: &[&str]) -> WorkflowJob {
    job(id, JobAction::Queued, labels, None, None)
}

pub fn in_progress_job(id: i64, runner_name: &str) -> WorkflowJob {
    job(
        id,
        JobAction::InProgress,
        &["self-hosted", "linux"],
        Some(runner_name),
        None,
    )
}

pub fn completed_job(id: i64, runner_name: &str) -> WorkflowJob {
    job(
        id,
        JobAction::Completed,
        &["self-hosted", "linux"],
        Some(runner_name),
        Some("success"),
    )
}

fn job(
    id: i64,
    action: JobAction,
    labels: &[&str],
    runner_name: Option<&str>,
    conclusion: Option<&str>,
) -> WorkflowJob {
    WorkflowJob {
        action,
        workflow_job: WorkflowJobDetails {
            id,
            run_id: id * 10,
            name: "build".to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            conclusion: conclusion.map(str::to_string),
            runner_name: runner_name.map(str::to_string),
        },
        repository: None,
        organization: Some(OrganizationRef {
            login: "acme".to_string(),
        }),
        enterprise: None,
    }
}
