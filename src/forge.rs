use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::backoff::Clock;
use crate::error::{Error, Result};
use crate::params::{Entity, EntityKind, ForgeRunner, JitConfig, RunnerApplication, WorkflowJob};

pub const TOOLS_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Clone, Debug)]
pub struct HookInfo {
    pub id: i64,
    pub url: String,
    pub active: bool,
    pub events: Vec<String>,
}

/// Forge capability scoped to one entity. One client per pool manager,
/// rebuilt on credential refresh.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    async fn list_runners(&self) -> Result<Vec<ForgeRunner>>;

    /// Removing an already-gone runner is a success.
    async fn remove_runner(&self, runner_id: i64) -> Result<()>;

    /// Short-TTL token, single-use; never cache across instances.
    async fn registration_token(&self) -> Result<String>;

    async fn jit_runner_config(
        &self,
        runner_name: &str,
        labels: &[String],
        runner_group: Option<&str>,
    ) -> Result<JitConfig>;

    async fn install_webhook(&self, url: &str, secret: &str) -> Result<HookInfo>;

    async fn uninstall_webhook(&self, url: &str) -> Result<()>;

    async fn webhook_info(&self) -> Result<Option<HookInfo>>;

    async fn fetch_tools(&self) -> Result<Vec<RunnerApplication>>;
}

/// Constructs a forge client for an entity; the controller owns one and
/// hands clients to managers at load and refresh time.
pub trait ForgeFactory: Send + Sync {
    fn for_entity(&self, entity: &Entity) -> Result<std::sync::Arc<dyn ForgeClient>>;
}

/// Read-mostly cache of the runner application download list.
pub struct ToolsCache {
    ttl: Duration,
    inner: RwLock<Option<CacheSlot>>,
}

struct CacheSlot {
    fetched_at: DateTime<Utc>,
    tools: Vec<RunnerApplication>,
}

impl ToolsCache {
    pub fn new(ttl: Duration) -> Self {
        ToolsCache {
            ttl,
            inner: RwLock::new(None),
        }
    }

    pub async fn get_or_fetch(
        &self,
        forge: &dyn ForgeClient,
        clock: &dyn Clock,
    ) -> Result<Vec<RunnerApplication>> {
        let now = clock.now();
        {
            let slot = self.inner.read().await;
            if let Some(slot) = slot.as_ref() {
                let age = (now - slot.fetched_at).to_std().unwrap_or_default();
                if age < self.ttl {
                    return Ok(slot.tools.clone());
                }
            }
        }
        self.refresh(forge, clock).await
    }

    /// Unconditional fetch; the tool-fetcher worker calls this on its tick.
    pub async fn refresh(
        &self,
        forge: &dyn ForgeClient,
        clock: &dyn Clock,
    ) -> Result<Vec<RunnerApplication>> {
        let tools = forge.fetch_tools().await?;
        let mut slot = self.inner.write().await;
        *slot = Some(CacheSlot {
            fetched_at: clock.now(),
            tools: tools.clone(),
        });
        Ok(tools)
    }
}

/// Asserts the webhook's scope matches the entity this manager owns.
pub fn validate_owner(entity: &Entity, job: &WorkflowJob) -> Result<()> {
    let matches = match entity.kind {
        EntityKind::Repository => job
            .repository
            .as_ref()
            .is_some_and(|r| r.full_name.eq_ignore_ascii_case(&entity.name)),
        EntityKind::Organization => job
            .organization
            .as_ref()
            .is_some_and(|o| o.login.eq_ignore_ascii_case(&entity.name)),
        EntityKind::Enterprise => job
            .enterprise
            .as_ref()
            .is_some_and(|e| e.slug.eq_ignore_ascii_case(&entity.name)),
    };
    if matches {
        Ok(())
    } else {
        Err(Error::bad_request(format!(
            "workflow job is not owned by {} {}",
            entity.kind, entity.name
        )))
    }
}
