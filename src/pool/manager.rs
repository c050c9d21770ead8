use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{EventSink, InstanceLocks, LifecycleEvent, PoolManagerConfig, guarded};
use crate::backoff::Clock;
use crate::error::{Error, Result};
use crate::forge::{self, ForgeClient, ToolsCache};
use crate::params::{
    Entity, EntityUpdate, Instance, InstanceStatus, JobAction, JobRecord, Pool, RunnerStatus,
    WorkflowJob,
};
use crate::provider::Provider;
use crate::store::Store;

enum RunState {
    Idle,
    Running(Vec<tokio::task::JoinHandle<()>>),
    Stopped,
}

struct WakeReceivers {
    reconcile: mpsc::Receiver<()>,
    create: mpsc::Receiver<()>,
    delete: mpsc::Receiver<()>,
}

pub(super) struct Inner {
    pub(super) entity: RwLock<Entity>,
    pub(super) store: Arc<dyn Store>,
    pub(super) providers: HashMap<String, Arc<dyn Provider>>,
    pub(super) forge: RwLock<Arc<dyn ForgeClient>>,
    pub(super) tools: ToolsCache,
    pub(super) cfg: PoolManagerConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) rng: StdMutex<StdRng>,
    pub(super) token: CancellationToken,
    pub(super) locks: InstanceLocks,
    pub(super) events: Arc<dyn EventSink>,
    run_state: Mutex<RunState>,
    wake_reconcile_tx: mpsc::Sender<()>,
    wake_create_tx: mpsc::Sender<()>,
    wake_delete_tx: mpsc::Sender<()>,
    receivers: Mutex<Option<WakeReceivers>>,
}

/// Per-entity reconciler. Keeps the provider and forge in line with the
/// entity's pool configuration; the only writer of its instances.
#[derive(Clone)]
pub struct PoolManager {
    pub(super) inner: Arc<Inner>,
}

impl PoolManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entity: Entity,
        store: Arc<dyn Store>,
        providers: HashMap<String, Arc<dyn Provider>>,
        forge: Arc<dyn ForgeClient>,
        cfg: PoolManagerConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        seed: u64,
    ) -> Self {
        let (wake_reconcile_tx, reconcile) = mpsc::channel(1);
        let (wake_create_tx, create) = mpsc::channel(1);
        let (wake_delete_tx, delete) = mpsc::channel(1);
        let tools = ToolsCache::new(forge::TOOLS_CACHE_TTL);
        PoolManager {
            inner: Arc::new(Inner {
                entity: RwLock::new(entity),
                store,
                providers,
                forge: RwLock::new(forge),
                tools,
                cfg,
                clock,
                rng: StdMutex::new(StdRng::seed_from_u64(seed)),
                token: CancellationToken::new(),
                locks: InstanceLocks::default(),
                events,
                run_state: Mutex::new(RunState::Idle),
                wake_reconcile_tx,
                wake_create_tx,
                wake_delete_tx,
                receivers: Mutex::new(Some(WakeReceivers {
                    reconcile,
                    create,
                    delete,
                })),
            }),
        }
    }

    pub async fn id(&self) -> String {
        self.inner.entity.read().await.id.clone()
    }

    pub async fn entity(&self) -> Entity {
        self.inner.entity.read().await.clone()
    }

    pub async fn webhook_secret(&self) -> String {
        self.inner.entity.read().await.webhook_secret.clone()
    }

    pub(super) async fn forge(&self) -> Arc<dyn ForgeClient> {
        self.inner.forge.read().await.clone()
    }

    pub(super) fn provider_for(&self, pool: &Pool) -> Result<Arc<dyn Provider>> {
        self.inner
            .providers
            .get(&pool.provider_name)
            .cloned()
            .ok_or_else(|| {
                Error::bad_request(format!("provider {} is not configured", pool.provider_name))
            })
    }

    pub(super) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.inner.clock.now()
    }

    /// Starts the worker set. Idempotent while running; a stopped manager
    /// cannot be restarted, the controller builds a fresh one instead.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.inner.run_state.lock().await;
        match &*state {
            RunState::Running(_) => return Ok(()),
            RunState::Stopped => {
                return Err(Error::bad_request("pool manager has been stopped"));
            }
            RunState::Idle => {}
        }

        let entity_id = self.id().await;

        // prime the tool cache; the tool fetcher retries on its tick
        let forge = self.forge().await;
        if let Err(e) = self
            .inner
            .tools
            .refresh(forge.as_ref(), self.inner.clock.as_ref())
            .await
        {
            tracing::warn!(entity = %entity_id, error = %e, "priming tool cache failed");
        }

        self.resume_interrupted_deletes().await?;

        let receivers = self
            .inner
            .receivers
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::fatal("pool manager wake channels already consumed"))?;

        let tasks = vec![
            tokio::spawn(self.clone().run_reconciler(receivers.reconcile)),
            tokio::spawn(self.clone().run_create_worker(receivers.create)),
            tokio::spawn(self.clone().run_delete_worker(receivers.delete)),
            tokio::spawn(self.clone().run_observer()),
            tokio::spawn(self.clone().run_sweeper()),
            tokio::spawn(self.clone().run_tool_fetcher()),
        ];
        *state = RunState::Running(tasks);
        drop(state);

        self.inner
            .events
            .notify(LifecycleEvent::ManagerStarted {
                entity_id: entity_id.clone(),
            });
        tracing::info!(entity = %entity_id, "pool manager started");
        Ok(())
    }

    /// Cancels all workers and waits up to the shutdown grace for drain.
    pub async fn stop(&self) -> Result<()> {
        let tasks = {
            let mut state = self.inner.run_state.lock().await;
            match std::mem::replace(&mut *state, RunState::Stopped) {
                RunState::Running(tasks) => tasks,
                RunState::Idle | RunState::Stopped => Vec::new(),
            }
        };
        self.inner.token.cancel();

        let entity_id = self.id().await;
        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(self.inner.cfg.shutdown_grace, drain)
            .await
            .is_err()
        {
            tracing::warn!(entity = %entity_id, "workers did not drain within the shutdown grace");
        }

        self.inner
            .events
            .notify(LifecycleEvent::ManagerStopped {
                entity_id: entity_id.clone(),
            });
        tracing::info!(entity = %entity_id, "pool manager stopped");
        Ok(())
    }

    /// Atomically replaces credentials, webhook secret and derived config.
    /// In-flight operations complete against the client they already hold.
    pub async fn refresh_state(
        &self,
        update: EntityUpdate,
        forge: Option<Arc<dyn ForgeClient>>,
    ) -> Result<()> {
        {
            let mut entity = self.inner.entity.write().await;
            if let Some(creds) = update.credentials_name {
                entity.credentials_name = creds;
            }
            if let Some(secret) = update.webhook_secret {
                entity.webhook_secret = secret;
            }
            if let Some(internal) = update.internal {
                entity.internal = internal;
            }
        }
        if let Some(forge) = forge {
            *self.inner.forge.write().await = forge;
        }
        Ok(())
    }

    pub async fn get_pool(&self, pool_id: &str) -> Result<Pool> {
        let entity_id = self.id().await;
        let pool = self.inner.store.get_pool(pool_id).await?;
        if pool.entity_id != entity_id {
            return Err(Error::not_found(format!("pool {pool_id}")));
        }
        Ok(pool)
    }

    pub async fn list_pools(&self) -> Result<Vec<Pool>> {
        let entity_id = self.id().await;
        self.inner.store.list_entity_pools(&entity_id).await
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        let entity_id = self.id().await;
        self.inner.store.list_entity_instances(&entity_id).await
    }

    pub async fn install_webhook(&self, url: &str) -> Result<forge::HookInfo> {
        let secret = self.webhook_secret().await;
        let forge = self.forge().await;
        self.forge_call(forge.install_webhook(url, &secret)).await
    }

    pub async fn webhook_info(&self) -> Result<Option<forge::HookInfo>> {
        let forge = self.forge().await;
        self.forge_call(forge.webhook_info()).await
    }

    pub async fn uninstall_webhook(&self, url: &str) -> Result<()> {
        let forge = self.forge().await;
        self.forge_call(forge.uninstall_webhook(url)).await
    }

    /// Webhook entrypoint. Cheap, idempotent and safe under duplicate
    /// delivery: a repeated `(job_id, action)` pair is a no-op.
    #[instrument(skip(self, job), fields(job_id = job.workflow_job.id, action = ?job.action))]
    pub async fn handle_workflow_job(&self, job: &WorkflowJob) -> Result<()> {
        let entity = self.entity().await;
        forge::validate_owner(&entity, job)?;

        let now = self.now();
        let previous = match self.inner.store.get_job(job.workflow_job.id).await {
            Ok(record) => Some(record),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        if previous.as_ref().is_some_and(|p| p.action == job.action) {
            tracing::debug!("duplicate workflow job delivery, ignoring");
            return Ok(());
        }

        let mut record = JobRecord::from_webhook(job, &entity.id, now);
        if let Some(previous) = previous {
            record.created_at = previous.created_at;
            record.locked_by = previous.locked_by;
            record.overflow = previous.overflow;
            if record.assigned_runner.is_none() {
                record.assigned_runner = previous.assigned_runner;
            }
        }

        match job.action {
            JobAction::Queued => {
                record.locked_by = Some(entity.id.clone());
                self.inner.store.upsert_job(record).await?;
                self.ensure_capacity_for_job(job).await?;
            }
            JobAction::InProgress => {
                let runner = record.assigned_runner.clone();
                let job_id = record.id;
                self.inner.store.upsert_job(record).await?;
                if let Some(runner) = runner {
                    self.mark_runner_active(&runner, job_id).await?;
                }
            }
            JobAction::Completed => {
                let runner = record.assigned_runner.clone();
                self.inner.store.upsert_job(record).await?;
                if let Some(runner) = runner {
                    self.retire_runner(&runner).await?;
                }
                // restore min idle promptly instead of waiting for the tick
                self.nudge_reconcile();
            }
        }
        Ok(())
    }

    /// Admin override: enters the delete path irrespective of runner status.
    pub async fn force_delete_runner(&self, name: &str) -> Result<()> {
        let entity_id = self.id().await;
        let instance = self.inner.store.get_instance(name).await?;
        let pool = self.inner.store.get_pool(&instance.pool_id).await?;
        if pool.entity_id != entity_id {
            return Err(Error::not_found(format!("instance {name}")));
        }

        let _guard = self.inner.locks.lock(name).await;
        let mut instance = self.inner.store.get_instance(name).await?;
        if matches!(
            instance.status,
            InstanceStatus::PendingDelete | InstanceStatus::Deleting
        ) {
            return Ok(());
        }
        let now = self.now();
        instance.status = InstanceStatus::PendingDelete;
        instance.push_status_message(now, "delete forced by operator");
        instance.updated_at = now;
        self.inner.store.update_instance(instance).await?;
        self.nudge_delete();
        Ok(())
    }

    /// One reconcile pass: repairs errored records into the delete path and
    /// tops every enabled pool back up to its idle floor, within max.
    #[instrument(skip(self))]
    pub async fn reconcile_once(&self) -> Result<()> {
        let entity_id = self.id().await;
        let pools = self.inner.store.list_entity_pools(&entity_id).await?;
        let mut created = 0usize;
        let mut repaired = 0usize;

        for pool in &pools {
            let instances = self.inner.store.list_pool_instances(&pool.id).await?;

            for instance in &instances {
                if instance.status == InstanceStatus::Error {
                    self.transition_instance(
                        &instance.name,
                        InstanceStatus::PendingDelete,
                        Some("scheduling removal of errored instance"),
                    )
                    .await?;
                    repaired += 1;
                }
            }

            if !pool.enabled {
                continue;
            }

            let idle = instances
                .iter()
                .filter(|i| {
                    i.status == InstanceStatus::Running && i.runner_status == RunnerStatus::Idle
                })
                .count();
            let provisioning = instances
                .iter()
                .filter(|i| match i.status {
                    InstanceStatus::PendingCreate | InstanceStatus::Creating => true,
                    InstanceStatus::Running => matches!(
                        i.runner_status,
                        RunnerStatus::Pending | RunnerStatus::Installing
                    ),
                    _ => false,
                })
                .count();
            let total = instances.len();

            let desired_idle = pool.min_idle_runners.min(pool.max_runners) as usize;
            let deficit = desired_idle.saturating_sub(idle + provisioning);
            let headroom = (pool.max_runners as usize).saturating_sub(total);
            let to_create = deficit.min(headroom);

            for _ in 0..to_create {
                self.new_pending_instance(pool).await?;
                created += 1;
            }
            if to_create > 0 {
                tracing::info!(
                    pool = %pool.id,
                    idle,
                    provisioning,
                    total,
                    to_create,
                    "replenishing idle capacity"
                );
            }
        }

        if created > 0 {
            self.nudge_create();
        }
        if repaired > 0 {
            self.nudge_delete();
        }
        Ok(())
    }

    /// Picks the best matching pool for a queued job and provisions one
    /// instance, or marks the job overflowed when nothing has headroom.
    async fn ensure_capacity_for_job(&self, job: &WorkflowJob) -> Result<()> {
        let entity_id = self.id().await;
        let pools = self.inner.store.list_entity_pools(&entity_id).await?;
        let labels = &job.workflow_job.labels;

        let mut candidates = Vec::new();
        for pool in pools {
            if !pool.enabled || !pool.matches_labels(labels) {
                continue;
            }
            let total = self.inner.store.list_pool_instances(&pool.id).await?.len();
            let headroom = (pool.max_runners as usize).saturating_sub(total);
            candidates.push((pool, headroom));
        }
        if candidates.is_empty() {
            tracing::debug!(job_id = job.workflow_job.id, "no pool matches the job labels");
            return Ok(());
        }

        // lowest priority value wins, then most headroom, oldest, id
        candidates.sort_by(|(a, ha), (b, hb)| {
            a.priority
                .cmp(&b.priority)
                .then(hb.cmp(ha))
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        match candidates.iter().find(|(_, headroom)| *headroom > 0) {
            Some((pool, _)) => {
                let name = self.new_pending_instance(pool).await?;
                tracing::info!(
                    job_id = job.workflow_job.id,
                    pool = %pool.id,
                    instance = %name,
                    "provisioning runner for queued job"
                );
                self.nudge_create();
            }
            None => {
                let mut record = self.inner.store.get_job(job.workflow_job.id).await?;
                record.overflow = true;
                record.updated_at = self.now();
                self.inner.store.upsert_job(record).await?;
                tracing::warn!(
                    job_id = job.workflow_job.id,
                    "no matching pool has headroom, job marked overflow"
                );
            }
        }
        Ok(())
    }

    async fn mark_runner_active(&self, runner_name: &str, job_id: i64) -> Result<()> {
        let _guard = self.inner.locks.lock(runner_name).await;
        let mut instance = match self.inner.store.get_instance(runner_name).await {
            Ok(instance) => instance,
            // job landed on a runner this manager does not own
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if instance.runner_status.can_advance_to(RunnerStatus::Active) {
            instance.runner_status = RunnerStatus::Active;
        }
        instance.job_id = Some(job_id);
        instance.updated_at = self.now();
        self.inner.store.update_instance(instance).await?;
        Ok(())
    }

    /// A completed job retires its instance; instances are never re-used.
    async fn retire_runner(&self, runner_name: &str) -> Result<()> {
        let _guard = self.inner.locks.lock(runner_name).await;
        let mut instance = match self.inner.store.get_instance(runner_name).await {
            Ok(instance) => instance,
            // completed event for an unknown runner is record-only
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if matches!(
            instance.status,
            InstanceStatus::PendingDelete | InstanceStatus::Deleting
        ) {
            return Ok(());
        }
        let now = self.now();
        instance.status = InstanceStatus::PendingDelete;
        if instance.runner_status.can_advance_to(RunnerStatus::Terminated) {
            instance.runner_status = RunnerStatus::Terminated;
        }
        instance.push_status_message(now, "job completed, retiring instance");
        instance.updated_at = now;
        self.inner.store.update_instance(instance).await?;
        self.nudge_delete();
        Ok(())
    }

    /// Serialized status change with transition validation. An illegal
    /// transition is logged and the record coerced to `error`.
    pub(super) async fn transition_instance(
        &self,
        name: &str,
        to: InstanceStatus,
        message: Option<&str>,
    ) -> Result<Instance> {
        let _guard = self.inner.locks.lock(name).await;
        let mut instance = self.inner.store.get_instance(name).await?;
        let now = self.now();
        if instance.status.can_transition_to(to) {
            instance.status = to;
            if let Some(message) = message {
                instance.push_status_message(now, message);
            }
        } else {
            tracing::error!(
                instance = %name,
                from = %instance.status,
                to = %to,
                "illegal instance state transition, coercing to error"
            );
            let from = instance.status;
            instance.status = InstanceStatus::Error;
            instance.push_status_message(now, format!("illegal transition {from} -> {to}"));
        }
        instance.updated_at = now;
        self.inner.store.update_instance(instance).await
    }

    async fn new_pending_instance(&self, pool: &Pool) -> Result<String> {
        // name collisions are possible, just improbable
        for _ in 0..3 {
            let name = self.generate_name();
            let instance = Instance::new(&name, &pool.id, self.now());
            match self.inner.store.add_instance(instance).await {
                Ok(_) => return Ok(name),
                Err(Error::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::conflict("could not allocate a unique instance name"))
    }

    pub(super) fn generate_name(&self) -> String {
        let mut rng = self
            .inner
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let suffix: String = (&mut *rng)
            .sample_iter(rand::distr::Alphanumeric)
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            .take(8)
            .map(char::from)
            .collect();
        format!("{}-{}", self.inner.cfg.runner_prefix, suffix)
    }

    pub(super) fn generate_instance_token(&self) -> String {
        let mut rng = self
            .inner
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (&mut *rng)
            .sample_iter(rand::distr::Alphanumeric)
            .take(32)
            .map(char::from)
            .collect()
    }

    /// Delete operations interrupted by a previous shutdown are picked up
    /// again before the workers start.
    async fn resume_interrupted_deletes(&self) -> Result<()> {
        let entity_id = self.id().await;
        let instances = self.inner.store.list_entity_instances(&entity_id).await?;
        let mut resumed = 0usize;
        for instance in instances {
            if instance.status == InstanceStatus::Deleting {
                self.transition_instance(
                    &instance.name,
                    InstanceStatus::PendingDelete,
                    Some("resuming interrupted delete"),
                )
                .await?;
                resumed += 1;
            }
        }
        if resumed > 0 {
            tracing::info!(entity = %entity_id, resumed, "re-queued interrupted deletes");
            self.nudge_delete();
        }
        Ok(())
    }

    pub(super) fn nudge_reconcile(&self) {
        let _ = self.inner.wake_reconcile_tx.try_send(());
    }

    pub(super) fn nudge_create(&self) {
        let _ = self.inner.wake_create_tx.try_send(());
    }

    pub(super) fn nudge_delete(&self) {
        let _ = self.inner.wake_delete_tx.try_send(());
    }

    pub(super) async fn forge_call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        guarded(&self.inner.token, self.inner.cfg.forge_call_timeout, fut).await
    }

    pub(super) async fn provider_call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        guarded(&self.inner.token, self.inner.cfg.provider_call_timeout, fut).await
    }

    pub(super) async fn degrade(&self, error: &Error) {
        let entity_id = self.id().await;
        tracing::error!(entity = %entity_id, error = %error, "pool manager degraded");
        self.inner.events.notify(LifecycleEvent::ManagerDegraded {
            entity_id,
            reason: error.to_string(),
        });
        self.inner.token.cancel();
    }

    async fn run_reconciler(self, mut wake: mpsc::Receiver<()>) {
        let mut tick = tokio::time::interval(self.inner.cfg.reconcile_interval);
        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => break,
                _ = tick.tick() => {},
                Some(_) = wake.recv() => {},
            }
            if let Err(e) = self.reconcile_once().await {
                if e.is_fatal() {
                    self.degrade(&e).await;
                    break;
                }
                tracing::error!(error = %e, "reconcile pass failed");
            }
        }
    }

    async fn run_create_worker(self, mut wake: mpsc::Receiver<()>) {
        let mut tick = tokio::time::interval(self.inner.cfg.drain_interval);
        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => break,
                _ = tick.tick() => {},
                Some(_) = wake.recv() => {},
            }
            if let Err(e) = self.drain_creates().await {
                if e.is_fatal() {
                    self.degrade(&e).await;
                    break;
                }
                tracing::error!(error = %e, "create drain failed");
            }
        }
    }

    async fn run_delete_worker(self, mut wake: mpsc::Receiver<()>) {
        let mut tick = tokio::time::interval(self.inner.cfg.drain_interval);
        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => break,
                _ = tick.tick() => {},
                Some(_) = wake.recv() => {},
            }
            if let Err(e) = self.drain_deletes().await {
                if e.is_fatal() {
                    self.degrade(&e).await;
                    break;
                }
                tracing::error!(error = %e, "delete drain failed");
            }
        }
    }

    async fn run_observer(self) {
        let mut tick = tokio::time::interval(self.inner.cfg.observer_interval);
        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => break,
                _ = tick.tick() => {},
            }
            if let Err(e) = self.observe_once().await {
                if e.is_fatal() {
                    self.degrade(&e).await;
                    break;
                }
                tracing::error!(error = %e, "observer pass failed");
            }
        }
    }

    async fn run_sweeper(self) {
        let mut tick = tokio::time::interval(self.inner.cfg.sweeper_interval);
        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => break,
                _ = tick.tick() => {},
            }
            if let Err(e) = self.sweep_once().await {
                if e.is_fatal() {
                    self.degrade(&e).await;
                    break;
                }
                tracing::error!(error = %e, "sweeper pass failed");
            }
        }
    }

    async fn run_tool_fetcher(self) {
        let mut tick = tokio::time::interval(self.inner.cfg.tools_interval);
        // the cache was primed at start, skip the immediate first tick
        tick.tick().await;
        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => break,
                _ = tick.tick() => {},
            }
            let forge = self.forge().await;
            if let Err(e) = self
                .inner
                .tools
                .refresh(forge.as_ref(), self.inner.clock.as_ref())
                .await
            {
                tracing::warn!(error = %e, "refreshing runner tools failed");
            }
        }
    }
}
