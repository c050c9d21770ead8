mod manager;
mod observer;
mod workers;

pub use manager::PoolManager;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::Tuning;
use crate::error::{Error, Result};

/// Knobs of one pool manager. Derived from the host tuning table; tests
/// construct it directly with short intervals.
#[derive(Clone, Debug)]
pub struct PoolManagerConfig {
    pub runner_prefix: String,
    pub reconcile_interval: Duration,
    pub observer_interval: Duration,
    pub sweeper_interval: Duration,
    pub tools_interval: Duration,
    pub drain_interval: Duration,
    pub create_concurrency: usize,
    pub delete_concurrency: usize,
    pub shutdown_grace: Duration,
    pub provider_settle_grace: Duration,
    pub provider_call_timeout: Duration,
    pub forge_call_timeout: Duration,
    pub backoff: Backoff,
    pub job_record_ttl: Duration,
}

impl PoolManagerConfig {
    pub fn from_tuning(runner_prefix: impl Into<String>, tuning: &Tuning) -> Self {
        PoolManagerConfig {
            runner_prefix: runner_prefix.into(),
            reconcile_interval: tuning.reconcile_interval(),
            observer_interval: tuning.observer_interval(),
            sweeper_interval: tuning.sweeper_interval(),
            tools_interval: tuning.tools_refresh(),
            drain_interval: tuning.create_drain(),
            create_concurrency: tuning.create_concurrency,
            delete_concurrency: tuning.delete_concurrency,
            shutdown_grace: tuning.shutdown_grace(),
            provider_settle_grace: tuning.provider_settle_grace(),
            provider_call_timeout: tuning.provider_call_timeout(),
            forge_call_timeout: tuning.forge_call_timeout(),
            backoff: tuning.backoff(),
            job_record_ttl: tuning.job_record_ttl(),
        }
    }
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        PoolManagerConfig::from_tuning("gha", &Tuning::default())
    }
}

/// Lifecycle notifications a manager emits back to whoever owns it.
/// The narrow surface keeps manager and controller from owning each other.
#[derive(Clone, Debug)]
pub enum LifecycleEvent {
    ManagerStarted { entity_id: String },
    ManagerStopped { entity_id: String },
    ManagerDegraded { entity_id: String, reason: String },
}

pub trait EventSink: Send + Sync {
    fn notify(&self, event: LifecycleEvent);
}

pub struct NullSink;

impl EventSink for NullSink {
    fn notify(&self, _event: LifecycleEvent) {}
}

/// Keyed mutex map giving every instance name a single writer. All state
/// transitions for one instance are serialized through its entry.
#[derive(Default)]
pub struct InstanceLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().await;
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    pub async fn forget(&self, name: &str) {
        self.inner.lock().await.remove(name);
    }
}

/// Wraps an I/O future with the per-call timeout and the manager's
/// cancellation token. Both outcomes surface as `Transient`, which workers
/// absorb; after Stop() no call result is ever acted on.
pub(crate) async fn guarded<T>(
    token: &CancellationToken,
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = token.cancelled() => Err(Error::transient("operation cancelled")),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(Error::transient("call exceeded its timeout")),
        },
    }
}
