use std::collections::{HashMap, HashSet};

use super::manager::PoolManager;
use crate::error::Result;
use crate::params::{
    ForgeRunner, InstanceStatus, ProviderInstance, ProviderInstanceStatus, RunnerStatus,
};

impl PoolManager {
    /// One observer pass: refreshes instance status from the provider,
    /// runner status from the forge, coerces orphans and removes ghosts.
    pub async fn observe_once(&self) -> Result<()> {
        let entity_id = self.id().await;
        let pools = self.inner.store.list_entity_pools(&entity_id).await?;

        for pool in &pools {
            let provider = match self.provider_for(pool) {
                Ok(provider) => provider,
                Err(e) => {
                    tracing::error!(pool = %pool.id, error = %e, "skipping unobservable pool");
                    continue;
                }
            };
            let listed = match self.provider_call(provider.list_instances(&pool.id)).await {
                Ok(listed) => listed,
                Err(e) => {
                    tracing::warn!(pool = %pool.id, error = %e, "listing provider instances failed");
                    continue;
                }
            };
            let by_name: HashMap<&str, &ProviderInstance> =
                listed.iter().map(|i| (i.name.as_str(), i)).collect();

            for instance in self.inner.store.list_pool_instances(&pool.id).await? {
                self.observe_provider_instance(&instance.name, by_name.get(instance.name.as_str()).copied())
                    .await?;
            }
        }

        // one runner listing covers the whole entity
        let forge = self.forge().await;
        let runners = match self.forge_call(forge.list_runners()).await {
            Ok(runners) => runners,
            Err(e) => {
                tracing::warn!(error = %e, "listing forge runners failed");
                return Ok(());
            }
        };
        let by_name: HashMap<&str, &ForgeRunner> =
            runners.iter().map(|r| (r.name.as_str(), r)).collect();

        let instances = self.inner.store.list_entity_instances(&entity_id).await?;
        let known: HashSet<&str> = instances.iter().map(|i| i.name.as_str()).collect();

        for instance in &instances {
            if let Some(runner) = by_name.get(instance.name.as_str()) {
                self.observe_forge_runner(&instance.name, runner).await?;
            }
        }

        // a forge runner we carry no record for is a ghost
        let prefix = format!("{}-", self.inner.cfg.runner_prefix);
        for runner in &runners {
            if runner.name.starts_with(&prefix) && !known.contains(runner.name.as_str()) {
                match self.forge_call(forge.remove_runner(runner.id)).await {
                    Ok(()) => {
                        tracing::info!(runner = %runner.name, "removed ghost forge runner");
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        tracing::warn!(runner = %runner.name, error = %e, "removing ghost runner failed");
                    }
                }
            }
        }
        Ok(())
    }

    async fn observe_provider_instance(
        &self,
        name: &str,
        observed: Option<&ProviderInstance>,
    ) -> Result<()> {
        let _guard = self.inner.locks.lock(name).await;
        let mut instance = match self.inner.store.get_instance(name).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        // records on the way in or out are not driven by provider state
        if matches!(
            instance.status,
            InstanceStatus::PendingCreate
                | InstanceStatus::PendingDelete
                | InstanceStatus::Deleting
                | InstanceStatus::Error
        ) {
            return Ok(());
        }
        let now = self.now();

        match observed {
            Some(provider_instance) => {
                let new_status = match provider_instance.status {
                    ProviderInstanceStatus::Running => InstanceStatus::Running,
                    ProviderInstanceStatus::Stopped => InstanceStatus::Stopped,
                    ProviderInstanceStatus::Error => InstanceStatus::Error,
                    // transient, re-resolved on the next pass
                    ProviderInstanceStatus::Unknown => return Ok(()),
                };
                let mut dirty = false;
                if instance.provider_id.is_none() {
                    instance.provider_id = Some(provider_instance.provider_id.clone());
                    dirty = true;
                }
                if instance.addresses != provider_instance.addresses {
                    instance.addresses = provider_instance.addresses.clone();
                    dirty = true;
                }
                if instance.status != new_status {
                    if instance.status.can_transition_to(new_status) {
                        if new_status == InstanceStatus::Error {
                            instance
                                .push_status_message(now, "provider reports the instance errored");
                        }
                        instance.status = new_status;
                    } else {
                        tracing::error!(
                            instance = %name,
                            from = %instance.status,
                            to = %new_status,
                            "illegal observed transition, coercing to error"
                        );
                        instance.status = InstanceStatus::Error;
                        instance.push_status_message(now, "coerced to error by observer");
                    }
                    dirty = true;
                }
                if dirty {
                    instance.updated_at = now;
                    self.inner.store.update_instance(instance).await?;
                }
            }
            None => {
                match instance.status {
                    InstanceStatus::Creating => {
                        // the provider may be eventually consistent
                        let age = now - instance.updated_at;
                        let grace = chrono::Duration::from_std(
                            self.inner.cfg.provider_settle_grace,
                        )
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                        if age > grace {
                            instance.status = InstanceStatus::Error;
                            instance.push_status_message(
                                now,
                                "provider never materialized the instance",
                            );
                            instance.updated_at = now;
                            self.inner.store.update_instance(instance).await?;
                        }
                    }
                    InstanceStatus::Running | InstanceStatus::Stopped => {
                        tracing::warn!(instance = %name, "orphaned instance, no provider match");
                        instance.status = InstanceStatus::Error;
                        instance.push_status_message(now, "orphaned: provider lost the instance");
                        instance.updated_at = now;
                        self.inner.store.update_instance(instance).await?;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn observe_forge_runner(&self, name: &str, runner: &ForgeRunner) -> Result<()> {
        let _guard = self.inner.locks.lock(name).await;
        let mut instance = match self.inner.store.get_instance(name).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut dirty = false;
        if instance.agent_id.is_none() {
            instance.agent_id = Some(runner.id);
            dirty = true;
        }
        let observed = if runner.busy {
            RunnerStatus::Active
        } else if runner.is_online() {
            RunnerStatus::Idle
        } else {
            // registered but not yet connected
            RunnerStatus::Installing
        };
        if instance.runner_status != observed && instance.runner_status.can_advance_to(observed) {
            instance.runner_status = observed;
            dirty = true;
        }
        if dirty {
            instance.updated_at = self.now();
            self.inner.store.update_instance(instance).await?;
        }
        Ok(())
    }

    /// Reaps instances stuck bootstrapping past the pool's timeout and
    /// expires completed job records past their retention.
    pub async fn sweep_once(&self) -> Result<()> {
        let entity_id = self.id().await;
        let pools = self.inner.store.list_entity_pools(&entity_id).await?;
        let now = self.now();
        let mut reaped = 0usize;

        for pool in &pools {
            let timeout = chrono::Duration::minutes(i64::from(pool.runner_bootstrap_timeout));
            for instance in self.inner.store.list_pool_instances(&pool.id).await? {
                let bootstrapping = match instance.status {
                    InstanceStatus::Creating => true,
                    InstanceStatus::Running => matches!(
                        instance.runner_status,
                        RunnerStatus::Pending | RunnerStatus::Installing
                    ),
                    _ => false,
                };
                if bootstrapping && now - instance.created_at > timeout {
                    let _guard = self.inner.locks.lock(&instance.name).await;
                    let mut instance = match self.inner.store.get_instance(&instance.name).await {
                        Ok(instance) => instance,
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e),
                    };
                    // it may have come up between the listing and the lock
                    let still_stuck = match instance.status {
                        InstanceStatus::Creating => true,
                        InstanceStatus::Running => matches!(
                            instance.runner_status,
                            RunnerStatus::Pending | RunnerStatus::Installing
                        ),
                        _ => false,
                    };
                    if !still_stuck {
                        continue;
                    }
                    instance.status = InstanceStatus::PendingDelete;
                    if instance.runner_status.can_advance_to(RunnerStatus::Failed) {
                        instance.runner_status = RunnerStatus::Failed;
                    }
                    instance.push_status_message(
                        now,
                        format!(
                            "runner did not come up within {} minutes",
                            pool.runner_bootstrap_timeout
                        ),
                    );
                    instance.updated_at = now;
                    self.inner.store.update_instance(instance).await?;
                    reaped += 1;
                }
            }
        }
        if reaped > 0 {
            tracing::info!(reaped, "reaped instances that missed their bootstrap deadline");
            self.nudge_delete();
            self.nudge_reconcile();
        }

        let retention = chrono::Duration::from_std(self.inner.cfg.job_record_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let removed = self
            .inner
            .store
            .delete_completed_jobs_before(now - retention)
            .await?;
        if removed > 0 {
            tracing::debug!(removed, "expired completed job records");
        }
        Ok(())
    }
}
