use futures::{StreamExt, stream};

use super::manager::PoolManager;
use crate::cloud_config;
use crate::error::Result;
use crate::params::{
    BootstrapParams, Entity, Instance, InstanceStatus, Pool, ProviderInstance,
};

impl PoolManager {
    /// Drains every `pending_create` record that is due, with bounded
    /// concurrency. Transient failures stay in `pending_create` under the
    /// backoff policy and never leave the worker.
    pub async fn drain_creates(&self) -> Result<()> {
        let entity_id = self.id().await;
        let instances = self.inner.store.list_entity_instances(&entity_id).await?;
        let now = self.now();
        let due: Vec<String> = instances
            .into_iter()
            .filter(|i| {
                i.status == InstanceStatus::PendingCreate
                    && i.next_retry_at.is_none_or(|at| at <= now)
            })
            .map(|i| i.name)
            .collect();
        if due.is_empty() {
            return Ok(());
        }

        let results = stream::iter(due.into_iter().map(|name| {
            let manager = self.clone();
            async move { manager.process_create(name).await }
        }))
        .buffer_unordered(self.inner.cfg.create_concurrency)
        .collect::<Vec<_>>()
        .await;

        for result in results {
            if let Err(e) = result {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::error!(error = %e, "create operation failed");
            }
        }
        Ok(())
    }

    async fn process_create(&self, name: String) -> Result<()> {
        let _guard = self.inner.locks.lock(&name).await;
        let mut instance = match self.inner.store.get_instance(&name).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if instance.status != InstanceStatus::PendingCreate {
            return Ok(());
        }
        let now = self.now();
        if instance.next_retry_at.is_some_and(|at| at > now) {
            return Ok(());
        }

        let pool = match self.inner.store.get_pool(&instance.pool_id).await {
            Ok(pool) => pool,
            Err(e) if e.is_not_found() => {
                tracing::warn!(instance = %name, "pool vanished, removing pending record");
                self.inner.store.remove_instance(&name).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let entity = self.entity().await;

        match self.try_boot_instance(&mut instance, &pool, &entity).await {
            Ok(created) => {
                let now = self.now();
                instance.provider_id = Some(created.provider_id);
                instance.addresses = created.addresses;
                instance.status = InstanceStatus::Creating;
                instance.next_retry_at = None;
                instance.push_status_message(now, "instance created in provider");
                instance.updated_at = now;
                self.inner.store.update_instance(instance).await?;
                tracing::info!(instance = %name, pool = %pool.id, "successfully created instance");
            }
            Err(e) => {
                let now = self.now();
                instance.create_attempts += 1;
                instance.push_status_message(now, format!("create failed: {e}"));
                instance.updated_at = now;

                let delay = if e.is_transient() {
                    let mut rng = self
                        .inner
                        .rng
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    self.inner
                        .cfg
                        .backoff
                        .delay(instance.create_attempts, &mut *rng)
                } else {
                    None
                };

                match delay {
                    Some(delay) => {
                        let delay = chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(300));
                        instance.next_retry_at = Some(now + delay);
                        tracing::warn!(
                            instance = %name,
                            attempt = instance.create_attempts,
                            error = %e,
                            "create failed, retrying with backoff"
                        );
                        self.inner.store.update_instance(instance).await?;
                    }
                    None => {
                        let attempts = instance.create_attempts;
                        instance.status = InstanceStatus::Error;
                        instance.push_status_message(now, "create retry budget exhausted");
                        self.inner.store.update_instance(instance).await?;
                        tracing::error!(
                            instance = %name,
                            attempts,
                            error = %e,
                            "giving up on instance creation"
                        );
                        self.nudge_reconcile();
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetches registration credentials (JIT preferred), renders cloud-init
    /// and calls the provider. Mutates bookkeeping fields on `instance`;
    /// the caller commits them.
    async fn try_boot_instance(
        &self,
        instance: &mut Instance,
        pool: &Pool,
        entity: &Entity,
    ) -> Result<ProviderInstance> {
        let provider = self.provider_for(pool)?;
        let forge = self.forge().await;

        let tools = self
            .forge_call(self.inner.tools.get_or_fetch(forge.as_ref(), self.inner.clock.as_ref()))
            .await?;

        // a failed earlier attempt may have left a half-registered runner
        if let Some(stale) = instance.agent_id.take() {
            if let Err(e) = self.forge_call(forge.remove_runner(stale)).await {
                if !e.is_not_found() {
                    instance.agent_id = Some(stale);
                    return Err(e);
                }
            }
        }

        let labels = pool.tags.clone();
        let mut jit_config = None;
        let mut registration_token = None;
        match self
            .forge_call(forge.jit_runner_config(
                &instance.name,
                &labels,
                pool.github_runner_group.as_deref(),
            ))
            .await
        {
            Ok(jit) => {
                instance.agent_id = Some(jit.runner_id);
                instance.token_fetched = true;
                jit_config = Some(jit.encoded_jit_config);
            }
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    instance = %instance.name,
                    error = %e,
                    "jit config unavailable, falling back to a registration token"
                );
                let token = self.forge_call(forge.registration_token()).await?;
                instance.token_fetched = true;
                registration_token = Some(token);
            }
        }

        let mut bootstrap = BootstrapParams {
            name: instance.name.clone(),
            pool_id: pool.id.clone(),
            image: pool.image.clone(),
            flavor: pool.flavor.clone(),
            os_type: pool.os_type,
            os_arch: pool.os_arch,
            labels,
            tools,
            repo_url: entity.forge_url(),
            callback_url: entity.internal.callback_url.clone(),
            metadata_url: entity.internal.metadata_url.clone(),
            instance_token: self.generate_instance_token(),
            jit_config,
            registration_token,
            github_runner_group: pool.github_runner_group.clone(),
            extra_specs: pool.extra_specs.clone(),
            user_data: String::new(),
        };
        bootstrap.user_data = cloud_config::build_user_data(&bootstrap)?;

        self.provider_call(provider.create_instance(&bootstrap)).await
    }

    /// Drains `pending_delete` records. Teardown is forge runner first,
    /// provider instance second, store record last; every sub-step is
    /// idempotent and a failed step returns the record to `pending_delete`.
    pub async fn drain_deletes(&self) -> Result<()> {
        let entity_id = self.id().await;
        let instances = self.inner.store.list_entity_instances(&entity_id).await?;
        let due: Vec<String> = instances
            .into_iter()
            .filter(|i| i.status == InstanceStatus::PendingDelete)
            .map(|i| i.name)
            .collect();
        if due.is_empty() {
            return Ok(());
        }

        let results = stream::iter(due.into_iter().map(|name| {
            let manager = self.clone();
            async move { manager.process_delete(name).await }
        }))
        .buffer_unordered(self.inner.cfg.delete_concurrency)
        .collect::<Vec<_>>()
        .await;

        for result in results {
            if let Err(e) = result {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::error!(error = %e, "delete operation failed");
            }
        }
        Ok(())
    }

    async fn process_delete(&self, name: String) -> Result<()> {
        let _guard = self.inner.locks.lock(&name).await;
        let mut instance = match self.inner.store.get_instance(&name).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if !matches!(
            instance.status,
            InstanceStatus::PendingDelete | InstanceStatus::Deleting
        ) {
            return Ok(());
        }

        let now = self.now();
        instance.status = InstanceStatus::Deleting;
        instance.updated_at = now;
        let mut instance = self.inner.store.update_instance(instance).await?;

        if let Some(agent_id) = instance.agent_id {
            let forge = self.forge().await;
            match self.forge_call(forge.remove_runner(agent_id)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    return self.defer_delete(instance, format!("removing forge runner: {e}")).await;
                }
            }
            instance.agent_id = None;
        }

        match self.inner.store.get_pool(&instance.pool_id).await {
            Ok(pool) => {
                let provider = match self.provider_for(&pool) {
                    Ok(provider) => provider,
                    Err(e) => {
                        return self
                            .defer_delete(instance, format!("resolving provider: {e}"))
                            .await;
                    }
                };
                match self.provider_call(provider.delete_instance(&name)).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        return self
                            .defer_delete(instance, format!("deleting provider instance: {e}"))
                            .await;
                    }
                }
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(instance = %name, "pool vanished, skipping provider cleanup");
            }
            Err(e) => return Err(e),
        }

        self.inner.store.remove_instance(&name).await?;
        self.inner.locks.forget(&name).await;
        tracing::info!(instance = %name, "successfully deleted instance");
        Ok(())
    }

    async fn defer_delete(&self, mut instance: Instance, message: String) -> Result<()> {
        let now = self.now();
        tracing::warn!(instance = %instance.name, "{message}, will retry");
        instance.status = InstanceStatus::PendingDelete;
        instance.push_status_message(now, message);
        instance.updated_at = now;
        self.inner.store.update_instance(instance).await?;
        Ok(())
    }
}
