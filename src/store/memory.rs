use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::Store;
use crate::crypto::SecretCipher;
use crate::error::{Error, Result};
use crate::params::{Entity, Instance, JobAction, JobRecord, Pool};

/// Map-backed store. Webhook secrets are sealed before they land in the
/// maps and opened on the way out, the same discipline a durable backend
/// would apply.
pub struct MemoryStore {
    cipher: SecretCipher,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    entities: HashMap<String, Entity>,
    pools: HashMap<String, Pool>,
    instances: HashMap<String, Instance>,
    jobs: HashMap<i64, JobRecord>,
}

impl MemoryStore {
    pub fn new(cipher: SecretCipher) -> Self {
        MemoryStore {
            cipher,
            inner: RwLock::new(Inner::default()),
        }
    }

    fn seal_entity(&self, mut entity: Entity) -> Result<Entity> {
        entity.webhook_secret = self.cipher.seal(&entity.webhook_secret)?;
        Ok(entity)
    }

    fn open_entity(&self, mut entity: Entity) -> Result<Entity> {
        entity.webhook_secret = self.cipher.open(&entity.webhook_secret)?;
        Ok(entity)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_entity(&self, entity: Entity) -> Result<Entity> {
        let sealed = self.seal_entity(entity.clone())?;
        let mut inner = self.inner.write().await;
        if inner.entities.contains_key(&entity.id) {
            return Err(Error::conflict(format!("entity {} already exists", entity.id)));
        }
        if inner
            .entities
            .values()
            .any(|e| e.kind == entity.kind && e.name.eq_ignore_ascii_case(&entity.name))
        {
            return Err(Error::conflict(format!(
                "{} {} already exists",
                entity.kind, entity.name
            )));
        }
        inner.entities.insert(entity.id.clone(), sealed);
        Ok(entity)
    }

    async fn get_entity(&self, id: &str) -> Result<Entity> {
        let inner = self.inner.read().await;
        let entity = inner
            .entities
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("entity {id}")))?;
        self.open_entity(entity)
    }

    async fn list_entities(&self) -> Result<Vec<Entity>> {
        let inner = self.inner.read().await;
        let mut out = Vec::with_capacity(inner.entities.len());
        for entity in inner.entities.values() {
            out.push(self.open_entity(entity.clone())?);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn update_entity(&self, entity: Entity) -> Result<Entity> {
        let sealed = self.seal_entity(entity.clone())?;
        let mut inner = self.inner.write().await;
        if !inner.entities.contains_key(&entity.id) {
            return Err(Error::not_found(format!("entity {}", entity.id)));
        }
        inner.entities.insert(entity.id.clone(), sealed);
        Ok(entity)
    }

    async fn delete_entity(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.pools.values().any(|p| p.entity_id == id) {
            return Err(Error::bad_request(format!(
                "entity {id} still has pools defined"
            )));
        }
        inner
            .entities
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("entity {id}")))
    }

    async fn create_pool(&self, pool: Pool) -> Result<Pool> {
        let mut inner = self.inner.write().await;
        if !inner.entities.contains_key(&pool.entity_id) {
            return Err(Error::not_found(format!("entity {}", pool.entity_id)));
        }
        if inner.pools.contains_key(&pool.id) {
            return Err(Error::conflict(format!("pool {} already exists", pool.id)));
        }
        inner.pools.insert(pool.id.clone(), pool.clone());
        Ok(pool)
    }

    async fn get_pool(&self, id: &str) -> Result<Pool> {
        let inner = self.inner.read().await;
        inner
            .pools
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("pool {id}")))
    }

    async fn list_entity_pools(&self, entity_id: &str) -> Result<Vec<Pool>> {
        let inner = self.inner.read().await;
        let mut pools: Vec<Pool> = inner
            .pools
            .values()
            .filter(|p| p.entity_id == entity_id)
            .cloned()
            .collect();
        pools.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(pools)
    }

    async fn update_pool(&self, pool: Pool) -> Result<Pool> {
        let mut inner = self.inner.write().await;
        if !inner.pools.contains_key(&pool.id) {
            return Err(Error::not_found(format!("pool {}", pool.id)));
        }
        inner.pools.insert(pool.id.clone(), pool.clone());
        Ok(pool)
    }

    async fn delete_pool(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.instances.values().any(|i| i.pool_id == id) {
            return Err(Error::bad_request(format!("pool {id} still has runners")));
        }
        inner
            .pools
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("pool {id}")))
    }

    async fn add_instance(&self, instance: Instance) -> Result<Instance> {
        let mut inner = self.inner.write().await;
        if !inner.pools.contains_key(&instance.pool_id) {
            return Err(Error::not_found(format!("pool {}", instance.pool_id)));
        }
        if inner.instances.contains_key(&instance.name) {
            return Err(Error::conflict(format!(
                "instance {} already exists",
                instance.name
            )));
        }
        inner.instances.insert(instance.name.clone(), instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, name: &str) -> Result<Instance> {
        let inner = self.inner.read().await;
        inner
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("instance {name}")))
    }

    async fn list_pool_instances(&self, pool_id: &str) -> Result<Vec<Instance>> {
        let inner = self.inner.read().await;
        let mut instances: Vec<Instance> = inner
            .instances
            .values()
            .filter(|i| i.pool_id == pool_id)
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }

    async fn list_entity_instances(&self, entity_id: &str) -> Result<Vec<Instance>> {
        let inner = self.inner.read().await;
        let mut instances: Vec<Instance> = inner
            .instances
            .values()
            .filter(|i| {
                inner
                    .pools
                    .get(&i.pool_id)
                    .is_some_and(|p| p.entity_id == entity_id)
            })
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }

    async fn update_instance(&self, instance: Instance) -> Result<Instance> {
        let mut inner = self.inner.write().await;
        if !inner.instances.contains_key(&instance.name) {
            return Err(Error::not_found(format!("instance {}", instance.name)));
        }
        inner.instances.insert(instance.name.clone(), instance.clone());
        Ok(instance)
    }

    async fn remove_instance(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.instances.remove(name);
        Ok(())
    }

    async fn upsert_job(&self, job: JobRecord) -> Result<JobRecord> {
        let mut inner = self.inner.write().await;
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: i64) -> Result<JobRecord> {
        let inner = self.inner.read().await;
        inner
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("job {id}")))
    }

    async fn list_entity_jobs(&self, entity_id: &str) -> Result<Vec<JobRecord>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<JobRecord> = inner
            .jobs
            .values()
            .filter(|j| j.entity_id == entity_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn delete_completed_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, j| !(j.action == JobAction::Completed && j.updated_at < cutoff));
        Ok(before - inner.jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{EntityKind, InstanceStatus, InternalConfig, OsArch, OsType};

    fn store() -> MemoryStore {
        MemoryStore::new(SecretCipher::new("test-passphrase"))
    }

    fn entity(id: &str, name: &str) -> Entity {
        Entity {
            id: id.into(),
            kind: EntityKind::Organization,
            name: name.into(),
            credentials_name: "default".into(),
            webhook_secret: "super-secret".into(),
            internal: InternalConfig::default(),
            created_at: Utc::now(),
        }
    }

    fn pool(id: &str, entity_id: &str) -> Pool {
        Pool {
            id: id.into(),
            entity_id: entity_id.into(),
            provider_name: "openstack".into(),
            image: "img".into(),
            flavor: "small".into(),
            os_type: OsType::Linux,
            os_arch: OsArch::Amd64,
            tags: vec!["self-hosted".into()],
            min_idle_runners: 0,
            max_runners: 2,
            runner_bootstrap_timeout: 20,
            enabled: true,
            priority: 0,
            extra_specs: serde_json::Value::Null,
            github_runner_group: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn webhook_secret_round_trips_through_sealing() {
        let s = store();
        s.create_entity(entity("e1", "acme")).await.unwrap();
        let loaded = s.get_entity("e1").await.unwrap();
        assert_eq!(loaded.webhook_secret, "super-secret");
        // the stored copy must not be the plaintext
        let raw = s.inner.read().await.entities.get("e1").unwrap().clone();
        assert_ne!(raw.webhook_secret, "super-secret");
    }

    #[tokio::test]
    async fn duplicate_entity_name_conflicts() {
        let s = store();
        s.create_entity(entity("e1", "acme")).await.unwrap();
        let err = s.create_entity(entity("e2", "ACME")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn entity_with_pools_cannot_be_deleted() {
        let s = store();
        s.create_entity(entity("e1", "acme")).await.unwrap();
        s.create_pool(pool("p1", "e1")).await.unwrap();
        assert!(s.delete_entity("e1").await.is_err());
        s.delete_pool("p1").await.unwrap();
        s.delete_entity("e1").await.unwrap();
    }

    #[tokio::test]
    async fn instance_indexes_by_pool_and_entity() {
        let s = store();
        s.create_entity(entity("e1", "acme")).await.unwrap();
        s.create_pool(pool("p1", "e1")).await.unwrap();
        s.create_pool(pool("p2", "e1")).await.unwrap();
        s.add_instance(Instance::new("gha-a", "p1", Utc::now()))
            .await
            .unwrap();
        s.add_instance(Instance::new("gha-b", "p2", Utc::now()))
            .await
            .unwrap();

        assert_eq!(s.list_pool_instances("p1").await.unwrap().len(), 1);
        assert_eq!(s.list_entity_instances("e1").await.unwrap().len(), 2);

        let mut inst = s.get_instance("gha-a").await.unwrap();
        inst.status = InstanceStatus::Creating;
        s.update_instance(inst).await.unwrap();
        assert_eq!(
            s.get_instance("gha-a").await.unwrap().status,
            InstanceStatus::Creating
        );
    }

    #[tokio::test]
    async fn completed_jobs_are_swept_by_cutoff() {
        let s = store();
        let now = Utc::now();
        let mut done = JobRecord {
            id: 1,
            run_id: 1,
            action: JobAction::Completed,
            conclusion: Some("success".into()),
            labels: vec![],
            assigned_runner: None,
            locked_by: None,
            overflow: false,
            entity_id: "e1".into(),
            created_at: now - chrono::Duration::hours(2),
            updated_at: now - chrono::Duration::hours(2),
        };
        s.upsert_job(done.clone()).await.unwrap();
        done.id = 2;
        done.action = JobAction::Queued;
        s.upsert_job(done).await.unwrap();

        let removed = s
            .delete_completed_jobs_before(now - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(s.get_job(1).await.is_err());
        assert!(s.get_job(2).await.is_ok());
    }
}
