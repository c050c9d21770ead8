mod memory;

pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::StoreConfig;
use crate::crypto::SecretCipher;
use crate::error::{Error, Result};
use crate::params::{Entity, Instance, JobRecord, Pool};

/// Persistence capability. The store is the only cross-process shared
/// resource; one manager may assume read-your-writes, peers may not.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_entity(&self, entity: Entity) -> Result<Entity>;
    async fn get_entity(&self, id: &str) -> Result<Entity>;
    async fn list_entities(&self) -> Result<Vec<Entity>>;
    async fn update_entity(&self, entity: Entity) -> Result<Entity>;
    async fn delete_entity(&self, id: &str) -> Result<()>;

    async fn create_pool(&self, pool: Pool) -> Result<Pool>;
    async fn get_pool(&self, id: &str) -> Result<Pool>;
    async fn list_entity_pools(&self, entity_id: &str) -> Result<Vec<Pool>>;
    async fn update_pool(&self, pool: Pool) -> Result<Pool>;
    async fn delete_pool(&self, id: &str) -> Result<()>;

    async fn add_instance(&self, instance: Instance) -> Result<Instance>;
    async fn get_instance(&self, name: &str) -> Result<Instance>;
    async fn list_pool_instances(&self, pool_id: &str) -> Result<Vec<Instance>>;
    async fn list_entity_instances(&self, entity_id: &str) -> Result<Vec<Instance>>;
    async fn update_instance(&self, instance: Instance) -> Result<Instance>;
    async fn remove_instance(&self, name: &str) -> Result<()>;

    async fn upsert_job(&self, job: JobRecord) -> Result<JobRecord>;
    async fn get_job(&self, id: i64) -> Result<JobRecord>;
    async fn list_entity_jobs(&self, entity_id: &str) -> Result<Vec<JobRecord>>;
    async fn delete_completed_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

pub fn open(cfg: &StoreConfig, cipher: SecretCipher) -> Result<Arc<dyn Store>> {
    match cfg.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new(cipher))),
        other => Err(Error::fatal(format!("unknown store backend: {other}"))),
    }
}
