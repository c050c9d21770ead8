mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{FakeForge, FakeForgeFactory, FakeProvider};
use gha_fleet::backoff::SystemClock;
use gha_fleet::controller::{Controller, ControllerDeps};
use gha_fleet::crypto::SecretCipher;
use gha_fleet::params::OrganizationRef;
use gha_fleet::pool::PoolManagerConfig;
use gha_fleet::provider::Provider;
use gha_fleet::store::{MemoryStore, Store};

#[tokio::test]
async fn controller_loads_routes_and_deletes_managers() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new(SecretCipher::new("test-passphrase")));
    let entity = common::test_entity();
    store.create_entity(entity.clone()).await.unwrap();

    let forge = Arc::new(FakeForge::default());
    let provider = Arc::new(FakeProvider::default());
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("fake".to_string(), provider);

    let controller = Controller::spawn(ControllerDeps {
        store,
        providers,
        forge_factory: Arc::new(FakeForgeFactory { forge }),
        manager_config: PoolManagerConfig::default(),
        clock: Arc::new(SystemClock),
    });

    controller.load(entity.clone()).await.unwrap();
    // loading the same entity again is a no-op
    controller.load(entity.clone()).await.unwrap();

    let summaries = controller.list().await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].entity_id, "entity-1");
    assert!(!summaries[0].degraded);

    let manager = controller.get("entity-1").await.unwrap();
    assert_eq!(manager.id().await, "entity-1");

    // webhook routing resolves by forge-side scope
    let job = common::queued_job(1, &["self-hosted"]);
    let routed = controller.find_for_job(&job).await.unwrap();
    assert_eq!(routed.id().await, "entity-1");

    let mut foreign = common::queued_job(2, &["self-hosted"]);
    foreign.organization = Some(OrganizationRef {
        login: "umbrella".to_string(),
    });
    assert!(controller.find_for_job(&foreign).await.is_err());

    controller.delete("entity-1").await.unwrap();
    assert!(controller.get("entity-1").await.is_err());
    assert!(controller.list().await.unwrap().is_empty());

    controller.shutdown().await;
}
