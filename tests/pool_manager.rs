mod common;

use std::time::Duration as StdDuration;

use chrono::Duration;

use common::{completed_job, harness, harness_with, in_progress_job, queued_job};
use gha_fleet::params::{InstanceStatus, RunnerStatus};
use gha_fleet::pool::PoolManagerConfig;
use gha_fleet::store::Store;

#[tokio::test]
async fn idle_pool_is_provisioned_to_its_floor() {
    let h = harness(2, 2).await;

    h.cycle().await;

    let instances = h.manager.list_instances().await.unwrap();
    assert_eq!(instances.len(), 2);
    for instance in &instances {
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.runner_status, RunnerStatus::Idle);
        assert!(instance.agent_id.is_some());
        assert!(instance.token_fetched);
    }
    assert_eq!(h.provider.create_calls(), 2);

    // steady state: further cycles must not create more
    h.cycle().await;
    h.cycle().await;
    assert_eq!(h.provider.create_calls(), 2);
    assert!(h.manager.list_instances().await.unwrap().len() <= 2);
}

#[tokio::test]
async fn queued_job_without_headroom_marks_overflow_and_busy_runner_is_replaced() {
    let h = harness(2, 2).await;
    h.cycle().await;
    assert_eq!(h.provider.create_calls(), 2);

    // full pool: the queued job cannot trigger a create
    h.manager
        .handle_workflow_job(&queued_job(1, &["self-hosted", "linux"]))
        .await
        .unwrap();
    assert_eq!(h.provider.create_calls(), 2);
    assert!(h.store.get_job(1).await.unwrap().overflow);

    // the forge assigns the job to one of the idle runners
    let victim = h.manager.list_instances().await.unwrap()[0].name.clone();
    h.manager
        .handle_workflow_job(&in_progress_job(1, &victim))
        .await
        .unwrap();
    let instance = h.store.get_instance(&victim).await.unwrap();
    assert_eq!(instance.runner_status, RunnerStatus::Active);
    assert_eq!(instance.job_id, Some(1));

    // completion retires the instance and the reconciler replaces it
    h.manager
        .handle_workflow_job(&completed_job(1, &victim))
        .await
        .unwrap();
    assert_eq!(
        h.store.get_instance(&victim).await.unwrap().status,
        InstanceStatus::PendingDelete
    );
    h.manager.drain_deletes().await.unwrap();
    assert!(h.store.get_instance(&victim).await.is_err());
    assert!(h.provider.delete_calls().contains(&victim));

    h.cycle().await;
    assert_eq!(h.provider.create_calls(), 3);
    let instances = h.manager.list_instances().await.unwrap();
    assert_eq!(instances.len(), 2);
    assert!(instances.len() <= 2);
}

#[tokio::test]
async fn runner_that_never_registers_is_reaped_and_replaced() {
    let h = harness(1, 1).await;
    h.forge.set_auto_online(false);

    h.cycle().await;
    let instances = h.manager.list_instances().await.unwrap();
    assert_eq!(instances.len(), 1);
    let name = instances[0].name.clone();
    let agent_id = instances[0].agent_id.unwrap();
    // registered but never connected
    assert_eq!(instances[0].runner_status, RunnerStatus::Installing);

    // bootstrap timeout for the pool is 5 minutes
    h.clock.advance(Duration::minutes(6));
    h.manager.sweep_once().await.unwrap();
    let stuck = h.store.get_instance(&name).await.unwrap();
    assert_eq!(stuck.status, InstanceStatus::PendingDelete);
    assert_eq!(stuck.runner_status, RunnerStatus::Failed);

    h.manager.drain_deletes().await.unwrap();
    assert!(h.store.get_instance(&name).await.is_err());
    assert!(h.forge.removed().contains(&agent_id));
    assert!(h.provider.delete_calls().contains(&name));

    h.cycle().await;
    assert_eq!(h.provider.create_calls(), 2);
}

#[tokio::test]
async fn duplicate_completed_events_delete_exactly_once() {
    let h = harness(1, 1).await;
    h.cycle().await;
    let name = h.manager.list_instances().await.unwrap()[0].name.clone();

    h.manager
        .handle_workflow_job(&in_progress_job(7, &name))
        .await
        .unwrap();
    h.manager
        .handle_workflow_job(&completed_job(7, &name))
        .await
        .unwrap();
    h.manager
        .handle_workflow_job(&completed_job(7, &name))
        .await
        .unwrap();

    h.manager.drain_deletes().await.unwrap();
    h.manager.drain_deletes().await.unwrap();

    let deletes: Vec<_> = h
        .provider
        .delete_calls()
        .into_iter()
        .filter(|n| n == &name)
        .collect();
    assert_eq!(deletes.len(), 1);

    // a third delivery after the record is gone is record-only
    h.manager
        .handle_workflow_job(&completed_job(7, &name))
        .await
        .unwrap();
    h.manager.drain_deletes().await.unwrap();
    assert_eq!(
        h.provider
            .delete_calls()
            .into_iter()
            .filter(|n| n == &name)
            .count(),
        1
    );
}

#[tokio::test]
async fn transient_create_failure_retries_with_backoff() {
    let h = harness(1, 1).await;
    h.provider.fail_next_creates(1);

    h.manager.reconcile_once().await.unwrap();
    h.manager.drain_creates().await.unwrap();

    let instances = h.manager.list_instances().await.unwrap();
    assert_eq!(instances.len(), 1);
    let name = instances[0].name.clone();
    assert_eq!(instances[0].status, InstanceStatus::PendingCreate);
    assert_eq!(instances[0].create_attempts, 1);
    assert_eq!(instances[0].status_messages.len(), 1);
    let retry_at = instances[0].next_retry_at.unwrap();

    // attempt 1 backs off 10s scaled by jitter in [0.8, 1.2]
    let delay = retry_at - instances[0].updated_at;
    assert!(delay >= Duration::seconds(8), "{delay}");
    assert!(delay <= Duration::seconds(12), "{delay}");

    // not due yet: another drain must not call the provider
    h.manager.drain_creates().await.unwrap();
    assert_eq!(h.provider.create_calls(), 1);

    h.clock.advance(Duration::seconds(13));
    h.manager.drain_creates().await.unwrap();

    let instance = h.store.get_instance(&name).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Creating);
    assert_eq!(instance.status_messages.len(), 2);
    assert_eq!(h.provider.create_calls(), 2);
    assert_eq!(h.provider.live_instances(), 1);
}

#[tokio::test]
async fn ghost_forge_runner_is_removed_once() {
    let h = harness(0, 1).await;
    h.forge.add_runner(999, "gha-ghost123", "online", false);

    h.manager.observe_once().await.unwrap();
    assert_eq!(h.forge.removed(), vec![999]);

    h.manager.observe_once().await.unwrap();
    assert_eq!(h.forge.removed(), vec![999]);
}

#[tokio::test]
async fn runner_with_foreign_name_is_left_alone() {
    let h = harness(0, 1).await;
    h.forge.add_runner(55, "somebody-elses-runner", "online", false);

    h.manager.observe_once().await.unwrap();
    assert!(h.forge.removed().is_empty());
}

#[tokio::test]
async fn queued_job_with_headroom_provisions_one_instance() {
    let h = harness(0, 2).await;

    h.manager
        .handle_workflow_job(&queued_job(3, &["self-hosted", "linux"]))
        .await
        .unwrap();
    assert_eq!(h.manager.list_instances().await.unwrap().len(), 1);
    assert!(!h.store.get_job(3).await.unwrap().overflow);

    // duplicate queued delivery must not provision a second instance
    h.manager
        .handle_workflow_job(&queued_job(3, &["self-hosted", "linux"]))
        .await
        .unwrap();
    assert_eq!(h.manager.list_instances().await.unwrap().len(), 1);
}

#[tokio::test]
async fn labels_that_match_no_pool_do_nothing() {
    let h = harness(0, 2).await;
    h.manager
        .handle_workflow_job(&queued_job(4, &["windows", "gpu"]))
        .await
        .unwrap();
    assert!(h.manager.list_instances().await.unwrap().is_empty());
}

#[tokio::test]
async fn force_delete_overrides_runner_state() {
    let h = harness(1, 1).await;
    h.cycle().await;
    let name = h.manager.list_instances().await.unwrap()[0].name.clone();

    h.manager.force_delete_runner(&name).await.unwrap();
    assert_eq!(
        h.store.get_instance(&name).await.unwrap().status,
        InstanceStatus::PendingDelete
    );
    h.manager.drain_deletes().await.unwrap();
    assert!(h.store.get_instance(&name).await.is_err());
}

#[tokio::test]
async fn provider_that_loses_an_instance_is_detected() {
    let h = harness(1, 1).await;
    h.cycle().await;
    let name = h.manager.list_instances().await.unwrap()[0].name.clone();

    // the cloud loses the VM behind our back
    h.provider.state.lock().unwrap().instances.clear();
    h.manager.observe_once().await.unwrap();
    assert_eq!(
        h.store.get_instance(&name).await.unwrap().status,
        InstanceStatus::Error
    );

    // the reconciler repairs errored records into the delete path
    h.manager.reconcile_once().await.unwrap();
    assert_eq!(
        h.store.get_instance(&name).await.unwrap().status,
        InstanceStatus::PendingDelete
    );
}

#[tokio::test]
async fn stopped_manager_issues_no_further_calls() {
    let cfg = PoolManagerConfig {
        reconcile_interval: StdDuration::from_millis(20),
        observer_interval: StdDuration::from_millis(20),
        sweeper_interval: StdDuration::from_millis(50),
        drain_interval: StdDuration::from_millis(10),
        shutdown_grace: StdDuration::from_secs(2),
        ..PoolManagerConfig::default()
    };
    let h = harness_with(1, 1, cfg).await;

    h.manager.start().await.unwrap();
    // second start is a no-op
    h.manager.start().await.unwrap();

    tokio::time::sleep(StdDuration::from_millis(300)).await;
    assert_eq!(h.provider.create_calls(), 1);

    h.manager.stop().await.unwrap();
    let creates = h.provider.create_calls();
    let tools = h.forge.state.lock().unwrap().tools_fetches;

    tokio::time::sleep(StdDuration::from_millis(300)).await;
    assert_eq!(h.provider.create_calls(), creates);
    assert_eq!(h.forge.state.lock().unwrap().tools_fetches, tools);
}

#[tokio::test]
async fn jit_refusal_falls_back_to_registration_token() {
    let h = harness(1, 1).await;
    h.forge.state.lock().unwrap().fail_jit = true;

    h.manager.reconcile_once().await.unwrap();
    h.manager.drain_creates().await.unwrap();

    let instances = h.manager.list_instances().await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, InstanceStatus::Creating);
    assert!(instances[0].token_fetched);
    // no jit registration happened, so no agent id yet
    assert!(instances[0].agent_id.is_none());
    assert_eq!(h.forge.state.lock().unwrap().tokens_issued, 1);
}

#[tokio::test]
async fn interrupted_deletes_resume_on_start() {
    let h = harness(0, 2).await;
    // a record left mid-teardown by a previous process
    h.manager
        .handle_workflow_job(&queued_job(9, &["self-hosted", "linux"]))
        .await
        .unwrap();
    h.manager.drain_creates().await.unwrap();
    let name = h.manager.list_instances().await.unwrap()[0].name.clone();
    let mut instance = h.store.get_instance(&name).await.unwrap();
    instance.status = InstanceStatus::Deleting;
    h.store.update_instance(instance).await.unwrap();

    h.manager.start().await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(200)).await;
    assert!(h.store.get_instance(&name).await.is_err());
    h.manager.stop().await.unwrap();
}
