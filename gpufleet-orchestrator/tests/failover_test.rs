mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use common::{Fleet, KindMock};
use gpufleet_common::{
    FailoverConfig, HealthCheckRecord, HealthStatus, InstanceStatus, ProviderKind,
};
use gpufleet_orchestrator::failover;

async fn record_health(fleet: &Fleet, instance_id: Uuid, status: HealthStatus, seconds_ago: i64) {
    fleet
        .store
        .insert_health_record(HealthCheckRecord {
            id: Uuid::new_v4(),
            instance_id,
            status,
            response_time_ms: None,
            endpoint: "http://10.0.0.1:8000".to_string(),
            detail: None,
            checked_at: Utc::now() - Duration::seconds(seconds_ago),
        })
        .await;
}

async fn seed_failures(fleet: &Fleet, instance_id: Uuid, count: usize) {
    for n in 0..count {
        record_health(fleet, instance_id, HealthStatus::Timeout, (n as i64) * 10).await;
    }
}

#[tokio::test]
async fn fails_over_to_first_reachable_backup() {
    let fleet = Fleet::new().await;
    let vast = Arc::new(KindMock::new(ProviderKind::Vast));
    fleet.registry.register_adapter(vast.clone()).await;

    let owner = Uuid::new_v4();
    let primary = fleet.running_instance(owner).await;
    fleet
        .store
        .upsert_failover_config(FailoverConfig::new(
            primary.id,
            ProviderKind::Mock,
            vec![ProviderKind::Vast],
        ))
        .await;
    seed_failures(&fleet, primary.id, 3).await;

    failover::run(&fleet.store, &fleet.registry, &fleet.locks, &fleet.notifier_dyn()).await;

    // Primary was stopped, a replacement exists on the backup provider.
    assert_eq!(
        fleet.store.get_instance(primary.id).await.unwrap().status,
        InstanceStatus::Stopped
    );
    assert_eq!(
        fleet
            .mock
            .op_counts(primary.remote_id.as_deref().unwrap())
            .stops,
        1
    );
    let replacement = fleet
        .store
        .list_instances()
        .await
        .into_iter()
        .find(|i| i.provider == ProviderKind::Vast)
        .expect("replacement instance");
    assert_eq!(replacement.owner_id, owner);
    assert_eq!(replacement.gpu_type, primary.gpu_type);
    assert!(replacement.remote_id.is_some());

    let config = fleet
        .store
        .list_failover_configs()
        .await
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(config.failover_count, 1);
    assert!(config.last_failover_at.is_some());
    assert_eq!(fleet.notifier.count_of("failover"), 1);
}

#[tokio::test]
async fn too_few_failures_is_not_an_outage() {
    let fleet = Fleet::new().await;
    let vast = Arc::new(KindMock::new(ProviderKind::Vast));
    fleet.registry.register_adapter(vast).await;

    let primary = fleet.running_instance(Uuid::new_v4()).await;
    fleet
        .store
        .upsert_failover_config(FailoverConfig::new(
            primary.id,
            ProviderKind::Mock,
            vec![ProviderKind::Vast],
        ))
        .await;
    seed_failures(&fleet, primary.id, 2).await;

    failover::run(&fleet.store, &fleet.registry, &fleet.locks, &fleet.notifier_dyn()).await;

    assert_eq!(
        fleet.store.get_instance(primary.id).await.unwrap().status,
        InstanceStatus::Running
    );
    assert_eq!(fleet.notifier.count_of("failover"), 0);
}

#[tokio::test]
async fn recent_healthy_probe_blocks_failover() {
    let fleet = Fleet::new().await;
    let vast = Arc::new(KindMock::new(ProviderKind::Vast));
    fleet.registry.register_adapter(vast).await;

    let primary = fleet.running_instance(Uuid::new_v4()).await;
    fleet
        .store
        .upsert_failover_config(FailoverConfig::new(
            primary.id,
            ProviderKind::Mock,
            vec![ProviderKind::Vast],
        ))
        .await;
    record_health(&fleet, primary.id, HealthStatus::Healthy, 5).await;
    record_health(&fleet, primary.id, HealthStatus::Timeout, 15).await;
    record_health(&fleet, primary.id, HealthStatus::Timeout, 25).await;
    record_health(&fleet, primary.id, HealthStatus::Timeout, 35).await;

    failover::run(&fleet.store, &fleet.registry, &fleet.locks, &fleet.notifier_dyn()).await;

    assert_eq!(
        fleet.store.get_instance(primary.id).await.unwrap().status,
        InstanceStatus::Running
    );
}

#[tokio::test]
async fn unreachable_backup_is_skipped_in_order() {
    let fleet = Fleet::new().await;
    let vast = Arc::new(KindMock::new(ProviderKind::Vast));
    vast.inner.set_unreachable(true);
    fleet.registry.register_adapter(vast.clone()).await;
    let runpod = Arc::new(KindMock::new(ProviderKind::RunPod));
    fleet.registry.register_adapter(runpod.clone()).await;

    let primary = fleet.running_instance(Uuid::new_v4()).await;
    fleet
        .store
        .upsert_failover_config(FailoverConfig::new(
            primary.id,
            ProviderKind::Mock,
            vec![ProviderKind::Vast, ProviderKind::RunPod],
        ))
        .await;
    seed_failures(&fleet, primary.id, 3).await;

    failover::run(&fleet.store, &fleet.registry, &fleet.locks, &fleet.notifier_dyn()).await;

    // First backup could not even quote a price; the second one got the
    // replacement.
    let replacement = fleet
        .store
        .list_instances()
        .await
        .into_iter()
        .find(|i| i.id != primary.id)
        .unwrap();
    assert_eq!(replacement.provider, ProviderKind::RunPod);
}

#[tokio::test]
async fn exhausted_backups_leave_primary_running() {
    let fleet = Fleet::new().await;
    let vast = Arc::new(KindMock::new(ProviderKind::Vast));
    vast.inner.set_unreachable(true);
    fleet.registry.register_adapter(vast).await;

    let primary = fleet.running_instance(Uuid::new_v4()).await;
    fleet
        .store
        .upsert_failover_config(FailoverConfig::new(
            primary.id,
            ProviderKind::Mock,
            vec![ProviderKind::Vast],
        ))
        .await;
    seed_failures(&fleet, primary.id, 3).await;

    failover::run(&fleet.store, &fleet.registry, &fleet.locks, &fleet.notifier_dyn()).await;

    // Stopping the primary with nothing to replace it would only make the
    // outage worse.
    assert_eq!(
        fleet.store.get_instance(primary.id).await.unwrap().status,
        InstanceStatus::Running
    );
    assert_eq!(
        fleet
            .mock
            .op_counts(primary.remote_id.as_deref().unwrap())
            .stops,
        0
    );
    let logs = fleet.store.action_logs_by_type("failover").await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, "failed");
    assert_eq!(fleet.notifier.count_of("failover"), 0);
}

#[tokio::test]
async fn disabled_config_never_fails_over() {
    let fleet = Fleet::new().await;
    let vast = Arc::new(KindMock::new(ProviderKind::Vast));
    fleet.registry.register_adapter(vast).await;

    let primary = fleet.running_instance(Uuid::new_v4()).await;
    let mut config = FailoverConfig::new(primary.id, ProviderKind::Mock, vec![ProviderKind::Vast]);
    config.auto_failover_enabled = false;
    fleet.store.upsert_failover_config(config).await;
    seed_failures(&fleet, primary.id, 3).await;

    failover::run(&fleet.store, &fleet.registry, &fleet.locks, &fleet.notifier_dyn()).await;

    assert_eq!(
        fleet.store.get_instance(primary.id).await.unwrap().status,
        InstanceStatus::Running
    );
}
