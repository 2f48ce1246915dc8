//! Automatic failover to backup providers.

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use gpufleet_common::{FailoverConfig, Instance, InstanceStatus};
use gpufleet_providers::CreateInstanceRequest;

use crate::action_log::{log_action_failure, log_action_start, log_action_success};
use crate::locks::InstanceLocks;
use crate::notifier::Notifier;
use crate::provider_manager::ProviderRegistry;
use crate::store::SharedStore;

pub async fn run(
    store: &SharedStore,
    registry: &Arc<ProviderRegistry>,
    locks: &Arc<InstanceLocks>,
    notifier: &Arc<dyn Notifier>,
) {
    for config in store.list_failover_configs().await {
        if !config.auto_failover_enabled {
            continue;
        }
        let Some(instance) = store.get_instance(config.instance_id).await else {
            continue;
        };
        if instance.status != InstanceStatus::Running {
            continue;
        }
        if !should_fail_over(store, &config).await {
            continue;
        }
        if let Err(e) = fail_over(store, registry, locks, notifier, &config, &instance).await {
            warn!(instance_id = %instance.id, error = %e, "failover attempt errored");
        }
    }
}

/// The primary is considered down when the `failover_threshold` most recent
/// probes, all landing inside the expected probing window, are non-healthy.
/// Fewer records than the threshold is not evidence of failure.
async fn should_fail_over(store: &SharedStore, config: &FailoverConfig) -> bool {
    let window_secs = config.health_check_interval_secs * config.failover_threshold as i64;
    let since = Utc::now() - Duration::seconds(window_secs.max(1));
    let records = store
        .health_records_for(config.instance_id, Some(since))
        .await;

    let needed = config.failover_threshold as usize;
    if records.len() < needed {
        return false;
    }
    records.iter().take(needed).all(|r| !r.status.is_healthy())
}

async fn fail_over(
    store: &SharedStore,
    registry: &Arc<ProviderRegistry>,
    locks: &Arc<InstanceLocks>,
    notifier: &Arc<dyn Notifier>,
    config: &FailoverConfig,
    primary: &Instance,
) -> anyhow::Result<()> {
    info!(instance_id = %primary.id, backups = ?config.backup_providers,
        "primary unhealthy past threshold, starting failover");

    let log_id = log_action_start(
        store,
        "failover",
        Some(primary.id),
        Some(json!({ "primary": primary.provider.as_str() })),
    )
    .await;

    for backup in &config.backup_providers {
        let Ok(adapter) = registry.get_adapter(*backup, None).await else {
            warn!(provider = %backup, "backup provider has no adapter, trying next");
            continue;
        };

        // Reachability probe: a provider that can quote a price for this
        // GPU is assumed able to host it. Weak, but it is the only signal
        // available before committing to a create.
        match adapter.get_price(&primary.gpu_type).await {
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => {
                info!(provider = %backup, "backup provider unreachable or has no capacity");
                continue;
            }
        }

        let mut replacement = Instance::new(
            primary.owner_id,
            *backup,
            &primary.gpu_type,
            primary.gpu_count,
            &primary.image,
        );
        let created = match adapter
            .create_instance(&CreateInstanceRequest {
                instance_id: replacement.id,
                gpu_type: primary.gpu_type.clone(),
                gpu_count: primary.gpu_count,
                image: primary.image.clone(),
                env: vec![],
            })
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(provider = %backup, error = %e, "backup create failed, trying next");
                continue;
            }
        };
        replacement.remote_id = Some(created.remote_id);
        let replacement_id = replacement.id;
        store.insert_instance(replacement).await;

        stop_primary(store, registry, locks, primary).await;

        store
            .update_failover_config(config.instance_id, |c| {
                c.last_failover_at = Some(Utc::now());
                c.failover_count += 1;
            })
            .await?;

        log_action_success(store, log_id).await;
        let _ = notifier
            .send_notification(
                primary.owner_id,
                "failover",
                "Instance failed over",
                &format!(
                    "Instance {} failed over to {} as {}",
                    primary.id, backup, replacement_id
                ),
            )
            .await;
        return Ok(());
    }

    // Every backup was tried; the primary stays as is rather than being
    // stopped with nothing to replace it.
    warn!(instance_id = %primary.id, "all backup providers exhausted, primary left running");
    log_action_failure(store, log_id, "all backup providers exhausted").await;
    Ok(())
}

async fn stop_primary(
    store: &SharedStore,
    registry: &Arc<ProviderRegistry>,
    locks: &Arc<InstanceLocks>,
    primary: &Instance,
) {
    let Some(remote_id) = primary.remote_id.as_deref() else {
        return;
    };
    let lock = locks.lock_for(primary.id).await;
    let _guard = lock.lock().await;

    match registry
        .get_adapter(primary.provider, primary.api_credential.as_deref())
        .await
    {
        Ok(adapter) => {
            if let Err(e) = adapter.stop_instance(remote_id).await {
                warn!(instance_id = %primary.id, error = %e,
                    "stopping failed primary did not succeed");
            }
        }
        Err(e) => warn!(instance_id = %primary.id, error = %e, "no adapter to stop primary"),
    }
    let _ = store
        .update_instance(primary.id, |i| {
            if crate::state_machine::can_transition(i.status, InstanceStatus::Stopped) {
                i.status = InstanceStatus::Stopped;
            }
        })
        .await;
}
