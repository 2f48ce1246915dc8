//! Reconciliation: converge local records toward provider-reported truth.
//!
//! Works on Creating/Running instances that hold a remote id. Status changes
//! go through the state machine guard; telemetry merges field-by-field. A
//! provider error skips the instance and leaves the record untouched for the
//! next cycle.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use gpufleet_common::{Instance, InstanceStatus};

use crate::config;
use crate::provider_manager::ProviderRegistry;
use crate::state_machine::merge_remote_status;
use crate::store::SharedStore;

pub async fn reconcile_instances(store: &SharedStore, registry: &Arc<ProviderRegistry>) {
    let instances = store.list_instances().await;
    for instance in instances {
        match instance.status {
            InstanceStatus::Creating | InstanceStatus::Running => {
                reconcile_one(store, registry, &instance).await;
            }
            InstanceStatus::Deleted => {
                retry_stuck_delete(store, registry, &instance).await;
            }
            _ => {}
        }
    }
}

async fn reconcile_one(store: &SharedStore, registry: &Arc<ProviderRegistry>, instance: &Instance) {
    let Some(remote_id) = instance.remote_id.as_deref() else {
        return;
    };

    let adapter = match registry
        .get_adapter(instance.provider, instance.api_credential.as_deref())
        .await
    {
        Ok(a) => a,
        Err(e) => {
            warn!(instance_id = %instance.id, provider = %instance.provider, error = %e,
                "no adapter for instance, skipping reconciliation");
            return;
        }
    };

    let remote = match adapter.get_status(remote_id).await {
        Ok(r) => r,
        Err(e) => {
            warn!(instance_id = %instance.id, remote_id, error = %e,
                "provider status lookup failed, keeping local record");
            return;
        }
    };

    let mut probe = instance.clone();
    if !merge_remote_status(&mut probe, &remote) {
        return;
    }

    let result = store
        .update_instance(instance.id, |i| {
            // Re-merge inside the write lock; another job may have moved the
            // record since we read it.
            merge_remote_status(i, &remote);
        })
        .await;
    match result {
        Ok(updated) => {
            if updated.status != instance.status {
                info!(instance_id = %instance.id, from = ?instance.status, to = ?updated.status,
                    "instance status reconciled");
            } else {
                debug!(instance_id = %instance.id, "instance telemetry reconciled");
            }
        }
        Err(e) => warn!(instance_id = %instance.id, error = %e, "reconcile update failed"),
    }
}

/// A locally deleted instance whose remote half still exists gets its delete
/// re-issued. Once the remote is confirmed gone the remote id is cleared so
/// the record drops out of future sweeps.
async fn retry_stuck_delete(
    store: &SharedStore,
    registry: &Arc<ProviderRegistry>,
    instance: &Instance,
) {
    let Some(remote_id) = instance.remote_id.as_deref() else {
        return;
    };

    let adapter = match registry
        .get_adapter(instance.provider, instance.api_credential.as_deref())
        .await
    {
        Ok(a) => a,
        Err(_) => return,
    };

    match adapter.get_status(remote_id).await {
        Ok(remote) if remote.status == InstanceStatus::Deleted => {
            let _ = store
                .update_instance(instance.id, |i| {
                    i.remote_id = None;
                })
                .await;
        }
        Ok(_) => {
            info!(instance_id = %instance.id, remote_id, "retrying delete of lingering remote instance");
            if let Err(e) = adapter.delete_instance(remote_id).await {
                warn!(instance_id = %instance.id, error = %e, "delete retry failed");
            }
        }
        Err(e) => {
            debug!(instance_id = %instance.id, error = %e, "delete-retry status probe failed");
        }
    }
}

/// Hourly sweep: anything stuck in `Creating` past the age ceiling is marked
/// failed so it stops being reconciled and billed as pending capacity.
pub async fn sweep_stale_instances(store: &SharedStore) {
    let max_age = Duration::hours(config::stale_creating_max_age_hours());
    let cutoff = Utc::now() - max_age;

    for instance in store.list_instances_by_status(InstanceStatus::Creating).await {
        if instance.created_at < cutoff {
            warn!(instance_id = %instance.id, created_at = %instance.created_at,
                "instance stuck in creating, marking as error");
            let _ = store
                .update_instance(instance.id, |i| {
                    i.status = InstanceStatus::Error;
                    i.error_message =
                        Some("provisioning did not complete within the allowed window".to_string());
                })
                .await;
        }
    }
}
