//! Automatic restart of persistently unhealthy instances.

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use gpufleet_common::rules::{parse_config, AutoRestartConfig};
use gpufleet_common::{AutomationRule, Instance, InstanceStatus, RuleType};

use crate::action_log::{log_action_failure, log_action_start, log_action_success};
use crate::locks::InstanceLocks;
use crate::provider_manager::ProviderRegistry;
use crate::store::SharedStore;

pub async fn run(store: &SharedStore, registry: &Arc<ProviderRegistry>, locks: &Arc<InstanceLocks>) {
    let rules = store
        .list_enabled_rules_by_type(RuleType::AutoRestart)
        .await;

    for rule in rules {
        let instances = match rule.instance_id {
            Some(id) => store.get_instance(id).await.into_iter().collect(),
            None => {
                let all = store.list_instances().await;
                all.into_iter()
                    .filter(|i| i.owner_id == rule.owner_id)
                    .collect::<Vec<_>>()
            }
        };

        for instance in instances {
            if instance.status != InstanceStatus::Running {
                continue;
            }
            if let Err(e) = evaluate_instance(store, registry, locks, &rule, &instance).await {
                warn!(rule_id = %rule.id, instance_id = %instance.id, error = %e,
                    "auto-restart evaluation failed");
            }
        }
    }
}

/// Fires when the most recent `min_consecutive_failures` records are all
/// non-healthy, within the trailing window, counting only records newer than
/// the rule's last trigger. The last-trigger bound is the cool-down: a
/// restart never re-fires on the evidence that caused it.
async fn evaluate_instance(
    store: &SharedStore,
    registry: &Arc<ProviderRegistry>,
    locks: &Arc<InstanceLocks>,
    rule: &AutomationRule,
    instance: &Instance,
) -> anyhow::Result<()> {
    let config: AutoRestartConfig = parse_config(&rule.config);

    let window_start = Utc::now() - Duration::seconds(config.unhealthy_window_secs);
    let since = match rule.last_triggered_at {
        Some(t) if t > window_start => t,
        _ => window_start,
    };

    let records = store.health_records_for(instance.id, Some(since)).await;
    let needed = config.min_consecutive_failures as usize;
    if records.len() < needed {
        return Ok(());
    }
    // Most recent first; every one of the last N must be non-healthy.
    if records.iter().take(needed).any(|r| r.status.is_healthy()) {
        return Ok(());
    }

    info!(instance_id = %instance.id, rule_id = %rule.id, failures = needed,
        "consecutive health failures, restarting instance");

    let outcome = restart_instance(store, registry, locks, instance).await;

    // Stats move regardless of the restart outcome so a failing restart
    // still respects the cool-down instead of hammering the provider.
    store
        .update_rule(rule.id, |r| {
            r.last_triggered_at = Some(Utc::now());
            r.trigger_count += 1;
        })
        .await?;

    outcome
}

async fn restart_instance(
    store: &SharedStore,
    registry: &Arc<ProviderRegistry>,
    locks: &Arc<InstanceLocks>,
    instance: &Instance,
) -> anyhow::Result<()> {
    let remote_id = instance
        .remote_id
        .clone()
        .ok_or(gpufleet_common::DomainError::MissingRemoteId(instance.id))?;

    let log_id = log_action_start(
        store,
        "auto_restart",
        Some(instance.id),
        Some(json!({ "provider": instance.provider.as_str() })),
    )
    .await;

    let lock = locks.lock_for(instance.id).await;
    let _guard = lock.lock().await;

    let adapter = registry
        .get_adapter(instance.provider, instance.api_credential.as_deref())
        .await?;
    match adapter.restart_instance(&remote_id).await {
        Ok(true) => {
            log_action_success(store, log_id).await;
            Ok(())
        }
        Ok(false) => {
            log_action_failure(store, log_id, "provider declined restart").await;
            Ok(())
        }
        Err(e) => {
            log_action_failure(store, log_id, &e.to_string()).await;
            Err(e)
        }
    }
}
