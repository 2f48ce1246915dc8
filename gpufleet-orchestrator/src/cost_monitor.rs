//! Cost accrual and spending limits.
//!
//! `track_costs` appends one usage record per running instance per cycle,
//! each window continuing exactly where the previous one ended.
//! `evaluate_limits` folds those records into the configured period and
//! enforces the notify / shutdown thresholds.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use gpufleet_common::{CostLimit, CostPeriod, CostRecord, Instance, InstanceStatus};

use crate::action_log::{log_action_failure, log_action_start, log_action_success};
use crate::locks::InstanceLocks;
use crate::notifier::Notifier;
use crate::provider_manager::ProviderRegistry;
use crate::state_machine::can_transition;
use crate::store::SharedStore;

pub async fn track_costs(store: &SharedStore, registry: &Arc<ProviderRegistry>) {
    let instances = store
        .list_instances_by_status(InstanceStatus::Running)
        .await;

    for instance in instances {
        if let Err(e) = record_usage(store, registry, &instance).await {
            warn!(instance_id = %instance.id, error = %e, "cost tracking failed for instance");
        }
    }
}

async fn record_usage(
    store: &SharedStore,
    registry: &Arc<ProviderRegistry>,
    instance: &Instance,
) -> anyhow::Result<()> {
    let previous = store.cost_records_for(instance.id).await.into_iter().next();

    let unit_price = match current_unit_price(registry, instance).await {
        Some(p) => p,
        None => match previous.as_ref().map(|r| r.unit_price) {
            Some(p) => {
                info!(instance_id = %instance.id, unit_price = p,
                    "price unavailable, reusing last known unit price");
                p
            }
            None => {
                warn!(instance_id = %instance.id, gpu_type = %instance.gpu_type,
                    "no price available and no prior record, skipping cost record");
                return Ok(());
            }
        },
    };

    // Windows tile: each starts where the last ended so no hour is billed
    // twice or dropped.
    let period_start = previous
        .map(|r| r.period_end)
        .unwrap_or(instance.created_at);
    let period_end = Utc::now();
    if period_end <= period_start {
        return Ok(());
    }

    let usage_hours = (period_end - period_start).num_seconds() as f64 / 3600.0;
    let amount = unit_price * usage_hours * instance.gpu_count as f64;

    store
        .insert_cost_record(CostRecord {
            id: Uuid::new_v4(),
            instance_id: instance.id,
            owner_id: instance.owner_id,
            amount,
            usage_hours,
            period_start,
            period_end,
            provider: instance.provider,
            gpu_type: instance.gpu_type.clone(),
            unit_price,
        })
        .await;
    Ok(())
}

async fn current_unit_price(
    registry: &Arc<ProviderRegistry>,
    instance: &Instance,
) -> Option<f64> {
    let adapter = registry
        .get_adapter(instance.provider, instance.api_credential.as_deref())
        .await
        .ok()?;
    adapter.get_price(&instance.gpu_type).await.ok().flatten()
}

/// Inclusive start of the limit's current accounting period, on UTC calendar
/// edges. `Total` runs from instance creation.
pub fn period_start(period: CostPeriod, instance_created_at: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    let midnight = |d: chrono::NaiveDate| Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap());
    match period {
        CostPeriod::Daily => midnight(now.date_naive()),
        CostPeriod::Weekly => {
            let days_back = now.weekday().num_days_from_monday() as i64;
            midnight(now.date_naive() - Duration::days(days_back))
        }
        CostPeriod::Monthly => midnight(now.date_naive().with_day(1).unwrap()),
        CostPeriod::Total => instance_created_at,
    }
}

pub async fn evaluate_limits(
    store: &SharedStore,
    registry: &Arc<ProviderRegistry>,
    locks: &Arc<InstanceLocks>,
    notifier: &Arc<dyn Notifier>,
) {
    for limit in store.list_cost_limits().await {
        let Some(instance) = store.get_instance(limit.instance_id).await else {
            continue;
        };
        if instance.status == InstanceStatus::Deleted {
            continue;
        }
        if let Err(e) = evaluate_one(store, registry, locks, notifier, &limit, &instance).await {
            warn!(instance_id = %instance.id, error = %e, "cost limit evaluation failed");
        }
    }
}

async fn evaluate_one(
    store: &SharedStore,
    registry: &Arc<ProviderRegistry>,
    locks: &Arc<InstanceLocks>,
    notifier: &Arc<dyn Notifier>,
    limit: &CostLimit,
    instance: &Instance,
) -> anyhow::Result<()> {
    let boundary = period_start(limit.period, instance.created_at);

    // A record counts toward the period its window starts in.
    let current_cost: f64 = store
        .cost_records_for(instance.id)
        .await
        .iter()
        .filter(|r| r.period_start >= boundary)
        .map(|r| r.amount)
        .sum();

    store
        .update_cost_limit(instance.id, |l| l.current_cost = current_cost)
        .await?;

    if limit.limit_amount <= 0.0 {
        return Ok(());
    }
    let percent = current_cost / limit.limit_amount * 100.0;

    if current_cost >= limit.limit_amount {
        // Sticky flag: the auto-shutdown fires at most once until an
        // external reset clears it.
        if limit.limit_reached {
            return Ok(());
        }
        shutdown_for_limit(store, registry, locks, instance, current_cost, limit).await?;
        notifier
            .send_notification(
                instance.owner_id,
                "cost_limit_shutdown",
                "Cost limit reached",
                &format!(
                    "Instance {} was stopped: spend {:.2} reached the {:.2} limit",
                    instance.id, current_cost, limit.limit_amount
                ),
            )
            .await?;
    } else if percent >= limit.notify_at_percent {
        // One warning per accounting period.
        if limit.last_notified_at.map_or(false, |t| t >= boundary) {
            return Ok(());
        }
        notifier
            .send_notification(
                instance.owner_id,
                "cost_limit_warning",
                "Approaching cost limit",
                &format!(
                    "Instance {} is at {:.0}% of its {:.2} limit",
                    instance.id, percent, limit.limit_amount
                ),
            )
            .await?;
        store
            .update_cost_limit(instance.id, |l| l.last_notified_at = Some(Utc::now()))
            .await?;
    }
    Ok(())
}

async fn shutdown_for_limit(
    store: &SharedStore,
    registry: &Arc<ProviderRegistry>,
    locks: &Arc<InstanceLocks>,
    instance: &Instance,
    current_cost: f64,
    limit: &CostLimit,
) -> anyhow::Result<()> {
    info!(instance_id = %instance.id, current_cost, limit = limit.limit_amount,
        "cost limit reached, stopping instance");

    let log_id = log_action_start(
        store,
        "cost_limit_shutdown",
        Some(instance.id),
        Some(json!({ "current_cost": current_cost, "limit": limit.limit_amount })),
    )
    .await;

    let lock = locks.lock_for(instance.id).await;
    let _guard = lock.lock().await;

    let result = stop_remote(store, registry, instance).await;
    match &result {
        Ok(()) => log_action_success(store, log_id).await,
        Err(e) => log_action_failure(store, log_id, &e.to_string()).await,
    }
    result?;

    store
        .update_cost_limit(instance.id, |l| {
            l.limit_reached = true;
            l.shutdown_at = Some(Utc::now());
        })
        .await?;
    Ok(())
}

async fn stop_remote(
    store: &SharedStore,
    registry: &Arc<ProviderRegistry>,
    instance: &Instance,
) -> anyhow::Result<()> {
    // Re-read under the lock; another job may already have stopped it.
    let fresh = store
        .get_instance(instance.id)
        .await
        .ok_or(gpufleet_common::DomainError::InstanceNotFound(instance.id))?;
    if fresh.status != InstanceStatus::Running {
        return Ok(());
    }
    let remote_id = fresh
        .remote_id
        .clone()
        .ok_or(gpufleet_common::DomainError::MissingRemoteId(fresh.id))?;

    let adapter = registry
        .get_adapter(fresh.provider, fresh.api_credential.as_deref())
        .await?;
    adapter.stop_instance(&remote_id).await?;

    if can_transition(fresh.status, InstanceStatus::Stopped) {
        store
            .update_instance(fresh.id, |i| i.status = InstanceStatus::Stopped)
            .await?;
    }
    Ok(())
}
