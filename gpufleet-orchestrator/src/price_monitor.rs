//! Market price sampling, alerting, and trend analysis.

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gpufleet_common::rules::{parse_config, PriceAlertConfig};
use gpufleet_common::{Instance, InstanceStatus, PriceRecord, ProviderKind, RuleType};

use crate::action_log::{log_action_start, log_action_success};
use crate::config;
use crate::provider_manager::ProviderRegistry;
use crate::store::SharedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendDirection {
    Up,
    Down,
    Stable,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct PriceTrend {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub current: f64,
    pub direction: TrendDirection,
}

#[derive(Debug, Clone)]
pub struct PriceAlternative {
    pub provider: ProviderKind,
    pub price_per_hour: f64,
    pub savings_per_hour: f64,
}

pub async fn sample_prices(store: &SharedStore, registry: &Arc<ProviderRegistry>) {
    let instances = store
        .list_instances_by_status(InstanceStatus::Running)
        .await;

    for instance in instances {
        if let Err(e) = sample_one(store, registry, &instance).await {
            warn!(instance_id = %instance.id, error = %e, "price sampling failed");
        }
    }
}

async fn sample_one(
    store: &SharedStore,
    registry: &Arc<ProviderRegistry>,
    instance: &Instance,
) -> anyhow::Result<()> {
    let adapter = registry
        .get_adapter(instance.provider, instance.api_credential.as_deref())
        .await?;
    let Some(price) = adapter.get_price(&instance.gpu_type).await? else {
        debug!(instance_id = %instance.id, "price unknown, nothing to record");
        return Ok(());
    };

    let previous = store.latest_price_record(instance.id).await;

    // Append only when the price actually moved; steady prices produce no
    // rows no matter how often we sample.
    let should_record = match &previous {
        None => true,
        Some(prev) if prev.price_per_hour == 0.0 => price != 0.0,
        Some(prev) => {
            let change = (price - prev.price_per_hour).abs() / prev.price_per_hour;
            change >= config::price_change_threshold()
        }
    };

    if should_record {
        info!(instance_id = %instance.id, price, "recording price change");
        store
            .insert_price_record(PriceRecord {
                id: Uuid::new_v4(),
                instance_id: instance.id,
                provider: instance.provider,
                gpu_type: instance.gpu_type.clone(),
                price_per_hour: price,
                recorded_at: Utc::now(),
            })
            .await;
    }

    evaluate_price_alerts(store, instance, price).await;
    Ok(())
}

async fn evaluate_price_alerts(store: &SharedStore, instance: &Instance, price: f64) {
    let rules = store.list_enabled_rules_by_type(RuleType::PriceAlert).await;
    for rule in rules {
        let applies = match rule.instance_id {
            Some(id) => id == instance.id,
            None => rule.owner_id == instance.owner_id,
        };
        if !applies {
            continue;
        }
        let cfg: PriceAlertConfig = parse_config(&rule.config);
        let Some(max_price) = cfg.max_hourly_price else {
            continue;
        };
        if price <= max_price {
            continue;
        }

        info!(instance_id = %instance.id, price, max_price, "price alert triggered");
        let log_id = log_action_start(
            store,
            "price_alert",
            Some(instance.id),
            Some(json!({ "price": price, "max_hourly_price": max_price })),
        )
        .await;
        log_action_success(store, log_id).await;

        let _ = store
            .update_rule(rule.id, |r| {
                r.last_triggered_at = Some(Utc::now());
                r.trigger_count += 1;
            })
            .await;
    }
}

/// Price statistics over the trailing window. Direction compares the average
/// of the older half against the newer half; moves inside ±5% are `Stable`,
/// and too few samples to form both halves is `Unknown`.
pub async fn get_trend(
    store: &SharedStore,
    instance_id: Uuid,
    window_hours: i64,
) -> PriceTrend {
    let since = Utc::now() - Duration::hours(window_hours);
    let records: Vec<_> = store
        .price_records_for(instance_id)
        .await
        .into_iter()
        .filter(|r| r.recorded_at >= since)
        .collect();

    if records.is_empty() {
        return PriceTrend {
            min: 0.0,
            max: 0.0,
            avg: 0.0,
            current: 0.0,
            direction: TrendDirection::Unknown,
        };
    }

    let prices: Vec<f64> = records.iter().map(|r| r.price_per_hour).collect();
    let min = prices.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let avg = prices.iter().sum::<f64>() / prices.len() as f64;
    // Records are most recent first.
    let current = prices[0];

    let midpoint = Utc::now() - Duration::hours(window_hours) / 2;
    let newer: Vec<f64> = records
        .iter()
        .filter(|r| r.recorded_at >= midpoint)
        .map(|r| r.price_per_hour)
        .collect();
    let older: Vec<f64> = records
        .iter()
        .filter(|r| r.recorded_at < midpoint)
        .map(|r| r.price_per_hour)
        .collect();

    let direction = if newer.is_empty() || older.is_empty() {
        TrendDirection::Unknown
    } else {
        let newer_avg = newer.iter().sum::<f64>() / newer.len() as f64;
        let older_avg = older.iter().sum::<f64>() / older.len() as f64;
        if newer_avg > older_avg * 1.05 {
            TrendDirection::Up
        } else if newer_avg < older_avg * 0.95 {
            TrendDirection::Down
        } else {
            TrendDirection::Stable
        }
    };

    PriceTrend {
        min,
        max,
        avg,
        current,
        direction,
    }
}

/// Providers currently cheaper than the instance's, best savings first.
/// Providers with an unknown price are excluded, never treated as free.
pub async fn find_cheaper_alternatives(
    store: &SharedStore,
    registry: &Arc<ProviderRegistry>,
    instance: &Instance,
) -> Vec<PriceAlternative> {
    let current_price = match current_price(store, registry, instance).await {
        Some(p) => p,
        None => return Vec::new(),
    };

    let mut alternatives = Vec::new();
    for kind in [ProviderKind::RunPod, ProviderKind::Vast, ProviderKind::Mock] {
        if kind == instance.provider {
            continue;
        }
        let Ok(adapter) = registry.get_adapter(kind, None).await else {
            continue;
        };
        let price = match adapter.get_price(&instance.gpu_type).await {
            Ok(Some(p)) => p,
            _ => continue,
        };
        if price < current_price {
            alternatives.push(PriceAlternative {
                provider: kind,
                price_per_hour: price,
                savings_per_hour: current_price - price,
            });
        }
    }
    alternatives.sort_by(|a, b| {
        b.savings_per_hour
            .partial_cmp(&a.savings_per_hour)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    alternatives
}

async fn current_price(
    store: &SharedStore,
    registry: &Arc<ProviderRegistry>,
    instance: &Instance,
) -> Option<f64> {
    if let Ok(adapter) = registry
        .get_adapter(instance.provider, instance.api_credential.as_deref())
        .await
    {
        if let Ok(Some(p)) = adapter.get_price(&instance.gpu_type).await {
            return Some(p);
        }
    }
    store
        .latest_price_record(instance.id)
        .await
        .map(|r| r.price_per_hour)
}
