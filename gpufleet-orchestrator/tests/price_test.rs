mod common;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use common::Fleet;
use gpufleet_common::{AutomationRule, PriceRecord, ProviderKind, RuleType};
use gpufleet_orchestrator::price_monitor::{
    find_cheaper_alternatives, get_trend, sample_prices, TrendDirection,
};

async fn seed_price(fleet: &Fleet, instance_id: Uuid, price: f64, minutes_ago: i64) {
    fleet
        .store
        .insert_price_record(PriceRecord {
            id: Uuid::new_v4(),
            instance_id,
            provider: ProviderKind::Mock,
            gpu_type: "RTX 4090".to_string(),
            price_per_hour: price,
            recorded_at: Utc::now() - Duration::minutes(minutes_ago),
        })
        .await;
}

#[tokio::test]
async fn records_only_moves_past_the_threshold() {
    let fleet = Fleet::new().await;
    let instance = fleet.running_instance(Uuid::new_v4()).await;

    // First observation always lands.
    sample_prices(&fleet.store, &fleet.registry).await;
    assert_eq!(fleet.store.price_records_for(instance.id).await.len(), 1);

    // Unchanged price: no new row.
    sample_prices(&fleet.store, &fleet.registry).await;
    assert_eq!(fleet.store.price_records_for(instance.id).await.len(), 1);

    // 4% move stays under the 5% threshold.
    fleet.mock.set_price("RTX 4090", Some(0.44 * 1.04));
    sample_prices(&fleet.store, &fleet.registry).await;
    assert_eq!(fleet.store.price_records_for(instance.id).await.len(), 1);

    // 10% move is recorded.
    fleet.mock.set_price("RTX 4090", Some(0.44 * 1.10));
    sample_prices(&fleet.store, &fleet.registry).await;
    let records = fleet.store.price_records_for(instance.id).await;
    assert_eq!(records.len(), 2);
    assert!((records[0].price_per_hour - 0.44 * 1.10).abs() < 1e-9);
}

#[tokio::test]
async fn price_alert_fires_above_the_ceiling() {
    let fleet = Fleet::new().await;
    let owner = Uuid::new_v4();
    let instance = fleet.running_instance(owner).await;

    let rule = AutomationRule::new(
        owner,
        Some(instance.id),
        RuleType::PriceAlert,
        json!({ "max_hourly_price": 0.50 }),
    );
    let rule_id = rule.id;
    fleet.store.insert_rule(rule).await;

    // 0.44 is under the ceiling: quiet.
    sample_prices(&fleet.store, &fleet.registry).await;
    assert!(fleet.store.action_logs_by_type("price_alert").await.is_empty());

    fleet.mock.set_price("RTX 4090", Some(0.75));
    sample_prices(&fleet.store, &fleet.registry).await;

    let alerts = fleet.store.action_logs_by_type("price_alert").await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].instance_id, Some(instance.id));

    let rules = fleet.store.list_enabled_rules_by_type(RuleType::PriceAlert).await;
    let rule = rules.iter().find(|r| r.id == rule_id).unwrap();
    assert_eq!(rule.trigger_count, 1);
}

#[tokio::test]
async fn trend_reports_direction_from_half_windows() {
    let fleet = Fleet::new().await;
    let instance_id = Uuid::new_v4();

    // Older half around 1.00, newer half around 1.30: trending up.
    seed_price(&fleet, instance_id, 1.00, 50).await;
    seed_price(&fleet, instance_id, 1.02, 45).await;
    seed_price(&fleet, instance_id, 1.28, 10).await;
    seed_price(&fleet, instance_id, 1.32, 5).await;

    let trend = get_trend(&fleet.store, instance_id, 1).await;
    assert_eq!(trend.direction, TrendDirection::Up);
    assert!((trend.min - 1.00).abs() < 1e-9);
    assert!((trend.max - 1.32).abs() < 1e-9);
    assert!((trend.current - 1.32).abs() < 1e-9);
}

#[tokio::test]
async fn trend_within_five_percent_is_stable() {
    let fleet = Fleet::new().await;
    let instance_id = Uuid::new_v4();

    seed_price(&fleet, instance_id, 1.00, 50).await;
    seed_price(&fleet, instance_id, 1.02, 5).await;

    let trend = get_trend(&fleet.store, instance_id, 1).await;
    assert_eq!(trend.direction, TrendDirection::Stable);
}

#[tokio::test]
async fn trend_without_samples_is_unknown() {
    let fleet = Fleet::new().await;
    let trend = get_trend(&fleet.store, Uuid::new_v4(), 24).await;
    assert_eq!(trend.direction, TrendDirection::Unknown);
    assert_eq!(trend.current, 0.0);
}

#[tokio::test]
async fn cheaper_alternatives_are_strictly_cheaper() {
    let fleet = Fleet::new().await;
    let owner = Uuid::new_v4();

    // Instance notionally on RunPod (no adapter in tests); its current price
    // comes from the latest recorded sample.
    let mut instance = fleet.running_instance(owner).await;
    instance = fleet
        .store
        .update_instance(instance.id, |i| i.provider = ProviderKind::RunPod)
        .await
        .unwrap();
    seed_price(&fleet, instance.id, 1.00, 5).await;

    let alternatives = find_cheaper_alternatives(&fleet.store, &fleet.registry, &instance).await;
    assert_eq!(alternatives.len(), 1);
    assert_eq!(alternatives[0].provider, ProviderKind::Mock);
    assert!((alternatives[0].price_per_hour - 0.44).abs() < 1e-9);
    assert!((alternatives[0].savings_per_hour - 0.56).abs() < 1e-9);

    // A dearer provider is not an alternative.
    fleet.mock.set_price("RTX 4090", Some(2.00));
    let alternatives = find_cheaper_alternatives(&fleet.store, &fleet.registry, &instance).await;
    assert!(alternatives.is_empty());

    // Unknown prices are excluded, never treated as free.
    fleet.mock.set_unreachable(true);
    let alternatives = find_cheaper_alternatives(&fleet.store, &fleet.registry, &instance).await;
    assert!(alternatives.is_empty());
}
