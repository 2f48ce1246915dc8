mod common;

use std::sync::Arc;

use chrono::{Duration, Timelike, Utc};
use serde_json::json;
use uuid::Uuid;

use common::Fleet;
use gpufleet_common::{
    ActionType, AutomationRuleV2, CostRecord, ExecutionStatus, InstanceStatus, PriceRecord,
    ProviderKind, RuleTarget, TriggerType,
};
use gpufleet_orchestrator::rule_engine::RuleEngine;

fn engine(fleet: &Fleet) -> RuleEngine {
    RuleEngine::new(
        fleet.store.clone(),
        fleet.registry.clone(),
        fleet.locks.clone(),
        fleet.notifier_dyn(),
        Arc::new(fleet.migration_manager()),
    )
}

async fn seed_cost_today(fleet: &Fleet, instance_id: Uuid, owner_id: Uuid, amount: f64) {
    let midnight = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc();
    let start = (Utc::now() - Duration::minutes(30)).max(midnight);
    fleet
        .store
        .insert_cost_record(CostRecord {
            id: Uuid::new_v4(),
            instance_id,
            owner_id,
            amount,
            usage_hours: 1.0,
            period_start: start,
            period_end: start + Duration::minutes(30),
            provider: ProviderKind::Mock,
            gpu_type: "RTX 4090".to_string(),
            unit_price: amount,
        })
        .await;
}

#[tokio::test]
async fn cost_threshold_shuts_the_instance_down() {
    let fleet = Fleet::new().await;
    let owner = Uuid::new_v4();
    let instance = fleet.running_instance(owner).await;
    seed_cost_today(&fleet, instance.id, owner, 12.0).await;

    let rule = AutomationRuleV2::new(
        owner,
        "daily budget",
        TriggerType::CostThreshold,
        json!({ "threshold": 10.0, "period": "daily" }),
        ActionType::Shutdown,
        json!({}),
        RuleTarget::Instance(instance.id),
    );
    let rule_id = rule.id;
    fleet.store.insert_rule_v2(rule).await;

    engine(&fleet).run().await;

    assert_eq!(
        fleet.store.get_instance(instance.id).await.unwrap().status,
        InstanceStatus::Stopped
    );
    let logs = fleet.store.rule_logs_for(rule_id).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, ExecutionStatus::Success);
    assert_eq!(logs[0].action, ActionType::Shutdown);
    assert_eq!(logs[0].instance_id, Some(instance.id));

    let rules = fleet.store.list_enabled_rules_v2().await;
    assert_eq!(rules.iter().find(|r| r.id == rule_id).unwrap().trigger_count, 1);
}

#[tokio::test]
async fn notify_action_renders_the_template() {
    let fleet = Fleet::new().await;
    let owner = Uuid::new_v4();
    let instance = fleet.running_instance(owner).await;
    seed_cost_today(&fleet, instance.id, owner, 25.0).await;

    fleet
        .store
        .insert_rule_v2(AutomationRuleV2::new(
            owner,
            "budget warning",
            TriggerType::CostThreshold,
            json!({ "threshold": 20.0, "period": "daily" }),
            ActionType::Notify,
            json!({
                "event_type": "budget",
                "title": "Budget exceeded",
                "message": "spent {cost} against {threshold}"
            }),
            RuleTarget::Owner(owner),
        ))
        .await;

    engine(&fleet).run().await;

    let sent = fleet.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event_type, "budget");
    assert_eq!(sent[0].message, "spent 25.00 against 20.00");
}

#[tokio::test]
async fn time_based_rule_fires_once_per_minute() {
    let fleet = Fleet::new().await;
    let owner = Uuid::new_v4();
    let instance = fleet.running_instance(owner).await;

    let now = Utc::now();
    let rule = AutomationRuleV2::new(
        owner,
        "nightly notify",
        TriggerType::TimeBased,
        json!({ "time": format!("{:02}:{:02}", now.hour(), now.minute()) }),
        ActionType::Notify,
        json!({}),
        RuleTarget::Instance(instance.id),
    );
    let rule_id = rule.id;
    fleet.store.insert_rule_v2(rule).await;

    let engine = engine(&fleet);
    engine.run().await;
    engine.run().await;

    // Unless the clock rolled over between the two runs, one firing.
    if Utc::now().minute() == now.minute() {
        assert_eq!(fleet.store.rule_logs_for(rule_id).await.len(), 1);
    }
}

#[tokio::test]
async fn price_change_trigger_notifies() {
    let fleet = Fleet::new().await;
    let owner = Uuid::new_v4();
    let instance = fleet.running_instance(owner).await;

    for (price, minutes_ago) in [(1.0, 60), (1.2, 5)] {
        fleet
            .store
            .insert_price_record(PriceRecord {
                id: Uuid::new_v4(),
                instance_id: instance.id,
                provider: ProviderKind::Mock,
                gpu_type: instance.gpu_type.clone(),
                price_per_hour: price,
                recorded_at: Utc::now() - Duration::minutes(minutes_ago),
            })
            .await;
    }

    let rule = AutomationRuleV2::new(
        owner,
        "price spike",
        TriggerType::PriceChange,
        json!({ "percent": 10.0, "direction": "up" }),
        ActionType::Notify,
        json!({ "message": "price moved {change}%" }),
        RuleTarget::Instance(instance.id),
    );
    let rule_id = rule.id;
    fleet.store.insert_rule_v2(rule).await;

    engine(&fleet).run().await;

    assert_eq!(fleet.store.rule_logs_for(rule_id).await.len(), 1);
    let sent = fleet.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message, "price moved 20.0%");
}

#[tokio::test]
async fn malformed_trigger_config_never_fires() {
    let fleet = Fleet::new().await;
    let owner = Uuid::new_v4();
    let instance = fleet.running_instance(owner).await;
    seed_cost_today(&fleet, instance.id, owner, 1_000_000.0).await;

    let rule = AutomationRuleV2::new(
        owner,
        "broken rule",
        TriggerType::CostThreshold,
        json!("this is not a config object"),
        ActionType::Shutdown,
        json!({}),
        RuleTarget::Instance(instance.id),
    );
    let rule_id = rule.id;
    fleet.store.insert_rule_v2(rule).await;

    engine(&fleet).run().await;

    assert!(fleet.store.rule_logs_for(rule_id).await.is_empty());
    assert_eq!(
        fleet.store.get_instance(instance.id).await.unwrap().status,
        InstanceStatus::Running
    );
}

#[tokio::test]
async fn failed_action_is_logged_as_failed() {
    let fleet = Fleet::new().await;
    let owner = Uuid::new_v4();
    let instance = fleet.running_instance(owner).await;
    seed_cost_today(&fleet, instance.id, owner, 15.0).await;

    // The remote is gone; the shutdown call will fail.
    fleet.mock.vanish(instance.remote_id.as_deref().unwrap());

    let rule = AutomationRuleV2::new(
        owner,
        "budget stop",
        TriggerType::CostThreshold,
        json!({ "threshold": 10.0, "period": "daily" }),
        ActionType::Shutdown,
        json!({}),
        RuleTarget::Instance(instance.id),
    );
    let rule_id = rule.id;
    fleet.store.insert_rule_v2(rule).await;

    engine(&fleet).run().await;

    let logs = fleet.store.rule_logs_for(rule_id).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, ExecutionStatus::Failed);
    assert!(logs[0].error.is_some());
}
