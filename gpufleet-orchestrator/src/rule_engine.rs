//! Generic trigger/action rule engine.
//!
//! Evaluation is a pure function over a gathered snapshot, so every trigger
//! condition is unit-testable without adapters or clocks. Execution performs
//! the action and writes exactly one execution log whose status reflects what
//! the action actually did.

use chrono::{DateTime, Timelike, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use gpufleet_common::rules::{
    parse_config, CostThresholdConfig, HealthCheckFailedConfig, MigrateActionConfig,
    NotifyActionConfig, PriceChangeConfig, TimeBasedConfig,
};
use gpufleet_common::{
    ActionType, AutomationRuleV2, CostPeriod, ExecutionStatus, HealthCheckRecord, Instance,
    InstanceStatus, MigrationStatus, PriceRecord, RuleExecutionLog, RuleTarget, TriggerType,
};

use crate::cost_monitor::period_start;
use crate::locks::InstanceLocks;
use crate::migration::MigrationManager;
use crate::notifier::Notifier;
use crate::provider_manager::ProviderRegistry;
use crate::store::SharedStore;

/// Why a rule fired, plus named values for notification templates.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub reason: String,
    pub values: HashMap<String, String>,
}

/// Snapshot of everything a trigger condition may look at.
pub struct EvalInputs<'a> {
    pub instance: &'a Instance,
    /// Cost accrued in the period named by the rule's trigger config.
    pub period_cost: f64,
    /// Most recent first.
    pub recent_health: &'a [HealthCheckRecord],
    /// Most recent first.
    pub recent_prices: &'a [PriceRecord],
}

/// Pure trigger evaluation. Malformed or incomplete configs make the rule
/// not match; they never produce an error.
pub fn evaluate(
    rule: &AutomationRuleV2,
    inputs: &EvalInputs<'_>,
    now: DateTime<Utc>,
) -> Option<TriggerContext> {
    match rule.trigger {
        TriggerType::CostThreshold => {
            let cfg: CostThresholdConfig = parse_config(&rule.trigger_config);
            let threshold = cfg.threshold?;
            if inputs.period_cost < threshold {
                return None;
            }
            let mut values = HashMap::new();
            values.insert("cost".to_string(), format!("{:.2}", inputs.period_cost));
            values.insert("threshold".to_string(), format!("{:.2}", threshold));
            Some(TriggerContext {
                reason: format!(
                    "period cost {:.2} reached threshold {:.2}",
                    inputs.period_cost, threshold
                ),
                values,
            })
        }
        TriggerType::HealthCheckFailed => {
            let cfg: HealthCheckFailedConfig = parse_config(&rule.trigger_config);
            let window_start = now - chrono::Duration::seconds(cfg.window_secs);
            // Records older than the last firing never count again.
            let since = match rule.last_triggered_at {
                Some(t) if t > window_start => t,
                _ => window_start,
            };
            let needed = cfg.consecutive_failures as usize;
            let recent: Vec<_> = inputs
                .recent_health
                .iter()
                .filter(|r| r.checked_at >= since)
                .take(needed)
                .collect();
            if recent.len() < needed || recent.iter().any(|r| r.status.is_healthy()) {
                return None;
            }
            let mut values = HashMap::new();
            values.insert("failures".to_string(), needed.to_string());
            Some(TriggerContext {
                reason: format!("{} consecutive health check failures", needed),
                values,
            })
        }
        TriggerType::TimeBased => {
            let cfg: TimeBasedConfig = parse_config(&rule.trigger_config);
            let time = cfg.time?;
            let (h, m) = parse_hhmm(&time)?;
            if now.hour() != h || now.minute() != m {
                return None;
            }
            // Minute-resolution guard: within the matching minute the rule
            // fires at most once.
            if let Some(last) = rule.last_triggered_at {
                if last.date_naive() == now.date_naive()
                    && last.hour() == now.hour()
                    && last.minute() == now.minute()
                {
                    return None;
                }
            }
            let mut values = HashMap::new();
            values.insert("time".to_string(), time.clone());
            Some(TriggerContext {
                reason: format!("scheduled time {} reached", time),
                values,
            })
        }
        TriggerType::PriceChange => {
            let cfg: PriceChangeConfig = parse_config(&rule.trigger_config);
            let percent = cfg.percent?;
            let (newer, older) = match inputs.recent_prices {
                [a, b, ..] => (a, b),
                _ => return None,
            };
            if older.price_per_hour == 0.0 {
                return None;
            }
            let change =
                (newer.price_per_hour - older.price_per_hour) / older.price_per_hour * 100.0;
            if change.abs() < percent {
                return None;
            }
            match cfg.direction.as_deref() {
                Some("up") if change <= 0.0 => return None,
                Some("down") if change >= 0.0 => return None,
                _ => {}
            }
            let mut values = HashMap::new();
            values.insert("change".to_string(), format!("{:.1}", change));
            values.insert("price".to_string(), format!("{:.4}", newer.price_per_hour));
            Some(TriggerContext {
                reason: format!("price moved {:.1}% between samples", change),
                values,
            })
        }
    }
}

fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some((h, m))
}

/// Fills `{name}` placeholders from the trigger context; `{reason}` is
/// always available.
fn render_template(template: &str, ctx: &TriggerContext) -> String {
    let mut out = template.replace("{reason}", &ctx.reason);
    for (key, value) in &ctx.values {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

pub struct RuleEngine {
    store: SharedStore,
    registry: Arc<ProviderRegistry>,
    locks: Arc<InstanceLocks>,
    notifier: Arc<dyn Notifier>,
    migration: Arc<MigrationManager>,
}

impl RuleEngine {
    pub fn new(
        store: SharedStore,
        registry: Arc<ProviderRegistry>,
        locks: Arc<InstanceLocks>,
        notifier: Arc<dyn Notifier>,
        migration: Arc<MigrationManager>,
    ) -> Self {
        Self {
            store,
            registry,
            locks,
            notifier,
            migration,
        }
    }

    pub async fn run(&self) {
        let now = Utc::now();
        for rule in self.store.list_enabled_rules_v2().await {
            let instances = match rule.target {
                RuleTarget::Instance(id) => self.store.get_instance(id).await.into_iter().collect(),
                RuleTarget::Owner(owner_id) => {
                    let all = self.store.list_instances().await;
                    all.into_iter()
                        .filter(|i| i.owner_id == owner_id && !i.status.is_terminal())
                        .collect::<Vec<_>>()
                }
            };

            for instance in instances {
                if let Err(e) = self.evaluate_and_execute(&rule, &instance, now).await {
                    warn!(rule_id = %rule.id, instance_id = %instance.id, error = %e,
                        "rule evaluation failed");
                }
            }
        }
    }

    async fn evaluate_and_execute(
        &self,
        rule: &AutomationRuleV2,
        instance: &Instance,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let inputs = self.gather_inputs(rule, instance).await;
        let Some(ctx) = evaluate(
            rule,
            &EvalInputs {
                instance,
                period_cost: inputs.period_cost,
                recent_health: &inputs.health,
                recent_prices: &inputs.prices,
            },
            now,
        ) else {
            return Ok(());
        };

        info!(rule_id = %rule.id, rule_name = %rule.name, instance_id = %instance.id,
            reason = %ctx.reason, "rule triggered");

        let result = self.execute_action(rule, instance, &ctx).await;
        let (status, error) = match &result {
            Ok(()) => (ExecutionStatus::Success, None),
            Err(e) => (ExecutionStatus::Failed, Some(e.to_string())),
        };

        self.store
            .insert_rule_execution_log(RuleExecutionLog {
                id: Uuid::new_v4(),
                rule_id: rule.id,
                instance_id: Some(instance.id),
                trigger_reason: ctx.reason.clone(),
                action: rule.action,
                status,
                error,
                executed_at: now,
            })
            .await;

        self.store
            .update_rule_v2(rule.id, |r| {
                r.last_triggered_at = Some(now);
                r.trigger_count += 1;
            })
            .await?;
        Ok(())
    }

    async fn gather_inputs(&self, rule: &AutomationRuleV2, instance: &Instance) -> GatheredInputs {
        let mut inputs = GatheredInputs::default();
        match rule.trigger {
            TriggerType::CostThreshold => {
                let cfg: CostThresholdConfig = parse_config(&rule.trigger_config);
                let boundary =
                    period_start(cfg.period.unwrap_or(CostPeriod::Total), instance.created_at);
                inputs.period_cost = self
                    .store
                    .cost_records_for(instance.id)
                    .await
                    .iter()
                    .filter(|r| r.period_start >= boundary)
                    .map(|r| r.amount)
                    .sum();
            }
            TriggerType::HealthCheckFailed => {
                inputs.health = self.store.health_records_for(instance.id, None).await;
            }
            TriggerType::PriceChange => {
                inputs.prices = self.store.price_records_for(instance.id).await;
            }
            TriggerType::TimeBased => {}
        }
        inputs
    }

    async fn execute_action(
        &self,
        rule: &AutomationRuleV2,
        instance: &Instance,
        ctx: &TriggerContext,
    ) -> anyhow::Result<()> {
        match rule.action {
            ActionType::Shutdown => self.shutdown(instance).await,
            ActionType::Restart => self.restart(instance).await,
            ActionType::Migrate => {
                let cfg: MigrateActionConfig = parse_config(&rule.action_config);
                let target = cfg
                    .target_provider
                    .ok_or_else(|| anyhow::anyhow!("migrate action has no target_provider"))?;
                let task = self
                    .migration
                    .migrate(instance.id, target, rule.action_config.clone())
                    .await?;
                if task.status != MigrationStatus::Completed {
                    anyhow::bail!(
                        "migration ended {:?}: {}",
                        task.status,
                        task.error_message.as_deref().unwrap_or("unknown error")
                    );
                }
                Ok(())
            }
            ActionType::Notify => {
                let cfg: NotifyActionConfig = parse_config(&rule.action_config);
                self.notifier
                    .send_notification(
                        rule.owner_id,
                        &cfg.event_type,
                        &cfg.title,
                        &render_template(&cfg.message, ctx),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn shutdown(&self, instance: &Instance) -> anyhow::Result<()> {
        let remote_id = instance
            .remote_id
            .clone()
            .ok_or(gpufleet_common::DomainError::MissingRemoteId(instance.id))?;
        let lock = self.locks.lock_for(instance.id).await;
        let _guard = lock.lock().await;

        let fresh = self
            .store
            .get_instance(instance.id)
            .await
            .ok_or(gpufleet_common::DomainError::InstanceNotFound(instance.id))?;
        if fresh.status != InstanceStatus::Running {
            return Ok(());
        }
        let adapter = self
            .registry
            .get_adapter(fresh.provider, fresh.api_credential.as_deref())
            .await?;
        adapter.stop_instance(&remote_id).await?;
        self.store
            .update_instance(fresh.id, |i| i.status = InstanceStatus::Stopped)
            .await?;
        Ok(())
    }

    async fn restart(&self, instance: &Instance) -> anyhow::Result<()> {
        let remote_id = instance
            .remote_id
            .clone()
            .ok_or(gpufleet_common::DomainError::MissingRemoteId(instance.id))?;
        let lock = self.locks.lock_for(instance.id).await;
        let _guard = lock.lock().await;

        let adapter = self
            .registry
            .get_adapter(instance.provider, instance.api_credential.as_deref())
            .await?;
        adapter.restart_instance(&remote_id).await?;
        Ok(())
    }
}

#[derive(Default)]
struct GatheredInputs {
    period_cost: f64,
    health: Vec<HealthCheckRecord>,
    prices: Vec<PriceRecord>,
}
