//! In-memory record store.
//!
//! One keyed collection per entity, guarded by its own `RwLock`. Writers go
//! through closure-based field merges so concurrent jobs doing
//! read-modify-write on the same record degrade to last-write-wins per field
//! instead of clobbering whole rows.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use gpufleet_common::{
    ActionLogEntry, AutomationRule, AutomationRuleV2, CostLimit, CostRecord, DomainError,
    FailoverConfig, HealthCheckRecord, Instance, InstanceStatus, MigrationTask, PriceRecord,
    ProviderConfig, ProviderKind, RuleExecutionLog, RuleType,
};

#[derive(Default)]
pub struct Store {
    instances: RwLock<HashMap<Uuid, Instance>>,
    provider_configs: RwLock<HashMap<ProviderKind, ProviderConfig>>,
    health_records: RwLock<Vec<HealthCheckRecord>>,
    rules: RwLock<HashMap<Uuid, AutomationRule>>,
    rules_v2: RwLock<HashMap<Uuid, AutomationRuleV2>>,
    rule_logs: RwLock<Vec<RuleExecutionLog>>,
    cost_records: RwLock<Vec<CostRecord>>,
    cost_limits: RwLock<HashMap<Uuid, CostLimit>>,
    price_records: RwLock<Vec<PriceRecord>>,
    migrations: RwLock<HashMap<Uuid, MigrationTask>>,
    failover_configs: RwLock<HashMap<Uuid, FailoverConfig>>,
    action_logs: RwLock<Vec<ActionLogEntry>>,
}

pub type SharedStore = Arc<Store>;

impl Store {
    pub fn new() -> SharedStore {
        Arc::new(Self::default())
    }

    // --- Instances ---

    pub async fn insert_instance(&self, instance: Instance) {
        self.instances.write().await.insert(instance.id, instance);
    }

    pub async fn get_instance(&self, id: Uuid) -> Option<Instance> {
        self.instances.read().await.get(&id).cloned()
    }

    pub async fn list_instances(&self) -> Vec<Instance> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn list_instances_by_status(&self, status: InstanceStatus) -> Vec<Instance> {
        self.instances
            .read()
            .await
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect()
    }

    /// Field-level merge; bumps `updated_at`.
    pub async fn update_instance<F>(&self, id: Uuid, f: F) -> Result<Instance, DomainError>
    where
        F: FnOnce(&mut Instance),
    {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&id)
            .ok_or(DomainError::InstanceNotFound(id))?;
        f(instance);
        instance.updated_at = Utc::now();
        Ok(instance.clone())
    }

    /// Local soft delete. The only path that sets `Deleted`.
    pub async fn soft_delete_instance(&self, id: Uuid) -> Result<Instance, DomainError> {
        self.update_instance(id, |i| {
            i.status = InstanceStatus::Deleted;
            i.deleted_at = Some(Utc::now());
        })
        .await
    }

    // --- Provider configs ---

    pub async fn upsert_provider_config(&self, config: ProviderConfig) {
        self.provider_configs
            .write()
            .await
            .insert(config.provider, config);
    }

    pub async fn list_provider_configs(&self) -> Vec<ProviderConfig> {
        self.provider_configs
            .read()
            .await
            .values()
            .cloned()
            .collect()
    }

    pub async fn get_provider_config(&self, kind: ProviderKind) -> Option<ProviderConfig> {
        self.provider_configs.read().await.get(&kind).cloned()
    }

    // --- Health check records ---

    pub async fn insert_health_record(&self, record: HealthCheckRecord) {
        self.health_records.write().await.push(record);
    }

    /// Records for one instance, most recent first, optionally bounded to a
    /// trailing window.
    pub async fn health_records_for(
        &self,
        instance_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Vec<HealthCheckRecord> {
        let mut records: Vec<_> = self
            .health_records
            .read()
            .await
            .iter()
            .filter(|r| r.instance_id == instance_id)
            .filter(|r| since.map_or(true, |s| r.checked_at >= s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.checked_at.cmp(&a.checked_at));
        records
    }

    // --- Automation rules (simple) ---

    pub async fn insert_rule(&self, rule: AutomationRule) {
        self.rules.write().await.insert(rule.id, rule);
    }

    pub async fn list_enabled_rules_by_type(&self, rule_type: RuleType) -> Vec<AutomationRule> {
        self.rules
            .read()
            .await
            .values()
            .filter(|r| r.enabled && r.rule_type == rule_type)
            .cloned()
            .collect()
    }

    pub async fn update_rule<F>(&self, id: Uuid, f: F) -> Result<AutomationRule, DomainError>
    where
        F: FnOnce(&mut AutomationRule),
    {
        let mut rules = self.rules.write().await;
        let rule = rules.get_mut(&id).ok_or(DomainError::RuleNotFound(id))?;
        f(rule);
        Ok(rule.clone())
    }

    // --- Automation rules v2 ---

    pub async fn insert_rule_v2(&self, rule: AutomationRuleV2) {
        self.rules_v2.write().await.insert(rule.id, rule);
    }

    pub async fn list_enabled_rules_v2(&self) -> Vec<AutomationRuleV2> {
        self.rules_v2
            .read()
            .await
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect()
    }

    pub async fn update_rule_v2<F>(&self, id: Uuid, f: F) -> Result<AutomationRuleV2, DomainError>
    where
        F: FnOnce(&mut AutomationRuleV2),
    {
        let mut rules = self.rules_v2.write().await;
        let rule = rules.get_mut(&id).ok_or(DomainError::RuleNotFound(id))?;
        f(rule);
        Ok(rule.clone())
    }

    // --- Rule execution logs ---

    pub async fn insert_rule_execution_log(&self, log: RuleExecutionLog) {
        self.rule_logs.write().await.push(log);
    }

    pub async fn rule_logs_for(&self, rule_id: Uuid) -> Vec<RuleExecutionLog> {
        self.rule_logs
            .read()
            .await
            .iter()
            .filter(|l| l.rule_id == rule_id)
            .cloned()
            .collect()
    }

    // --- Cost records ---

    pub async fn insert_cost_record(&self, record: CostRecord) {
        self.cost_records.write().await.push(record);
    }

    /// Cost records for one instance, most recent window first.
    pub async fn cost_records_for(&self, instance_id: Uuid) -> Vec<CostRecord> {
        let mut records: Vec<_> = self
            .cost_records
            .read()
            .await
            .iter()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.period_end.cmp(&a.period_end));
        records
    }

    // --- Cost limits (one per instance) ---

    pub async fn upsert_cost_limit(&self, limit: CostLimit) {
        self.cost_limits
            .write()
            .await
            .insert(limit.instance_id, limit);
    }

    pub async fn get_cost_limit(&self, instance_id: Uuid) -> Option<CostLimit> {
        self.cost_limits.read().await.get(&instance_id).cloned()
    }

    pub async fn list_cost_limits(&self) -> Vec<CostLimit> {
        self.cost_limits.read().await.values().cloned().collect()
    }

    pub async fn update_cost_limit<F>(
        &self,
        instance_id: Uuid,
        f: F,
    ) -> Result<CostLimit, DomainError>
    where
        F: FnOnce(&mut CostLimit),
    {
        let mut limits = self.cost_limits.write().await;
        let limit = limits
            .get_mut(&instance_id)
            .ok_or(DomainError::InstanceNotFound(instance_id))?;
        f(limit);
        Ok(limit.clone())
    }

    // --- Price records ---

    pub async fn insert_price_record(&self, record: PriceRecord) {
        self.price_records.write().await.push(record);
    }

    /// Price records for one instance, most recent first.
    pub async fn price_records_for(&self, instance_id: Uuid) -> Vec<PriceRecord> {
        let mut records: Vec<_> = self
            .price_records
            .read()
            .await
            .iter()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        records
    }

    pub async fn latest_price_record(&self, instance_id: Uuid) -> Option<PriceRecord> {
        self.price_records_for(instance_id).await.into_iter().next()
    }

    // --- Migrations ---

    pub async fn insert_migration(&self, task: MigrationTask) {
        self.migrations.write().await.insert(task.id, task);
    }

    pub async fn get_migration(&self, id: Uuid) -> Option<MigrationTask> {
        self.migrations.read().await.get(&id).cloned()
    }

    pub async fn update_migration<F>(&self, id: Uuid, f: F) -> Result<MigrationTask, DomainError>
    where
        F: FnOnce(&mut MigrationTask),
    {
        let mut migrations = self.migrations.write().await;
        let task = migrations
            .get_mut(&id)
            .ok_or(DomainError::MigrationNotFound(id))?;
        f(task);
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    // --- Failover configs (one per instance) ---

    pub async fn upsert_failover_config(&self, config: FailoverConfig) {
        self.failover_configs
            .write()
            .await
            .insert(config.instance_id, config);
    }

    pub async fn list_failover_configs(&self) -> Vec<FailoverConfig> {
        self.failover_configs
            .read()
            .await
            .values()
            .cloned()
            .collect()
    }

    pub async fn update_failover_config<F>(
        &self,
        instance_id: Uuid,
        f: F,
    ) -> Result<FailoverConfig, DomainError>
    where
        F: FnOnce(&mut FailoverConfig),
    {
        let mut configs = self.failover_configs.write().await;
        let config = configs
            .get_mut(&instance_id)
            .ok_or(DomainError::InstanceNotFound(instance_id))?;
        f(config);
        Ok(config.clone())
    }

    // --- Action logs ---

    pub async fn insert_action_log(&self, entry: ActionLogEntry) {
        self.action_logs.write().await.push(entry);
    }

    pub async fn complete_action_log(
        &self,
        id: Uuid,
        status: &str,
        error_message: Option<String>,
    ) {
        let mut logs = self.action_logs.write().await;
        if let Some(entry) = logs.iter_mut().find(|e| e.id == id) {
            let now = Utc::now();
            entry.status = status.to_string();
            entry.error_message = error_message;
            entry.duration_ms = Some((now - entry.created_at).num_milliseconds());
            entry.completed_at = Some(now);
        }
    }

    pub async fn action_logs_for(&self, instance_id: Uuid) -> Vec<ActionLogEntry> {
        self.action_logs
            .read()
            .await
            .iter()
            .filter(|e| e.instance_id == Some(instance_id))
            .cloned()
            .collect()
    }

    pub async fn action_logs_by_type(&self, action_type: &str) -> Vec<ActionLogEntry> {
        self.action_logs
            .read()
            .await
            .iter()
            .filter(|e| e.action_type == action_type)
            .cloned()
            .collect()
    }
}
