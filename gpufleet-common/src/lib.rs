pub mod error;
pub mod rules;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::DomainError;

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating, // Provisioning request sent to provider
    Running,  // Remote instance is up
    Stopped,  // Stopped but recoverable (still allocated)
    Error,    // Failed or lost on provider side
    Deleted,  // Soft-deleted; terminal
}

impl InstanceStatus {
    /// Terminal states are never reconciled against the provider.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Deleted)
    }
}

/// Provider identifier. `Auto` is a placeholder resolved by the registry
/// before any adapter call. Ordering is the stable tie-break for AUTO
/// resolution between equal-weight providers.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Auto,
    RunPod,
    Vast,
    Mock,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Auto => "auto",
            ProviderKind::RunPod => "runpod",
            ProviderKind::Vast => "vast",
            ProviderKind::Mock => "mock",
        }
    }

    pub fn is_concrete(&self) -> bool {
        !matches!(self, ProviderKind::Auto)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ProviderKind::Auto),
            "runpod" => Ok(ProviderKind::RunPod),
            "vast" | "vastai" | "vast.ai" => Ok(ProviderKind::Vast),
            "mock" => Ok(ProviderKind::Mock),
            other => Err(DomainError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Timeout,
    Error,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SshInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
}

/// Point-in-time telemetry merged from provider status responses.
/// All fields are optional; reconciliation only overwrites fields the
/// provider actually reported.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Telemetry {
    pub uptime_seconds: Option<i64>,
    pub vcpu_count: Option<i32>,
    pub ram_gb: Option<i32>,
    pub storage_gb: Option<i32>,
    pub gpu_util_percent: Option<f64>,
    pub gpu_mem_util_percent: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Instance {
    pub id: Uuid,
    pub owner_id: Uuid,
    /// Concrete provider after AUTO resolution at provisioning time.
    pub provider: ProviderKind,
    /// Remote identifier, set at most once per creation attempt. Required
    /// for any status/stop/start/restart/delete call.
    pub remote_id: Option<String>,
    pub gpu_type: String,
    pub gpu_count: u32,
    pub image: String,
    pub status: InstanceStatus,
    pub endpoint: Option<String>,
    pub ssh: Option<SshInfo>,
    pub telemetry: Telemetry,
    pub error_message: Option<String>,
    /// Owner-supplied provider API key; when present the registry builds a
    /// dedicated adapter for it instead of the shared one.
    pub api_credential: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new(owner_id: Uuid, provider: ProviderKind, gpu_type: &str, gpu_count: u32, image: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            provider,
            remote_id: None,
            gpu_type: gpu_type.to_string(),
            gpu_count,
            image: image.to_string(),
            status: InstanceStatus::Creating,
            endpoint: None,
            ssh: None,
            telemetry: Telemetry::default(),
            error_message: None,
            api_credential: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    pub provider: ProviderKind,
    pub enabled: bool,
    /// Scheduling weight for AUTO resolution; higher wins.
    pub weight: i32,
    pub credential: Option<String>,
    pub config: serde_json::Value,
}

impl ProviderConfig {
    pub fn new(provider: ProviderKind, enabled: bool, weight: i32) -> Self {
        Self {
            provider,
            enabled,
            weight,
            credential: None,
            config: serde_json::Value::Null,
        }
    }
}

/// Append-only. Absence of records means "not yet checked", never "healthy".
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HealthCheckRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub status: HealthStatus,
    pub response_time_ms: Option<i64>,
    pub endpoint: String,
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    HealthCheck,
    AutoRestart,
    CostLimit,
    PriceAlert,
    Failover,
}

/// Simple per-instance automation rule. `instance_id = None` applies the rule
/// to every instance of the owner.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AutomationRule {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub instance_id: Option<Uuid>,
    pub rule_type: RuleType,
    pub config: serde_json::Value,
    pub enabled: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub trigger_count: u64,
    pub created_at: DateTime<Utc>,
}

impl AutomationRule {
    pub fn new(owner_id: Uuid, instance_id: Option<Uuid>, rule_type: RuleType, config: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            instance_id,
            rule_type,
            config,
            enabled: true,
            last_triggered_at: None,
            trigger_count: 0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    CostThreshold,
    PriceChange,
    HealthCheckFailed,
    TimeBased,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Shutdown,
    Restart,
    Migrate,
    Notify,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RuleTarget {
    Instance(Uuid),
    Owner(Uuid),
}

/// Generalized trigger/action rule evaluated by the rule engine.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AutomationRuleV2 {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub trigger: TriggerType,
    pub trigger_config: serde_json::Value,
    pub action: ActionType,
    pub action_config: serde_json::Value,
    pub target: RuleTarget,
    pub enabled: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub trigger_count: u64,
    pub created_at: DateTime<Utc>,
}

impl AutomationRuleV2 {
    pub fn new(
        owner_id: Uuid,
        name: &str,
        trigger: TriggerType,
        trigger_config: serde_json::Value,
        action: ActionType,
        action_config: serde_json::Value,
        target: RuleTarget,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            name: name.to_string(),
            trigger,
            trigger_config,
            action,
            action_config,
            target,
            enabled: true,
            last_triggered_at: None,
            trigger_count: 0,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// Append-only audit row, one per rule firing. Status reflects the action's
/// actual outcome, not merely that the trigger matched.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RuleExecutionLog {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub instance_id: Option<Uuid>,
    pub trigger_reason: String,
    pub action: ActionType,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CostRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub owner_id: Uuid,
    pub amount: f64,
    pub usage_hours: f64,
    /// Half-open window [period_start, period_end); windows for the same
    /// instance never overlap.
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub provider: ProviderKind,
    pub gpu_type: String,
    pub unit_price: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CostPeriod {
    Daily,
    Weekly,
    Monthly,
    Total,
}

/// One active limit per instance. `limit_reached` is sticky: once the
/// auto-shutdown has fired it stays set until an external reset, which is
/// what guarantees at most one shutdown per configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CostLimit {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub limit_amount: f64,
    pub period: CostPeriod,
    pub current_cost: f64,
    pub limit_reached: bool,
    pub notify_at_percent: f64,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub shutdown_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CostLimit {
    pub fn new(instance_id: Uuid, limit_amount: f64, period: CostPeriod) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            limit_amount,
            period,
            current_cost: 0.0,
            limit_reached: false,
            notify_at_percent: 80.0,
            last_notified_at: None,
            shutdown_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Append-only; a new record is only written when the price moved by more
/// than the configured relative threshold since the last record.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PriceRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub provider: ProviderKind,
    pub gpu_type: String,
    pub price_per_hour: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStep {
    Validate,
    Create,
    Deploy,
    Verify,
    Cleanup,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MigrationStepLog {
    pub step: MigrationStep,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MigrationTask {
    pub id: Uuid,
    pub source_instance_id: Uuid,
    pub target_provider: ProviderKind,
    pub target_config: serde_json::Value,
    pub status: MigrationStatus,
    pub steps: Vec<MigrationStepLog>,
    pub target_instance_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationTask {
    pub fn new(source_instance_id: Uuid, target_provider: ProviderKind, target_config: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_instance_id,
            target_provider,
            target_config,
            status: MigrationStatus::Pending,
            steps: Vec::new(),
            target_instance_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step_completed(&self, step: MigrationStep) -> bool {
        self.steps.iter().any(|s| s.step == step)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FailoverConfig {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub primary_provider: ProviderKind,
    /// Tried in order on failover; the first reachable backup wins.
    pub backup_providers: Vec<ProviderKind>,
    pub health_check_interval_secs: i64,
    pub failover_threshold: u32,
    pub auto_failover_enabled: bool,
    pub last_failover_at: Option<DateTime<Utc>>,
    pub failover_count: u64,
}

impl FailoverConfig {
    pub fn new(instance_id: Uuid, primary: ProviderKind, backups: Vec<ProviderKind>) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            primary_provider: primary,
            backup_providers: backups,
            health_check_interval_secs: 30,
            failover_threshold: 3,
            auto_failover_enabled: true,
            last_failover_at: None,
            failover_count: 0,
        }
    }
}

/// Generic automation audit record written as start/complete pairs.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ActionLogEntry {
    pub id: Uuid,
    pub action_type: String,
    pub status: String,
    pub instance_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
