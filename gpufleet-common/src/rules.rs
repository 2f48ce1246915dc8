//! Typed views over the opaque JSON configs stored on automation rules.
//!
//! Parsing is permissive on purpose: unknown fields are ignored and missing
//! fields fall back to defaults or `None`. A config that cannot express a
//! complete condition makes the rule not match; it never hard-fails
//! evaluation.

use serde::Deserialize;

use crate::{CostPeriod, ProviderKind};

fn default_unhealthy_window_secs() -> i64 {
    300
}

fn default_consecutive_failures() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoRestartConfig {
    /// Trailing window sized to the "unhealthy threshold" duration.
    pub unhealthy_window_secs: i64,
    pub min_consecutive_failures: u32,
}

impl Default for AutoRestartConfig {
    fn default() -> Self {
        Self {
            unhealthy_window_secs: default_unhealthy_window_secs(),
            min_consecutive_failures: default_consecutive_failures(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PriceAlertConfig {
    pub max_hourly_price: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CostThresholdConfig {
    pub threshold: Option<f64>,
    pub period: Option<CostPeriod>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthCheckFailedConfig {
    pub consecutive_failures: u32,
    pub window_secs: i64,
}

impl Default for HealthCheckFailedConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: default_consecutive_failures(),
            window_secs: default_unhealthy_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeBasedConfig {
    /// UTC time of day, "HH:MM".
    pub time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PriceChangeConfig {
    /// Relative change between the two most recent price records, percent.
    pub percent: Option<f64>,
    /// "up", "down", or unset for either direction.
    pub direction: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MigrateTriggerConfig {
    /// Price ceiling on the current provider that triggers a migration.
    pub max_hourly_price: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MigrateActionConfig {
    pub target_provider: Option<ProviderKind>,
    pub gpu_type: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyActionConfig {
    pub event_type: String,
    pub title: String,
    /// Template; `{placeholder}` tokens are substituted from the trigger
    /// context at execution time.
    pub message: String,
}

impl Default for NotifyActionConfig {
    fn default() -> Self {
        Self {
            event_type: "rule_triggered".to_string(),
            title: "Automation rule triggered".to_string(),
            message: "Rule fired: {reason}".to_string(),
        }
    }
}

/// Parse an opaque rule config, falling back to defaults when the JSON is
/// malformed or not an object.
pub fn parse_config<T>(value: &serde_json::Value) -> T
where
    T: for<'de> Deserialize<'de> + Default,
{
    serde_json::from_value(value.clone()).unwrap_or_default()
}
