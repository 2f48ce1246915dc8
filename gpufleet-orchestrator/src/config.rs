//! Environment-driven tunables. Read at call time so operators can adjust
//! intervals and thresholds without a restart of anything but the job tick.

use std::env;
use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn reconciliation_interval() -> Duration {
    Duration::from_secs(env_u64("GPUFLEET_RECONCILIATION_INTERVAL_SECS", 30))
}

pub fn stale_sweep_interval() -> Duration {
    Duration::from_secs(env_u64("GPUFLEET_STALE_SWEEP_INTERVAL_SECS", 3600))
}

pub fn health_check_interval() -> Duration {
    Duration::from_secs(env_u64("GPUFLEET_HEALTH_CHECK_INTERVAL_SECS", 30))
}

pub fn health_check_timeout() -> Duration {
    Duration::from_secs(env_u64("GPUFLEET_HEALTH_CHECK_TIMEOUT_SECS", 10))
}

pub fn auto_restart_interval() -> Duration {
    Duration::from_secs(env_u64("GPUFLEET_AUTO_RESTART_INTERVAL_SECS", 60))
}

pub fn cost_tracking_interval() -> Duration {
    Duration::from_secs(env_u64("GPUFLEET_COST_TRACKING_INTERVAL_SECS", 3600))
}

pub fn cost_limit_interval() -> Duration {
    Duration::from_secs(env_u64("GPUFLEET_COST_LIMIT_INTERVAL_SECS", 3600))
}

pub fn price_monitor_interval() -> Duration {
    Duration::from_secs(env_u64("GPUFLEET_PRICE_MONITOR_INTERVAL_SECS", 3600))
}

pub fn price_change_threshold() -> f64 {
    env_f64("GPUFLEET_PRICE_CHANGE_THRESHOLD", 0.05)
}

pub fn migration_trigger_interval() -> Duration {
    Duration::from_secs(env_u64("GPUFLEET_MIGRATION_TRIGGER_INTERVAL_SECS", 21600))
}

pub fn migration_verify_timeout() -> Duration {
    Duration::from_secs(env_u64("GPUFLEET_MIGRATION_VERIFY_TIMEOUT_SECS", 300))
}

pub fn failover_interval() -> Duration {
    Duration::from_secs(env_u64("GPUFLEET_FAILOVER_INTERVAL_SECS", 300))
}

pub fn rule_engine_interval() -> Duration {
    Duration::from_secs(env_u64("GPUFLEET_RULE_ENGINE_INTERVAL_SECS", 60))
}

pub fn stale_creating_max_age_hours() -> i64 {
    env_u64("GPUFLEET_STALE_CREATING_MAX_AGE_HOURS", 24) as i64
}
