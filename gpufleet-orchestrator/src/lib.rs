pub mod action_log;
pub mod auto_restart;
pub mod config;
pub mod cost_monitor;
pub mod failover;
pub mod health_check;
pub mod locks;
pub mod migration;
pub mod notifier;
pub mod price_monitor;
pub mod provider_manager;
pub mod reconciliation;
pub mod rule_engine;
pub mod scheduler;
pub mod state_machine;
pub mod store;
