//! Background job scheduler.
//!
//! Each job is its own spawned loop on a `tokio::time::interval`, so a slow
//! invocation only delays its own next tick and never another job's. Job
//! errors are logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config;
use crate::health_check::HealthChecker;
use crate::locks::InstanceLocks;
use crate::migration::MigrationManager;
use crate::notifier::Notifier;
use crate::provider_manager::ProviderRegistry;
use crate::rule_engine::RuleEngine;
use crate::store::SharedStore;
use crate::{auto_restart, cost_monitor, failover, price_monitor, reconciliation};

pub struct TaskScheduler {
    store: SharedStore,
    registry: Arc<ProviderRegistry>,
    locks: Arc<InstanceLocks>,
    notifier: Arc<dyn Notifier>,
    health_checker: Arc<HealthChecker>,
    migration: Arc<MigrationManager>,
    rule_engine: Arc<RuleEngine>,
    handles: Vec<JoinHandle<()>>,
}

impl TaskScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SharedStore,
        registry: Arc<ProviderRegistry>,
        locks: Arc<InstanceLocks>,
        notifier: Arc<dyn Notifier>,
        health_checker: Arc<HealthChecker>,
        migration: Arc<MigrationManager>,
        rule_engine: Arc<RuleEngine>,
    ) -> Self {
        Self {
            store,
            registry,
            locks,
            notifier,
            health_checker,
            migration,
            rule_engine,
            handles: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        info!("starting scheduler jobs");

        self.spawn_job("reconciliation", config::reconciliation_interval(), {
            let store = self.store.clone();
            let registry = self.registry.clone();
            move || {
                let store = store.clone();
                let registry = registry.clone();
                async move { reconciliation::reconcile_instances(&store, &registry).await }
            }
        });

        self.spawn_job("stale_sweep", config::stale_sweep_interval(), {
            let store = self.store.clone();
            move || {
                let store = store.clone();
                async move { reconciliation::sweep_stale_instances(&store).await }
            }
        });

        self.spawn_job("health_check", config::health_check_interval(), {
            let checker = self.health_checker.clone();
            move || {
                let checker = checker.clone();
                async move { checker.run_checks().await }
            }
        });

        self.spawn_job("auto_restart", config::auto_restart_interval(), {
            let store = self.store.clone();
            let registry = self.registry.clone();
            let locks = self.locks.clone();
            move || {
                let store = store.clone();
                let registry = registry.clone();
                let locks = locks.clone();
                async move { auto_restart::run(&store, &registry, &locks).await }
            }
        });

        self.spawn_job("cost_tracking", config::cost_tracking_interval(), {
            let store = self.store.clone();
            let registry = self.registry.clone();
            move || {
                let store = store.clone();
                let registry = registry.clone();
                async move { cost_monitor::track_costs(&store, &registry).await }
            }
        });

        self.spawn_job("cost_limits", config::cost_limit_interval(), {
            let store = self.store.clone();
            let registry = self.registry.clone();
            let locks = self.locks.clone();
            let notifier = self.notifier.clone();
            move || {
                let store = store.clone();
                let registry = registry.clone();
                let locks = locks.clone();
                let notifier = notifier.clone();
                async move {
                    cost_monitor::evaluate_limits(&store, &registry, &locks, &notifier).await
                }
            }
        });

        self.spawn_job("price_monitor", config::price_monitor_interval(), {
            let store = self.store.clone();
            let registry = self.registry.clone();
            move || {
                let store = store.clone();
                let registry = registry.clone();
                async move { price_monitor::sample_prices(&store, &registry).await }
            }
        });

        self.spawn_job("migration_triggers", config::migration_trigger_interval(), {
            let migration = self.migration.clone();
            move || {
                let migration = migration.clone();
                async move { migration.check_migration_triggers().await }
            }
        });

        self.spawn_job("failover", config::failover_interval(), {
            let store = self.store.clone();
            let registry = self.registry.clone();
            let locks = self.locks.clone();
            let notifier = self.notifier.clone();
            move || {
                let store = store.clone();
                let registry = registry.clone();
                let locks = locks.clone();
                let notifier = notifier.clone();
                async move { failover::run(&store, &registry, &locks, &notifier).await }
            }
        });

        self.spawn_job("rule_engine", config::rule_engine_interval(), {
            let engine = self.rule_engine.clone();
            move || {
                let engine = engine.clone();
                async move { engine.run().await }
            }
        });
    }

    fn spawn_job<F, Fut>(&mut self, name: &'static str, period: Duration, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        info!(job = name, period_secs = period.as_secs(), "scheduling job");
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                job().await;
            }
        });
        self.handles.push(handle);
    }

    pub fn shutdown(&mut self) {
        info!("stopping scheduler jobs");
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
