use std::env;
use std::sync::Arc;

use tracing::info;

use gpufleet_common::{ProviderConfig, ProviderKind};
use gpufleet_orchestrator::health_check::HealthChecker;
use gpufleet_orchestrator::locks::InstanceLocks;
use gpufleet_orchestrator::migration::MigrationManager;
use gpufleet_orchestrator::notifier::{LogNotifier, Notifier};
use gpufleet_orchestrator::provider_manager::ProviderRegistry;
use gpufleet_orchestrator::rule_engine::RuleEngine;
use gpufleet_orchestrator::scheduler::TaskScheduler;
use gpufleet_orchestrator::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    info!("gpufleet orchestrator starting");

    let store = Store::new();
    seed_provider_configs(&store).await;

    let registry = Arc::new(ProviderRegistry::new(store.clone()));
    let locks = InstanceLocks::new();
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let health_checker = Arc::new(HealthChecker::new(store.clone())?);
    let migration = Arc::new(MigrationManager::new(
        store.clone(),
        registry.clone(),
        locks.clone(),
    ));
    let rule_engine = Arc::new(RuleEngine::new(
        store.clone(),
        registry.clone(),
        locks.clone(),
        notifier.clone(),
        migration.clone(),
    ));

    let mut scheduler = TaskScheduler::new(
        store,
        registry,
        locks,
        notifier,
        health_checker,
        migration,
        rule_engine,
    );
    scheduler.start();

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    scheduler.shutdown();
    Ok(())
}

/// Bootstraps provider configs from the environment. A provider with no API
/// key stays disabled; weights steer AUTO resolution toward RunPod first.
async fn seed_provider_configs(store: &Arc<gpufleet_orchestrator::store::Store>) {
    let mut runpod = ProviderConfig::new(ProviderKind::RunPod, false, 100);
    if let Ok(key) = env::var("RUNPOD_API_KEY") {
        runpod.enabled = true;
        runpod.credential = Some(key);
    }
    store.upsert_provider_config(runpod).await;

    let mut vast = ProviderConfig::new(ProviderKind::Vast, false, 50);
    if let Ok(key) = env::var("VAST_API_KEY") {
        vast.enabled = true;
        vast.credential = Some(key);
    }
    store.upsert_provider_config(vast).await;

    let mock_enabled = env::var("GPUFLEET_ENABLE_MOCK")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    store
        .upsert_provider_config(ProviderConfig::new(ProviderKind::Mock, mock_enabled, 1))
        .await;
}
