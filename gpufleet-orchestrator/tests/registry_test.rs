mod common;

use std::sync::Arc;

use common::Fleet;
use gpufleet_common::{ProviderConfig, ProviderKind};
use gpufleet_providers::GpuProvider;

#[tokio::test]
async fn concrete_provider_passes_through() {
    let fleet = Fleet::new().await;
    assert_eq!(
        fleet.registry.resolve(ProviderKind::Vast).await,
        ProviderKind::Vast
    );
}

#[tokio::test]
async fn auto_picks_highest_enabled_weight() {
    let fleet = Fleet::new().await;
    fleet
        .store
        .upsert_provider_config(ProviderConfig::new(ProviderKind::RunPod, false, 100))
        .await;
    fleet
        .store
        .upsert_provider_config(ProviderConfig::new(ProviderKind::Vast, true, 50))
        .await;
    // Mock is enabled at weight 10 by the fixture.

    // RunPod has the top weight but is disabled.
    assert_eq!(fleet.registry.resolve(ProviderKind::Auto).await, ProviderKind::Vast);
}

#[tokio::test]
async fn auto_resolution_is_deterministic_on_ties() {
    let fleet = Fleet::new().await;
    fleet
        .store
        .upsert_provider_config(ProviderConfig::new(ProviderKind::Vast, true, 10))
        .await;
    // Mock also sits at weight 10; the kind ordering breaks the tie.

    for _ in 0..10 {
        assert_eq!(fleet.registry.resolve(ProviderKind::Auto).await, ProviderKind::Vast);
    }
}

#[tokio::test]
async fn auto_with_nothing_enabled_uses_the_default() {
    let fleet = Fleet::new().await;
    fleet
        .store
        .upsert_provider_config(ProviderConfig::new(ProviderKind::Mock, false, 10))
        .await;

    assert_eq!(
        fleet.registry.resolve(ProviderKind::Auto).await,
        ProviderKind::RunPod
    );
}

#[tokio::test]
async fn config_changes_apply_on_next_resolution() {
    let fleet = Fleet::new().await;
    assert_eq!(fleet.registry.resolve(ProviderKind::Auto).await, ProviderKind::Mock);

    fleet
        .store
        .upsert_provider_config(ProviderConfig::new(ProviderKind::Vast, true, 99))
        .await;
    assert_eq!(fleet.registry.resolve(ProviderKind::Auto).await, ProviderKind::Vast);
}

#[tokio::test]
async fn auto_is_rejected_by_get_adapter() {
    let fleet = Fleet::new().await;
    assert!(fleet.registry.get_adapter(ProviderKind::Auto, None).await.is_err());
}

#[tokio::test]
async fn shared_adapter_is_cached_credentialed_is_not() {
    let fleet = Fleet::new().await;

    let shared = fleet.registry.get_adapter(ProviderKind::Mock, None).await.unwrap();
    let shared_again = fleet.registry.get_adapter(ProviderKind::Mock, None).await.unwrap();
    let seeded: Arc<dyn GpuProvider> = fleet.mock.clone();
    assert!(Arc::ptr_eq(&shared, &seeded));
    assert!(Arc::ptr_eq(&shared, &shared_again));

    // A caller credential gets its own adapter and never enters the cache.
    let dedicated = fleet
        .registry
        .get_adapter(ProviderKind::Mock, Some("owner-key"))
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&dedicated, &shared));

    let shared_after = fleet.registry.get_adapter(ProviderKind::Mock, None).await.unwrap();
    assert!(Arc::ptr_eq(&shared_after, &shared));
}

#[tokio::test]
async fn unconfigured_remote_provider_has_no_adapter() {
    let fleet = Fleet::new().await;
    // No API key in config or environment for Vast in tests.
    if std::env::var("VAST_API_KEY").is_err() {
        assert!(fleet.registry.get_adapter(ProviderKind::Vast, None).await.is_err());
    }
}
