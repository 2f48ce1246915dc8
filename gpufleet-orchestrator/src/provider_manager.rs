//! Provider registry: AUTO resolution and adapter construction.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::sync::RwLock;

use anyhow::Result;
use tracing::debug;

use gpufleet_common::{DomainError, ProviderKind};
use gpufleet_providers::mock::MockProvider;
use gpufleet_providers::runpod::RunPodProvider;
use gpufleet_providers::vast::VastProvider;
use gpufleet_providers::GpuProvider;

use crate::store::SharedStore;

/// Fallback when no provider config is enabled.
const DEFAULT_PROVIDER: ProviderKind = ProviderKind::RunPod;

pub struct ProviderRegistry {
    store: SharedStore,
    /// Shared adapters keyed by concrete provider kind. Adapters built for a
    /// caller credential never enter this cache.
    adapters: RwLock<HashMap<ProviderKind, Arc<dyn GpuProvider>>>,
}

impl ProviderRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Seeds a pre-built adapter into the shared cache. Tests use this to
    /// hold a handle on the same mock the jobs talk to.
    pub async fn register_adapter(&self, adapter: Arc<dyn GpuProvider>) {
        self.adapters.write().await.insert(adapter.kind(), adapter);
    }

    /// Resolves `Auto` to a concrete provider. Provider configs are read from
    /// the store on every call; an admin toggling a provider takes effect on
    /// the next resolution. Ties on weight break on the `ProviderKind`
    /// ordering so resolution is deterministic.
    pub async fn resolve(&self, requested: ProviderKind) -> ProviderKind {
        if requested.is_concrete() {
            return requested;
        }
        let mut enabled: Vec<_> = self
            .store
            .list_provider_configs()
            .await
            .into_iter()
            .filter(|c| c.enabled && c.provider.is_concrete())
            .collect();
        enabled.sort_by(|a, b| b.weight.cmp(&a.weight).then(a.provider.cmp(&b.provider)));
        let chosen = enabled
            .first()
            .map(|c| c.provider)
            .unwrap_or(DEFAULT_PROVIDER);
        debug!(provider = %chosen, "resolved auto provider selection");
        chosen
    }

    /// Adapter for a concrete provider. A caller credential always gets a
    /// fresh adapter bound to that key; otherwise the shared adapter is built
    /// once and cached.
    pub async fn get_adapter(
        &self,
        kind: ProviderKind,
        credential: Option<&str>,
    ) -> Result<Arc<dyn GpuProvider>> {
        if !kind.is_concrete() {
            return Err(DomainError::ProviderNotConcrete(kind).into());
        }

        if let Some(key) = credential {
            return build_adapter(kind, Some(key.to_string()));
        }

        if let Some(adapter) = self.adapters.read().await.get(&kind) {
            return Ok(adapter.clone());
        }

        let config = self.store.get_provider_config(kind).await;
        let adapter = build_adapter(kind, config.and_then(|c| c.credential))?;
        self.adapters.write().await.insert(kind, adapter.clone());
        Ok(adapter)
    }
}

fn build_adapter(
    kind: ProviderKind,
    credential: Option<String>,
) -> Result<Arc<dyn GpuProvider>> {
    match kind {
        ProviderKind::RunPod => {
            let key = credential
                .or_else(|| env::var("RUNPOD_API_KEY").ok())
                .ok_or(DomainError::AdapterUnavailable(kind))?;
            Ok(Arc::new(RunPodProvider::new(key)))
        }
        ProviderKind::Vast => {
            let key = credential
                .or_else(|| env::var("VAST_API_KEY").ok())
                .ok_or(DomainError::AdapterUnavailable(kind))?;
            Ok(Arc::new(VastProvider::new(key)))
        }
        ProviderKind::Mock => Ok(Arc::new(MockProvider::new())),
        ProviderKind::Auto => Err(DomainError::ProviderNotConcrete(kind).into()),
    }
}
