#![allow(dead_code)]

//! Shared fixtures: an in-process fleet wired to a shared mock provider, a
//! recording notifier, and throwaway HTTP endpoints for health probes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;

use gpufleet_common::{Instance, InstanceStatus, ProviderConfig, ProviderKind};
use gpufleet_orchestrator::locks::InstanceLocks;
use gpufleet_orchestrator::migration::MigrationManager;
use gpufleet_orchestrator::notifier::Notifier;
use gpufleet_orchestrator::provider_manager::ProviderRegistry;
use gpufleet_orchestrator::store::{SharedStore, Store};
use gpufleet_providers::mock::MockProvider;
use gpufleet_providers::{CreateInstanceRequest, GpuProvider};

#[derive(Debug, Clone)]
pub struct SentNotification {
    pub owner_id: Uuid,
    pub event_type: String,
    pub title: String,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_notification(
        &self,
        owner_id: Uuid,
        event_type: &str,
        title: &str,
        message: &str,
    ) -> Result<HashMap<String, bool>> {
        self.sent.lock().unwrap().push(SentNotification {
            owner_id,
            event_type: event_type.to_string(),
            title: title.to_string(),
            message: message.to_string(),
        });
        let mut channels = HashMap::new();
        channels.insert("test".to_string(), true);
        Ok(channels)
    }
}

pub struct Fleet {
    pub store: SharedStore,
    pub registry: Arc<ProviderRegistry>,
    pub locks: Arc<InstanceLocks>,
    pub notifier: Arc<RecordingNotifier>,
    pub mock: Arc<MockProvider>,
}

/// Mock behavior presented under a different provider kind, so multi-provider
/// flows (failover, migration) can be exercised without real adapters.
pub struct KindMock {
    pub inner: Arc<MockProvider>,
    kind: ProviderKind,
}

impl KindMock {
    pub fn new(kind: ProviderKind) -> Self {
        Self::with_inner(kind, Arc::new(MockProvider::new().with_boot_delay(Duration::ZERO)))
    }

    pub fn with_inner(kind: ProviderKind, inner: Arc<MockProvider>) -> Self {
        Self { inner, kind }
    }
}

#[async_trait]
impl GpuProvider for KindMock {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn create_instance(
        &self,
        req: &CreateInstanceRequest,
    ) -> Result<gpufleet_providers::CreatedInstance> {
        self.inner.create_instance(req).await
    }

    async fn get_status(&self, remote_id: &str) -> Result<gpufleet_providers::RemoteStatus> {
        self.inner.get_status(remote_id).await
    }

    async fn stop_instance(&self, remote_id: &str) -> Result<bool> {
        self.inner.stop_instance(remote_id).await
    }

    async fn start_instance(&self, remote_id: &str) -> Result<bool> {
        self.inner.start_instance(remote_id).await
    }

    async fn restart_instance(&self, remote_id: &str) -> Result<bool> {
        self.inner.restart_instance(remote_id).await
    }

    async fn delete_instance(&self, remote_id: &str) -> Result<bool> {
        self.inner.delete_instance(remote_id).await
    }

    async fn get_price(&self, gpu_type: &str) -> Result<Option<f64>> {
        self.inner.get_price(gpu_type).await
    }

    fn map_gpu_type(&self, gpu_type: &str) -> Option<String> {
        self.inner.map_gpu_type(gpu_type)
    }

    async fn fetch_availability_raw(&self, native_gpu_type: &str) -> Result<serde_json::Value> {
        self.inner.fetch_availability_raw(native_gpu_type).await
    }

    fn parse_availability(
        &self,
        raw: &serde_json::Value,
        native_gpu_type: &str,
    ) -> Result<gpufleet_providers::GpuAvailability> {
        self.inner.parse_availability(raw, native_gpu_type)
    }
}

impl Fleet {
    /// Fleet wired to a zero-boot-delay mock shared between the test and the
    /// registry, so assertions see the same remote state the jobs act on.
    pub async fn new() -> Self {
        Self::with_boot_delay(Duration::ZERO).await
    }

    /// Variant whose mock takes `delay` to boot, for verify-timeout paths.
    pub async fn with_boot_delay(delay: Duration) -> Self {
        let store = Store::new();
        store
            .upsert_provider_config(ProviderConfig::new(ProviderKind::Mock, true, 10))
            .await;

        let registry = Arc::new(ProviderRegistry::new(store.clone()));
        let mock = Arc::new(MockProvider::new().with_boot_delay(delay));
        registry.register_adapter(mock.clone()).await;

        Self {
            store,
            registry,
            locks: InstanceLocks::new(),
            notifier: Arc::new(RecordingNotifier::default()),
            mock,
        }
    }

    pub fn notifier_dyn(&self) -> Arc<dyn Notifier> {
        self.notifier.clone()
    }

    pub fn migration_manager(&self) -> MigrationManager {
        MigrationManager::new(self.store.clone(), self.registry.clone(), self.locks.clone())
            .with_verify_timing(Duration::from_secs(2), Duration::from_millis(20))
    }

    /// Creates a mock-backed instance and records it locally as Running.
    pub async fn running_instance(&self, owner_id: Uuid) -> Instance {
        self.running_instance_with_gpu(owner_id, "RTX 4090").await
    }

    pub async fn running_instance_with_gpu(&self, owner_id: Uuid, gpu_type: &str) -> Instance {
        let mut instance = Instance::new(
            owner_id,
            ProviderKind::Mock,
            gpu_type,
            1,
            "pytorch/pytorch:latest",
        );
        let created = self
            .mock
            .create_instance(&CreateInstanceRequest {
                instance_id: instance.id,
                gpu_type: gpu_type.to_string(),
                gpu_count: 1,
                image: instance.image.clone(),
                env: vec![],
            })
            .await
            .unwrap();
        let remote = self.mock.get_status(&created.remote_id).await.unwrap();

        instance.remote_id = Some(created.remote_id);
        instance.status = InstanceStatus::Running;
        instance.endpoint = remote.endpoint;
        instance.ssh = remote.ssh;
        self.store.insert_instance(instance.clone()).await;
        self.store.get_instance(instance.id).await.unwrap()
    }
}

/// One-shot HTTP server answering every request with the given status line.
/// Returns the `host:port` it listens on.
pub async fn spawn_http_responder(status_line: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let body = format!(
                    "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    status_line
                );
                let _ = socket.write_all(body.as_bytes()).await;
            });
        }
    });
    addr
}

/// Accepts connections but never answers, to exercise probe timeouts.
pub async fn spawn_silent_listener() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            held.push(socket);
        }
    });
    addr
}
