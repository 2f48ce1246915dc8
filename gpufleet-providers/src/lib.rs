use anyhow::Result;
use async_trait::async_trait;

use gpufleet_common::{InstanceStatus, ProviderKind, SshInfo, Telemetry};

/// Uniform interface to one GPU provider's remote API.
///
/// All operations are remote calls and may fail with a provider-specific
/// error; callers treat those as transient unless the message indicates a
/// permanent (auth/bad-request) condition.
#[async_trait]
pub trait GpuProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Provision a remote instance. Safe to retry on network failure only
    /// while no remote id has been observed; once a remote id is returned,
    /// retrying would double-provision.
    async fn create_instance(&self, req: &CreateInstanceRequest) -> Result<CreatedInstance>;

    /// Idempotent, side-effect-free. A remote instance that no longer exists
    /// yields `InstanceStatus::Deleted`, not an error.
    async fn get_status(&self, remote_id: &str) -> Result<RemoteStatus>;

    /// Provider-level idempotence is NOT assumed; callers gate repeated calls
    /// behind local status checks.
    async fn stop_instance(&self, remote_id: &str) -> Result<bool>;
    async fn start_instance(&self, remote_id: &str) -> Result<bool>;
    async fn restart_instance(&self, remote_id: &str) -> Result<bool>;

    /// Best-effort; callers proceed with local cleanup even on failure.
    /// A leaked remote resource is logged, never fatal.
    async fn delete_instance(&self, remote_id: &str) -> Result<bool>;

    /// `None` means "unknown", never zero; callers exclude unknown prices
    /// from comparisons.
    async fn get_price(&self, gpu_type: &str) -> Result<Option<f64>>;

    /// Normalize a generic or provider-native GPU type spelling to the
    /// provider's native name. `None` if the provider does not offer it.
    fn map_gpu_type(&self, gpu_type: &str) -> Option<String>;

    /// Fetch the provider's raw availability payload for a native GPU type.
    async fn fetch_availability_raw(&self, native_gpu_type: &str) -> Result<serde_json::Value>;

    /// Parse the raw payload into the normalized availability shape.
    fn parse_availability(
        &self,
        raw: &serde_json::Value,
        native_gpu_type: &str,
    ) -> Result<GpuAvailability>;

    /// Fixed orchestration over the three hooks above. Providers customize
    /// the hooks, not this method.
    async fn check_availability(&self, gpu_type: &str) -> Result<GpuAvailability> {
        let Some(native) = self.map_gpu_type(gpu_type) else {
            return Ok(GpuAvailability::unavailable(gpu_type));
        };
        let raw = self.fetch_availability_raw(&native).await?;
        self.parse_availability(&raw, &native)
    }
}

#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    /// Local instance id; used to tag the remote resource for traceability.
    pub instance_id: uuid::Uuid,
    pub gpu_type: String,
    pub gpu_count: u32,
    pub image: String,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct CreatedInstance {
    pub remote_id: String,
    pub status: InstanceStatus,
}

/// Normalized status snapshot. Optional fields were simply not reported by
/// the provider; callers merge only what is present.
#[derive(Debug, Clone)]
pub struct RemoteStatus {
    pub status: InstanceStatus,
    pub endpoint: Option<String>,
    pub ssh: Option<SshInfo>,
    pub telemetry: Telemetry,
}

#[derive(Debug, Clone)]
pub struct GpuAvailability {
    pub gpu_type: String,
    pub available: bool,
    pub count: u32,
    pub price_per_hour: Option<f64>,
    pub regions: Vec<String>,
}

impl GpuAvailability {
    pub fn unavailable(gpu_type: &str) -> Self {
        Self {
            gpu_type: gpu_type.to_string(),
            available: false,
            count: 0,
            price_per_hour: None,
            regions: Vec::new(),
        }
    }
}

/// Case-insensitive lookup in a static (generic, native) mapping table.
/// Accepts either spelling and returns the native one.
pub(crate) fn lookup_gpu_type(table: &[(&str, &str)], input: &str) -> Option<String> {
    let needle = input.trim().to_ascii_lowercase();
    for (generic, native) in table {
        if generic.to_ascii_lowercase() == needle || native.to_ascii_lowercase() == needle {
            return Some(native.to_string());
        }
    }
    None
}

#[cfg(feature = "runpod")]
pub mod runpod;

#[cfg(feature = "vast")]
pub mod vast;

#[cfg(feature = "mock")]
pub mod mock;
