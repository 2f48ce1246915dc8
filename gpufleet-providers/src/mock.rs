//! In-memory mock provider for local development and tests.
//!
//! Emulates the asynchronous nature of a real provider: created instances
//! stay in a booting state for a configurable delay before reporting
//! running, and IPs are allocated from a deterministic sequence.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use gpufleet_common::{InstanceStatus, ProviderKind, SshInfo, Telemetry};

use crate::{
    lookup_gpu_type, CreateInstanceRequest, CreatedInstance, GpuAvailability, GpuProvider,
    RemoteStatus,
};

const GPU_TYPES: &[(&str, &str)] = &[
    ("NVIDIA GeForce RTX 4090", "RTX 4090"),
    ("RTX 4090", "RTX 4090"),
    ("NVIDIA GeForce RTX 3090", "RTX 3090"),
    ("RTX 3090", "RTX 3090"),
    ("NVIDIA A100 80GB PCIe", "A100"),
    ("A100", "A100"),
    ("NVIDIA H100 80GB HBM3", "H100"),
    ("H100", "H100"),
    ("NVIDIA L40S", "L40S"),
    ("L40S", "L40S"),
];

#[derive(Debug, Clone)]
struct MockInstance {
    gpu_type: String,
    gpu_count: u32,
    status: InstanceStatus,
    ip: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    stop_count: u64,
    start_count: u64,
    restart_count: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpCounts {
    pub stops: u64,
    pub starts: u64,
    pub restarts: u64,
}

pub struct MockProvider {
    instances: Mutex<HashMap<String, MockInstance>>,
    prices: Mutex<HashMap<String, f64>>,
    ip_seq: AtomicU64,
    boot_delay: Duration,
    /// When set, the provider behaves as unreachable for pricing lookups
    /// (used to exercise the failover liveness probe).
    unreachable: Mutex<bool>,
    fail_create: Mutex<bool>,
}

impl MockProvider {
    pub fn new() -> Self {
        let mut prices = HashMap::new();
        prices.insert("RTX 4090".to_string(), 0.44);
        prices.insert("RTX 3090".to_string(), 0.22);
        prices.insert("A100".to_string(), 1.19);
        prices.insert("H100".to_string(), 2.49);
        prices.insert("L40S".to_string(), 0.89);
        Self {
            instances: Mutex::new(HashMap::new()),
            prices: Mutex::new(prices),
            ip_seq: AtomicU64::new(0),
            boot_delay: Duration::from_secs(2),
            unreachable: Mutex::new(false),
            fail_create: Mutex::new(false),
        }
    }

    /// How long a created instance stays booting before it reports running.
    pub fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self
    }

    pub fn set_price(&self, gpu_type: &str, price: Option<f64>) {
        let Some(native) = self.map_gpu_type(gpu_type) else {
            return;
        };
        let mut prices = self.prices.lock().expect("prices lock");
        match price {
            Some(p) => {
                prices.insert(native, p);
            }
            None => {
                prices.remove(&native);
            }
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock().expect("unreachable lock") = unreachable;
    }

    pub fn set_fail_create(&self, fail: bool) {
        *self.fail_create.lock().expect("fail_create lock") = fail;
    }

    pub fn op_counts(&self, remote_id: &str) -> OpCounts {
        let instances = self.instances.lock().expect("instances lock");
        instances
            .get(remote_id)
            .map(|i| OpCounts {
                stops: i.stop_count,
                starts: i.start_count,
                restarts: i.restart_count,
            })
            .unwrap_or_default()
    }

    pub fn remote_status_of(&self, remote_id: &str) -> Option<InstanceStatus> {
        let mut instances = self.instances.lock().expect("instances lock");
        let inst = instances.get_mut(remote_id)?;
        Self::maybe_finish_boot(inst, self.boot_delay);
        Some(inst.status)
    }

    /// Force a remote-side state, emulating out-of-band provider actions
    /// (operator console, provider-initiated eviction).
    pub fn force_remote_status(&self, remote_id: &str, status: InstanceStatus) {
        let mut instances = self.instances.lock().expect("instances lock");
        if let Some(inst) = instances.get_mut(remote_id) {
            inst.status = status;
            if status == InstanceStatus::Running && inst.started_at.is_none() {
                inst.started_at = Some(Utc::now());
            }
        }
    }

    /// Drop the instance entirely, as if the provider deleted it without
    /// telling anyone.
    pub fn vanish(&self, remote_id: &str) {
        let mut instances = self.instances.lock().expect("instances lock");
        instances.remove(remote_id);
    }

    fn maybe_finish_boot(inst: &mut MockInstance, boot_delay: Duration) {
        if inst.status != InstanceStatus::Creating {
            return;
        }
        let elapsed = Utc::now().signed_duration_since(inst.created_at);
        if elapsed.num_milliseconds() as u128 >= boot_delay.as_millis() {
            inst.status = InstanceStatus::Running;
            inst.started_at = Some(Utc::now());
        }
    }

    fn alloc_ip(&self) -> String {
        let seq = self.ip_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let third = (seq / 250) % 250 + 1;
        let last = seq % 250 + 1;
        format!("10.10.{}.{}", third, last)
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GpuProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
    }

    async fn create_instance(&self, req: &CreateInstanceRequest) -> Result<CreatedInstance> {
        if *self.fail_create.lock().expect("fail_create lock") {
            return Err(anyhow::anyhow!("MockProvider: injected create failure"));
        }
        let native = self
            .map_gpu_type(&req.gpu_type)
            .ok_or_else(|| anyhow::anyhow!("MockProvider: unknown GPU type '{}'", req.gpu_type))?;

        let remote_id = format!("mock-{}", uuid::Uuid::new_v4());
        let ip = self.alloc_ip();

        let mut instances = self.instances.lock().expect("instances lock");
        instances.insert(
            remote_id.clone(),
            MockInstance {
                gpu_type: native,
                gpu_count: req.gpu_count,
                status: InstanceStatus::Creating,
                ip,
                created_at: Utc::now(),
                started_at: None,
                stop_count: 0,
                start_count: 0,
                restart_count: 0,
            },
        );

        Ok(CreatedInstance {
            remote_id,
            status: InstanceStatus::Creating,
        })
    }

    async fn get_status(&self, remote_id: &str) -> Result<RemoteStatus> {
        let mut instances = self.instances.lock().expect("instances lock");
        let Some(inst) = instances.get_mut(remote_id) else {
            // Gone on the provider side; report deleted, never fail.
            return Ok(RemoteStatus {
                status: InstanceStatus::Deleted,
                endpoint: None,
                ssh: None,
                telemetry: Telemetry::default(),
            });
        };
        Self::maybe_finish_boot(inst, self.boot_delay);

        let endpoint = match inst.status {
            InstanceStatus::Running => Some(format!("{}:8000", inst.ip)),
            _ => None,
        };
        let ssh = match inst.status {
            InstanceStatus::Running => Some(SshInfo {
                host: inst.ip.clone(),
                port: 22,
                user: "root".to_string(),
            }),
            _ => None,
        };
        let uptime = inst
            .started_at
            .map(|s| Utc::now().signed_duration_since(s).num_seconds().max(0));

        Ok(RemoteStatus {
            status: inst.status,
            endpoint,
            ssh,
            telemetry: Telemetry {
                uptime_seconds: uptime,
                vcpu_count: Some(8 * inst.gpu_count as i32),
                ram_gb: Some(32 * inst.gpu_count as i32),
                storage_gb: Some(100),
                gpu_util_percent: Some(0.0),
                gpu_mem_util_percent: Some(0.0),
            },
        })
    }

    async fn stop_instance(&self, remote_id: &str) -> Result<bool> {
        let mut instances = self.instances.lock().expect("instances lock");
        let Some(inst) = instances.get_mut(remote_id) else {
            return Err(anyhow::anyhow!("MockProvider: instance {} not found", remote_id));
        };
        inst.stop_count += 1;
        match inst.status {
            InstanceStatus::Running | InstanceStatus::Creating => {
                inst.status = InstanceStatus::Stopped;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn start_instance(&self, remote_id: &str) -> Result<bool> {
        let mut instances = self.instances.lock().expect("instances lock");
        let Some(inst) = instances.get_mut(remote_id) else {
            return Err(anyhow::anyhow!("MockProvider: instance {} not found", remote_id));
        };
        inst.start_count += 1;
        match inst.status {
            InstanceStatus::Stopped | InstanceStatus::Running => {
                inst.status = InstanceStatus::Running;
                inst.started_at.get_or_insert_with(Utc::now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn restart_instance(&self, remote_id: &str) -> Result<bool> {
        let mut instances = self.instances.lock().expect("instances lock");
        let Some(inst) = instances.get_mut(remote_id) else {
            return Err(anyhow::anyhow!("MockProvider: instance {} not found", remote_id));
        };
        inst.restart_count += 1;
        match inst.status {
            InstanceStatus::Running | InstanceStatus::Stopped => {
                inst.status = InstanceStatus::Running;
                inst.started_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_instance(&self, remote_id: &str) -> Result<bool> {
        let mut instances = self.instances.lock().expect("instances lock");
        match instances.remove(remote_id) {
            Some(_) => Ok(true),
            // Deleting something already gone is success for callers.
            None => Ok(true),
        }
    }

    async fn get_price(&self, gpu_type: &str) -> Result<Option<f64>> {
        if *self.unreachable.lock().expect("unreachable lock") {
            return Ok(None);
        }
        let Some(native) = self.map_gpu_type(gpu_type) else {
            return Ok(None);
        };
        let prices = self.prices.lock().expect("prices lock");
        Ok(prices.get(&native).copied())
    }

    fn map_gpu_type(&self, gpu_type: &str) -> Option<String> {
        lookup_gpu_type(GPU_TYPES, gpu_type)
    }

    async fn fetch_availability_raw(&self, native_gpu_type: &str) -> Result<serde_json::Value> {
        if *self.unreachable.lock().expect("unreachable lock") {
            return Err(anyhow::anyhow!("MockProvider: injected network failure"));
        }
        let prices = self.prices.lock().expect("prices lock");
        Ok(json!({
            "gpu_type": native_gpu_type,
            "price": prices.get(native_gpu_type).copied(),
            "count": if prices.contains_key(native_gpu_type) { 4 } else { 0 },
            "regions": ["mock-dc-1"],
        }))
    }

    fn parse_availability(
        &self,
        raw: &serde_json::Value,
        native_gpu_type: &str,
    ) -> Result<GpuAvailability> {
        let price = raw["price"].as_f64();
        let count = raw["count"].as_u64().unwrap_or(0) as u32;
        let regions = raw["regions"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|r| r.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(GpuAvailability {
            gpu_type: native_gpu_type.to_string(),
            available: count > 0,
            count,
            price_per_hour: price,
            regions,
        })
    }
}
