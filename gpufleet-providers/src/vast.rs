use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

use gpufleet_common::{InstanceStatus, ProviderKind, SshInfo, Telemetry};

use crate::{
    lookup_gpu_type, CreateInstanceRequest, CreatedInstance, GpuAvailability, GpuProvider,
    RemoteStatus,
};

const API_BASE: &str = "https://console.vast.ai/api/v0";

/// Vast.ai names GPUs without the vendor prefix; accept both spellings.
const GPU_TYPES: &[(&str, &str)] = &[
    ("NVIDIA GeForce RTX 4090", "RTX 4090"),
    ("RTX 4090", "RTX 4090"),
    ("NVIDIA GeForce RTX 3090", "RTX 3090"),
    ("RTX 3090", "RTX 3090"),
    ("NVIDIA RTX A6000", "RTX A6000"),
    ("RTX A6000", "RTX A6000"),
    ("NVIDIA A100 80GB PCIe", "A100 PCIE"),
    ("A100", "A100 PCIE"),
    ("NVIDIA H100 80GB HBM3", "H100 SXM"),
    ("H100", "H100 SXM"),
    ("NVIDIA L40S", "L40S"),
    ("L40S", "L40S"),
];

pub struct VastProvider {
    client: Client,
    api_key: String,
}

impl VastProvider {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .expect("reqwest client");
        Self {
            client,
            api_key: api_key.trim().to_string(),
        }
    }

    fn map_actual_status(actual: &str) -> InstanceStatus {
        match actual.to_ascii_lowercase().as_str() {
            "running" => InstanceStatus::Running,
            "stopped" | "exited" => InstanceStatus::Stopped,
            // created / loading / anything unknown: still coming up.
            _ => InstanceStatus::Creating,
        }
    }

    /// Search rentable on-demand offers for a native GPU type, cheapest first.
    async fn search_offers(&self, native_gpu_type: &str) -> Result<serde_json::Value> {
        let query = json!({
            "gpu_name": { "eq": native_gpu_type },
            "rentable": { "eq": true },
            "type": "on-demand",
            "order": [["dph_total", "asc"]],
        });
        let url = format!("{}/bundles/", API_BASE);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "q": query }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Vast offer search failed: {} - {}", status, text));
        }
        Ok(resp.json().await?)
    }

    async fn put_instance_state(&self, remote_id: &str, state: &str) -> Result<bool> {
        let url = format!("{}/instances/{}/", API_BASE, remote_id);
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "state": state }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "Vast state change to '{}' failed for {}: {} - {}",
                state,
                remote_id,
                status,
                text
            ));
        }
        let v: serde_json::Value = resp.json().await.unwrap_or(json!({}));
        Ok(v["success"].as_bool().unwrap_or(true))
    }
}

#[async_trait]
impl GpuProvider for VastProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Vast
    }

    async fn create_instance(&self, req: &CreateInstanceRequest) -> Result<CreatedInstance> {
        let native = self
            .map_gpu_type(&req.gpu_type)
            .ok_or_else(|| anyhow::anyhow!("Vast does not offer GPU type '{}'", req.gpu_type))?;

        // Vast rents concrete offers, not abstract types: pick the cheapest
        // matching ask with enough GPUs, then accept it.
        let offers = self.search_offers(&native).await?;
        let ask_id = offers["offers"]
            .as_array()
            .and_then(|list| {
                list.iter().find(|o| {
                    o["num_gpus"].as_u64().unwrap_or(0) >= req.gpu_count as u64
                })
            })
            .and_then(|o| o["id"].as_i64())
            .ok_or_else(|| {
                anyhow::anyhow!("no rentable Vast offer for '{}' x{}", native, req.gpu_count)
            })?;

        let env: serde_json::Map<String, serde_json::Value> = req
            .env
            .iter()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect();

        let url = format!("{}/asks/{}/", API_BASE, ask_id);
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "client_id": "me",
                "image": req.image,
                "env": env,
                "disk": 40,
                "label": format!("gpufleet-{}", req.instance_id),
                "runtype": "ssh",
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Vast create failed: {} - {}", status, text));
        }

        let v: serde_json::Value = resp.json().await?;
        let contract = v["new_contract"]
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("Vast create response missing new_contract"))?;

        Ok(CreatedInstance {
            remote_id: contract.to_string(),
            status: InstanceStatus::Creating,
        })
    }

    async fn get_status(&self, remote_id: &str) -> Result<RemoteStatus> {
        let url = format!("{}/instances/{}/", API_BASE, remote_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if resp.status().as_u16() == 404 {
            return Ok(RemoteStatus {
                status: InstanceStatus::Deleted,
                endpoint: None,
                ssh: None,
                telemetry: Telemetry::default(),
            });
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Vast status failed: {} - {}", status, text));
        }

        let v: serde_json::Value = resp.json().await?;
        let inst = if v["instances"].is_object() {
            v["instances"].clone()
        } else {
            v
        };

        let status = inst["actual_status"]
            .as_str()
            .map(Self::map_actual_status)
            .unwrap_or(InstanceStatus::Creating);

        let endpoint = inst["public_ipaddr"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|ip| {
                match inst["ports"]["8000/tcp"][0]["HostPort"]
                    .as_str()
                    .and_then(|p| p.parse::<u16>().ok())
                {
                    Some(port) => format!("{}:{}", ip, port),
                    None => ip.to_string(),
                }
            });

        let ssh = match (
            inst["ssh_host"].as_str().filter(|s| !s.is_empty()),
            inst["ssh_port"].as_i64(),
        ) {
            (Some(host), Some(port)) => Some(SshInfo {
                host: host.to_string(),
                port: port as u16,
                user: "root".to_string(),
            }),
            _ => None,
        };

        let telemetry = Telemetry {
            uptime_seconds: inst["duration"].as_f64().map(|d| d as i64),
            vcpu_count: inst["cpu_cores_effective"]
                .as_f64()
                .map(|c| c.round() as i32),
            ram_gb: inst["cpu_ram"].as_f64().map(|mb| (mb / 1024.0) as i32),
            storage_gb: inst["disk_space"].as_f64().map(|g| g as i32),
            gpu_util_percent: inst["gpu_util"].as_f64(),
            gpu_mem_util_percent: inst["mem_usage"].as_f64(),
        };

        Ok(RemoteStatus {
            status,
            endpoint,
            ssh,
            telemetry,
        })
    }

    async fn stop_instance(&self, remote_id: &str) -> Result<bool> {
        self.put_instance_state(remote_id, "stopped").await
    }

    async fn start_instance(&self, remote_id: &str) -> Result<bool> {
        self.put_instance_state(remote_id, "running").await
    }

    async fn restart_instance(&self, remote_id: &str) -> Result<bool> {
        let url = format!("{}/instances/reboot/{}/", API_BASE, remote_id);
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({}))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "Vast reboot failed for {}: {} - {}",
                remote_id,
                status,
                text
            ));
        }
        Ok(true)
    }

    async fn delete_instance(&self, remote_id: &str) -> Result<bool> {
        let url = format!("{}/instances/{}/", API_BASE, remote_id);
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        match resp.status().as_u16() {
            200 | 202 | 204 | 404 => Ok(true),
            _ => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                Err(anyhow::anyhow!("Vast delete failed: {} - {}", status, text))
            }
        }
    }

    async fn get_price(&self, gpu_type: &str) -> Result<Option<f64>> {
        let Some(native) = self.map_gpu_type(gpu_type) else {
            return Ok(None);
        };
        let raw = self.fetch_availability_raw(&native).await?;
        let availability = self.parse_availability(&raw, &native)?;
        Ok(availability.price_per_hour)
    }

    fn map_gpu_type(&self, gpu_type: &str) -> Option<String> {
        lookup_gpu_type(GPU_TYPES, gpu_type)
    }

    async fn fetch_availability_raw(&self, native_gpu_type: &str) -> Result<serde_json::Value> {
        self.search_offers(native_gpu_type).await
    }

    fn parse_availability(
        &self,
        raw: &serde_json::Value,
        native_gpu_type: &str,
    ) -> Result<GpuAvailability> {
        let offers = raw["offers"].as_array().cloned().unwrap_or_default();
        let mut price: Option<f64> = None;
        let mut regions: Vec<String> = Vec::new();

        for o in &offers {
            if let Some(p) = o["dph_total"].as_f64().filter(|p| *p > 0.0) {
                price = Some(match price {
                    Some(best) if best <= p => best,
                    _ => p,
                });
            }
            if let Some(geo) = o["geolocation"].as_str() {
                let geo = geo.trim();
                if !geo.is_empty() && !regions.iter().any(|r| r == geo) {
                    regions.push(geo.to_string());
                }
            }
        }

        Ok(GpuAvailability {
            gpu_type: native_gpu_type.to_string(),
            available: !offers.is_empty(),
            count: offers.len() as u32,
            price_per_hour: price,
            regions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_generic_and_native_gpu_spellings() {
        let p = VastProvider::new("test".to_string());
        assert_eq!(p.map_gpu_type("RTX 4090").as_deref(), Some("RTX 4090"));
        assert_eq!(
            p.map_gpu_type("NVIDIA GeForce RTX 4090").as_deref(),
            Some("RTX 4090")
        );
        assert_eq!(p.map_gpu_type("H100").as_deref(), Some("H100 SXM"));
        assert_eq!(p.map_gpu_type("MI300X"), None);
    }

    #[test]
    fn parses_offers_into_availability() {
        let p = VastProvider::new("test".to_string());
        let raw = json!({
            "offers": [
                { "id": 1, "dph_total": 0.42, "num_gpus": 1, "geolocation": "US" },
                { "id": 2, "dph_total": 0.38, "num_gpus": 1, "geolocation": "NL" },
                { "id": 3, "dph_total": 0.55, "num_gpus": 2, "geolocation": "US" },
            ]
        });
        let a = p.parse_availability(&raw, "RTX 4090").unwrap();
        assert!(a.available);
        assert_eq!(a.count, 3);
        assert_eq!(a.price_per_hour, Some(0.38));
        assert_eq!(a.regions, vec!["US".to_string(), "NL".to_string()]);
    }

    #[test]
    fn empty_offers_mean_unavailable_with_unknown_price() {
        let p = VastProvider::new("test".to_string());
        let a = p
            .parse_availability(&json!({ "offers": [] }), "L40S")
            .unwrap();
        assert!(!a.available);
        // Unknown, not zero: callers must exclude this from comparisons.
        assert_eq!(a.price_per_hour, None);
    }

    #[test]
    fn actual_status_mapping_covers_lifecycle() {
        assert_eq!(
            VastProvider::map_actual_status("running"),
            InstanceStatus::Running
        );
        assert_eq!(
            VastProvider::map_actual_status("stopped"),
            InstanceStatus::Stopped
        );
        assert_eq!(
            VastProvider::map_actual_status("loading"),
            InstanceStatus::Creating
        );
    }
}
