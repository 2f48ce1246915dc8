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

const API_URL: &str = "https://api.runpod.io/graphql";

/// Generic <-> RunPod-native GPU type spellings. Input may use either.
const GPU_TYPES: &[(&str, &str)] = &[
    ("RTX 4090", "NVIDIA GeForce RTX 4090"),
    ("RTX 3090", "NVIDIA GeForce RTX 3090"),
    ("RTX A6000", "NVIDIA RTX A6000"),
    ("A100", "NVIDIA A100 80GB PCIe"),
    ("A100 SXM", "NVIDIA A100-SXM4-80GB"),
    ("H100", "NVIDIA H100 80GB HBM3"),
    ("L40S", "NVIDIA L40S"),
    ("L4", "NVIDIA L4"),
];

pub struct RunPodProvider {
    client: Client,
    api_key: String,
}

impl RunPodProvider {
    pub fn new(api_key: String) -> Self {
        // No overall timeout on the default client; a stalled RunPod call
        // would otherwise hang a scheduler job forever.
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

    async fn graphql(&self, query: &str, variables: serde_json::Value) -> Result<serde_json::Value> {
        let body = json!({ "query": query, "variables": variables });
        let resp = self
            .client
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("RunPod API error: {} - {}", status, text));
        }

        let v: serde_json::Value = resp.json().await?;
        if let Some(errors) = v.get("errors").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                let msg = errors[0]
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown GraphQL error");
                return Err(anyhow::anyhow!("RunPod GraphQL error: {}", msg));
            }
        }
        Ok(v["data"].clone())
    }

    fn map_desired_status(desired: &str) -> InstanceStatus {
        match desired.to_ascii_uppercase().as_str() {
            "RUNNING" => InstanceStatus::Running,
            "EXITED" | "STOPPED" => InstanceStatus::Stopped,
            "TERMINATED" | "DEAD" => InstanceStatus::Deleted,
            // CREATED / PENDING and anything unknown: still coming up.
            _ => InstanceStatus::Creating,
        }
    }
}

#[async_trait]
impl GpuProvider for RunPodProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::RunPod
    }

    async fn create_instance(&self, req: &CreateInstanceRequest) -> Result<CreatedInstance> {
        let native = self
            .map_gpu_type(&req.gpu_type)
            .ok_or_else(|| anyhow::anyhow!("RunPod does not offer GPU type '{}'", req.gpu_type))?;

        let env: Vec<serde_json::Value> = req
            .env
            .iter()
            .map(|(k, v)| json!({ "key": k, "value": v }))
            .collect();

        let query = r#"
            mutation Deploy($input: PodFindAndDeployOnDemandInput) {
                podFindAndDeployOnDemand(input: $input) {
                    id
                    desiredStatus
                }
            }"#;
        let variables = json!({
            "input": {
                "cloudType": "SECURE",
                "name": format!("gpufleet-{}", req.instance_id),
                "gpuTypeId": native,
                "gpuCount": req.gpu_count,
                "imageName": req.image,
                "env": env,
                "containerDiskInGb": 40,
                "volumeInGb": 0,
            }
        });

        let data = self.graphql(query, variables).await?;
        let pod = &data["podFindAndDeployOnDemand"];
        let remote_id = pod["id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("RunPod deploy response missing pod id"))?
            .to_string();
        let status = pod["desiredStatus"]
            .as_str()
            .map(Self::map_desired_status)
            .unwrap_or(InstanceStatus::Creating);

        Ok(CreatedInstance { remote_id, status })
    }

    async fn get_status(&self, remote_id: &str) -> Result<RemoteStatus> {
        let query = r#"
            query Pod($input: PodFilter) {
                pod(input: $input) {
                    id
                    desiredStatus
                    runtime {
                        uptimeInSeconds
                        ports { ip isIpPublic privatePort publicPort type }
                        gpus { gpuUtilPercent memoryUtilPercent }
                        container { cpuPercent memoryPercent }
                    }
                    machine { podHostId }
                }
            }"#;
        let data = self
            .graphql(query, json!({ "input": { "podId": remote_id } }))
            .await?;

        let pod = &data["pod"];
        if pod.is_null() {
            // Pod no longer exists on the provider.
            return Ok(RemoteStatus {
                status: InstanceStatus::Deleted,
                endpoint: None,
                ssh: None,
                telemetry: Telemetry::default(),
            });
        }

        let status = pod["desiredStatus"]
            .as_str()
            .map(Self::map_desired_status)
            .unwrap_or(InstanceStatus::Creating);

        let mut endpoint = None;
        let mut ssh = None;
        if let Some(ports) = pod["runtime"]["ports"].as_array() {
            for p in ports {
                let public = p["isIpPublic"].as_bool().unwrap_or(false);
                let ip = p["ip"].as_str().unwrap_or_default();
                if !public || ip.is_empty() {
                    continue;
                }
                let private = p["privatePort"].as_i64().unwrap_or(0);
                let public_port = p["publicPort"].as_i64().unwrap_or(0);
                if private == 22 {
                    ssh = Some(SshInfo {
                        host: ip.to_string(),
                        port: public_port as u16,
                        user: "root".to_string(),
                    });
                } else if endpoint.is_none() && public_port > 0 {
                    endpoint = Some(format!("{}:{}", ip, public_port));
                }
            }
        }

        let mut telemetry = Telemetry {
            uptime_seconds: pod["runtime"]["uptimeInSeconds"].as_i64(),
            ..Telemetry::default()
        };
        if let Some(gpus) = pod["runtime"]["gpus"].as_array() {
            if let Some(g) = gpus.first() {
                telemetry.gpu_util_percent = g["gpuUtilPercent"].as_f64();
                telemetry.gpu_mem_util_percent = g["memoryUtilPercent"].as_f64();
            }
        }

        Ok(RemoteStatus {
            status,
            endpoint,
            ssh,
            telemetry,
        })
    }

    async fn stop_instance(&self, remote_id: &str) -> Result<bool> {
        let query = r#"
            mutation Stop($input: PodStopInput!) {
                podStop(input: $input) { id desiredStatus }
            }"#;
        let data = self
            .graphql(query, json!({ "input": { "podId": remote_id } }))
            .await?;
        Ok(!data["podStop"].is_null())
    }

    async fn start_instance(&self, remote_id: &str) -> Result<bool> {
        let query = r#"
            mutation Resume($input: PodResumeInput!) {
                podResume(input: $input) { id desiredStatus }
            }"#;
        let data = self
            .graphql(query, json!({ "input": { "podId": remote_id } }))
            .await?;
        Ok(!data["podResume"].is_null())
    }

    async fn restart_instance(&self, remote_id: &str) -> Result<bool> {
        // RunPod exposes no single restart mutation; stop then resume.
        self.stop_instance(remote_id).await?;
        self.start_instance(remote_id).await
    }

    async fn delete_instance(&self, remote_id: &str) -> Result<bool> {
        let query = r#"
            mutation Terminate($input: PodTerminateInput!) {
                podTerminate(input: $input)
            }"#;
        match self
            .graphql(query, json!({ "input": { "podId": remote_id } }))
            .await
        {
            Ok(_) => Ok(true),
            // Terminating an already-gone pod is success for our purposes.
            Err(e) if e.to_string().contains("not found") => Ok(true),
            Err(e) => Err(e),
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
        let query = r#"
            query GpuTypes($input: GpuTypeFilter) {
                gpuTypes(input: $input) {
                    id
                    displayName
                    memoryInGb
                    securePrice
                    communityPrice
                    lowestPrice(input: { gpuCount: 1 }) {
                        stockStatus
                        uninterruptablePrice
                    }
                }
            }"#;
        self.graphql(query, json!({ "input": { "id": native_gpu_type } }))
            .await
    }

    fn parse_availability(
        &self,
        raw: &serde_json::Value,
        native_gpu_type: &str,
    ) -> Result<GpuAvailability> {
        let Some(entry) = raw["gpuTypes"]
            .as_array()
            .and_then(|types| {
                types
                    .iter()
                    .find(|t| t["id"].as_str() == Some(native_gpu_type))
            })
        else {
            return Ok(GpuAvailability::unavailable(native_gpu_type));
        };

        let stock = entry["lowestPrice"]["stockStatus"]
            .as_str()
            .unwrap_or_default();
        let price = entry["lowestPrice"]["uninterruptablePrice"]
            .as_f64()
            .or_else(|| entry["securePrice"].as_f64())
            .or_else(|| entry["communityPrice"].as_f64())
            .filter(|p| *p > 0.0);

        let available = !stock.eq_ignore_ascii_case("unavailable") && price.is_some();
        let count = match stock.to_ascii_lowercase().as_str() {
            "high" => 10,
            "medium" => 5,
            "low" => 1,
            _ if available => 1,
            _ => 0,
        };

        Ok(GpuAvailability {
            gpu_type: native_gpu_type.to_string(),
            available,
            count,
            price_per_hour: price,
            regions: Vec::new(),
        })
    }
}
