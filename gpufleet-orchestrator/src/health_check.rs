//! HTTP health probing of running instances.
//!
//! One probe per Running instance with an endpoint per cycle, bounded
//! fan-out, and exactly one appended record per probe regardless of outcome.

use chrono::{Duration as ChronoDuration, Utc};
use futures_util::stream::{self, StreamExt};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use gpufleet_common::{HealthCheckRecord, HealthStatus, InstanceStatus};

use crate::config;
use crate::store::SharedStore;

/// Concurrent in-flight probes per cycle.
const PROBE_CONCURRENCY: usize = 8;

pub struct HealthChecker {
    store: SharedStore,
    client: reqwest::Client,
}

impl HealthChecker {
    pub fn new(store: SharedStore) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { store, client })
    }

    pub async fn run_checks(&self) {
        let instances = self
            .store
            .list_instances_by_status(InstanceStatus::Running)
            .await;

        let probes = instances
            .into_iter()
            .filter_map(|i| i.endpoint.clone().map(|e| (i.id, e)));

        let mut results = stream::iter(probes)
            .map(|(id, endpoint)| {
                let client = self.client.clone();
                async move { probe_endpoint(&client, id, &endpoint).await }
            })
            .buffer_unordered(PROBE_CONCURRENCY);

        while let Some(record) = results.next().await {
            if !record.status.is_healthy() {
                warn!(instance_id = %record.instance_id, status = ?record.status,
                    detail = record.detail.as_deref().unwrap_or(""), "health probe not healthy");
            }
            self.store.insert_health_record(record).await;
        }
    }

    /// Healthy probes over total probes in the trailing window, as a
    /// percentage. No records means 0, never an optimistic 100.
    pub async fn uptime_percentage(&self, instance_id: Uuid, window_hours: i64) -> f64 {
        let since = Utc::now() - ChronoDuration::hours(window_hours);
        let records = self
            .store
            .health_records_for(instance_id, Some(since))
            .await;
        if records.is_empty() {
            return 0.0;
        }
        let healthy = records.iter().filter(|r| r.status.is_healthy()).count();
        healthy as f64 / records.len() as f64 * 100.0
    }
}

/// Total classification: every probe outcome maps to exactly one status.
async fn probe_endpoint(
    client: &reqwest::Client,
    instance_id: Uuid,
    endpoint: &str,
) -> HealthCheckRecord {
    let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    };

    let started = Instant::now();
    let result = client
        .get(&url)
        .timeout(config::health_check_timeout())
        .send()
        .await;
    let elapsed_ms = started.elapsed().as_millis() as i64;

    let (status, detail) = match result {
        Ok(resp) if resp.status().is_success() => {
            debug!(%instance_id, elapsed_ms, "health probe ok");
            (HealthStatus::Healthy, None)
        }
        Ok(resp) => (
            HealthStatus::Unhealthy,
            Some(format!("HTTP {}", resp.status().as_u16())),
        ),
        Err(e) if e.is_timeout() => (HealthStatus::Timeout, Some("request timed out".to_string())),
        Err(e) => (HealthStatus::Error, Some(e.to_string())),
    };

    HealthCheckRecord {
        id: Uuid::new_v4(),
        instance_id,
        status,
        response_time_ms: Some(elapsed_ms),
        endpoint: url,
        detail,
        checked_at: Utc::now(),
    }
}
