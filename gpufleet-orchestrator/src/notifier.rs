//! Owner notification contract.
//!
//! Delivery channels live outside this process; the orchestrator only knows
//! the contract and ships a tracing-backed implementation.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns per-channel delivery success.
    async fn send_notification(
        &self,
        owner_id: Uuid,
        event_type: &str,
        title: &str,
        message: &str,
    ) -> Result<HashMap<String, bool>>;
}

/// Writes notifications to the log stream. The default wiring for a process
/// with no delivery channels configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_notification(
        &self,
        owner_id: Uuid,
        event_type: &str,
        title: &str,
        message: &str,
    ) -> Result<HashMap<String, bool>> {
        info!(%owner_id, event_type, title, message, "notification");
        let mut channels = HashMap::new();
        channels.insert("log".to_string(), true);
        Ok(channels)
    }
}
