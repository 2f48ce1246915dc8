//! Per-instance advisory locks.
//!
//! Every provider start/stop/restart/delete issued by automation on the same
//! instance goes through the same lock, so competing jobs (auto-restart vs
//! cost-limit shutdown) serialize instead of racing the remote API.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct InstanceLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Handle for one instance; hold the returned guard across the provider
    /// call and the store update it implies.
    pub async fn lock_for(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
