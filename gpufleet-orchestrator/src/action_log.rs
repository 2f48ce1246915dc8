//! Automation audit trail: start/complete pairs with wall-clock duration.

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use gpufleet_common::ActionLogEntry;

use crate::store::Store;

pub const STATUS_IN_PROGRESS: &str = "in_progress";
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

/// Opens an `in_progress` entry and returns its id for completion.
pub async fn log_action_start(
    store: &Store,
    action_type: &str,
    instance_id: Option<Uuid>,
    metadata: Option<Value>,
) -> Uuid {
    let entry = ActionLogEntry {
        id: Uuid::new_v4(),
        action_type: action_type.to_string(),
        status: STATUS_IN_PROGRESS.to_string(),
        instance_id,
        error_message: None,
        metadata,
        duration_ms: None,
        created_at: Utc::now(),
        completed_at: None,
    };
    let id = entry.id;
    store.insert_action_log(entry).await;
    id
}

pub async fn log_action_success(store: &Store, log_id: Uuid) {
    store.complete_action_log(log_id, STATUS_SUCCESS, None).await;
}

pub async fn log_action_failure(store: &Store, log_id: Uuid, error: &str) {
    store
        .complete_action_log(log_id, STATUS_FAILED, Some(error.to_string()))
        .await;
}
