//! Instance status transitions.
//!
//! Reconciliation and automation route every status change through
//! `can_transition` so a late or reordered provider observation can never
//! resurrect a deleted instance or skip a lifecycle edge.

use gpufleet_common::{Instance, InstanceStatus};
use gpufleet_providers::RemoteStatus;

/// Allowed edges. `Deleted` is terminal and only reachable through an
/// explicit delete action, never from a remote observation.
pub fn can_transition(from: InstanceStatus, to: InstanceStatus) -> bool {
    use InstanceStatus::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Creating, Running)
            | (Creating, Error)
            | (Running, Stopped)
            | (Running, Error)
            | (Running, Deleted)
            | (Stopped, Running)
            | (Stopped, Deleted)
            | (Error, Deleted)
    )
}

/// Merges a remote observation into the local record. Returns true when any
/// field changed. Telemetry merges field-by-field, only overwriting what the
/// provider actually reported. A remote `Deleted` maps to local `Error`
/// because the only path to `Deleted` is an explicit delete.
pub fn merge_remote_status(instance: &mut Instance, remote: &RemoteStatus) -> bool {
    let mut changed = false;

    let desired = match remote.status {
        InstanceStatus::Deleted => InstanceStatus::Error,
        other => other,
    };
    if desired != instance.status && can_transition(instance.status, desired) {
        instance.status = desired;
        if desired == InstanceStatus::Error && instance.error_message.is_none() {
            instance.error_message = Some("instance no longer exists on provider".to_string());
        }
        changed = true;
    }

    if remote.endpoint.is_some() && remote.endpoint != instance.endpoint {
        instance.endpoint = remote.endpoint.clone();
        changed = true;
    }
    if remote.ssh.is_some() && remote.ssh != instance.ssh {
        instance.ssh = remote.ssh.clone();
        changed = true;
    }

    macro_rules! merge_field {
        ($field:ident) => {
            if remote.telemetry.$field.is_some()
                && remote.telemetry.$field != instance.telemetry.$field
            {
                instance.telemetry.$field = remote.telemetry.$field;
                changed = true;
            }
        };
    }
    merge_field!(uptime_seconds);
    merge_field!(vcpu_count);
    merge_field!(ram_gb);
    merge_field!(storage_gb);
    merge_field!(gpu_util_percent);
    merge_field!(gpu_mem_util_percent);

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpufleet_common::{ProviderKind, SshInfo, Telemetry};
    use uuid::Uuid;

    fn instance(status: InstanceStatus) -> Instance {
        let mut i = Instance::new(
            Uuid::new_v4(),
            ProviderKind::Mock,
            "RTX 4090",
            1,
            "pytorch/pytorch:latest",
        );
        i.status = status;
        i
    }

    fn update(status: InstanceStatus) -> RemoteStatus {
        RemoteStatus {
            status,
            endpoint: None,
            ssh: None,
            telemetry: Telemetry::default(),
        }
    }

    #[test]
    fn deleted_is_terminal() {
        for to in [
            InstanceStatus::Creating,
            InstanceStatus::Running,
            InstanceStatus::Stopped,
            InstanceStatus::Error,
        ] {
            assert!(!can_transition(InstanceStatus::Deleted, to));
        }
    }

    #[test]
    fn creating_cannot_jump_to_stopped() {
        assert!(!can_transition(InstanceStatus::Creating, InstanceStatus::Stopped));
        assert!(!can_transition(InstanceStatus::Creating, InstanceStatus::Deleted));
    }

    #[test]
    fn stopped_recovers_to_running() {
        assert!(can_transition(InstanceStatus::Stopped, InstanceStatus::Running));
        assert!(!can_transition(InstanceStatus::Error, InstanceStatus::Running));
    }

    #[test]
    fn remote_deleted_maps_to_error() {
        let mut i = instance(InstanceStatus::Running);
        let changed = merge_remote_status(&mut i, &update(InstanceStatus::Deleted));
        assert!(changed);
        assert_eq!(i.status, InstanceStatus::Error);
        assert!(i.error_message.is_some());
    }

    #[test]
    fn merge_is_idempotent() {
        let mut i = instance(InstanceStatus::Creating);
        let remote = RemoteStatus {
            status: InstanceStatus::Running,
            endpoint: Some("10.0.0.1:8000".to_string()),
            ssh: Some(SshInfo {
                host: "10.0.0.1".to_string(),
                port: 22,
                user: "root".to_string(),
            }),
            telemetry: Telemetry {
                uptime_seconds: Some(60),
                ..Telemetry::default()
            },
        };
        assert!(merge_remote_status(&mut i, &remote));
        let snapshot = i.clone();
        assert!(!merge_remote_status(&mut i, &remote));
        assert_eq!(i.status, snapshot.status);
        assert_eq!(i.endpoint, snapshot.endpoint);
        assert_eq!(i.telemetry, snapshot.telemetry);
    }

    #[test]
    fn telemetry_none_fields_do_not_clobber() {
        let mut i = instance(InstanceStatus::Running);
        i.telemetry.ram_gb = Some(64);
        let remote = RemoteStatus {
            status: InstanceStatus::Running,
            endpoint: None,
            ssh: None,
            telemetry: Telemetry {
                uptime_seconds: Some(120),
                ..Telemetry::default()
            },
        };
        assert!(merge_remote_status(&mut i, &remote));
        assert_eq!(i.telemetry.ram_gb, Some(64));
        assert_eq!(i.telemetry.uptime_seconds, Some(120));
    }
}
