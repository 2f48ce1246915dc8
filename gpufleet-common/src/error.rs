use thiserror::Error;
use uuid::Uuid;

use crate::{InstanceStatus, MigrationStatus, ProviderKind};

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("no adapter configured for provider '{0}'")]
    AdapterUnavailable(ProviderKind),

    #[error("provider '{0}' is abstract and must be resolved before use")]
    ProviderNotConcrete(ProviderKind),

    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("instance {0} has no remote id")]
    MissingRemoteId(Uuid),

    #[error("rule {0} not found")]
    RuleNotFound(Uuid),

    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error("migration task {id} cannot be rolled back from {status:?}")]
    RollbackNotAllowed { id: Uuid, status: MigrationStatus },

    #[error("migration task {0} not found")]
    MigrationNotFound(Uuid),
}
