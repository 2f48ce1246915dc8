//! Cross-provider instance migration.
//!
//! A migration runs validate, create, deploy, verify, cleanup in order.
//! Nothing touches the source instance until verify has proven the
//! replacement is running, so a failed migration leaves the workload exactly
//! where it was. Rollback is compensation over a failed task, not
//! cancellation of a running one.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use gpufleet_common::rules::{parse_config, MigrateActionConfig, MigrateTriggerConfig};
use gpufleet_common::{
    ActionType, DomainError, Instance, InstanceStatus, MigrationStatus, MigrationStep,
    MigrationStepLog, MigrationTask, ProviderKind, RuleTarget,
};
use gpufleet_providers::CreateInstanceRequest;

use crate::action_log::{log_action_failure, log_action_start, log_action_success};
use crate::config;
use crate::locks::InstanceLocks;
use crate::provider_manager::ProviderRegistry;
use crate::store::SharedStore;

pub struct MigrationManager {
    store: SharedStore,
    registry: Arc<ProviderRegistry>,
    locks: Arc<InstanceLocks>,
    verify_timeout: Duration,
    verify_poll_interval: Duration,
}

impl MigrationManager {
    pub fn new(store: SharedStore, registry: Arc<ProviderRegistry>, locks: Arc<InstanceLocks>) -> Self {
        Self {
            store,
            registry,
            locks,
            verify_timeout: config::migration_verify_timeout(),
            verify_poll_interval: Duration::from_secs(5),
        }
    }

    /// Shorter verify loop for tests.
    pub fn with_verify_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.verify_timeout = timeout;
        self.verify_poll_interval = poll_interval;
        self
    }

    pub async fn migrate(
        &self,
        source_instance_id: Uuid,
        target_provider: ProviderKind,
        target_config: serde_json::Value,
    ) -> anyhow::Result<MigrationTask> {
        let task = MigrationTask::new(source_instance_id, target_provider, target_config.clone());
        let task_id = task.id;
        self.store.insert_migration(task).await;

        let log_id = log_action_start(
            &self.store,
            "migration",
            Some(source_instance_id),
            Some(json!({ "target_provider": target_provider.as_str() })),
        )
        .await;

        match self.run_migration(task_id, source_instance_id, target_provider).await {
            Ok(()) => {
                log_action_success(&self.store, log_id).await;
                let task = self
                    .store
                    .update_migration(task_id, |t| t.status = MigrationStatus::Completed)
                    .await?;
                info!(%task_id, %source_instance_id, "migration completed");
                Ok(task)
            }
            Err(e) => {
                log_action_failure(&self.store, log_id, &e.to_string()).await;
                let task = self
                    .store
                    .update_migration(task_id, |t| {
                        t.status = MigrationStatus::Failed;
                        t.error_message = Some(e.to_string());
                    })
                    .await?;
                warn!(%task_id, %source_instance_id, error = %e, "migration failed");
                Ok(task)
            }
        }
    }

    async fn complete_step(&self, task_id: Uuid, step: MigrationStep) -> anyhow::Result<()> {
        self.store
            .update_migration(task_id, |t| {
                t.steps.push(MigrationStepLog {
                    step,
                    completed_at: Utc::now(),
                });
            })
            .await?;
        Ok(())
    }

    async fn run_migration(
        &self,
        task_id: Uuid,
        source_instance_id: Uuid,
        target_provider: ProviderKind,
    ) -> anyhow::Result<()> {
        self.store
            .update_migration(task_id, |t| t.status = MigrationStatus::InProgress)
            .await?;

        // Validate.
        let source = self
            .store
            .get_instance(source_instance_id)
            .await
            .ok_or(DomainError::InstanceNotFound(source_instance_id))?;
        if source.status.is_terminal() {
            anyhow::bail!("source instance {} is deleted", source_instance_id);
        }
        if !target_provider.is_concrete() {
            return Err(DomainError::ProviderNotConcrete(target_provider).into());
        }
        let adapter = self.registry.get_adapter(target_provider, None).await?;
        self.complete_step(task_id, MigrationStep::Validate).await?;

        // Create the replacement on the target provider.
        let task = self
            .store
            .get_migration(task_id)
            .await
            .ok_or(DomainError::MigrationNotFound(task_id))?;
        let overrides: MigrateActionConfig = parse_config(&task.target_config);
        let gpu_type = overrides.gpu_type.unwrap_or_else(|| source.gpu_type.clone());
        let image = overrides.image.unwrap_or_else(|| source.image.clone());

        let mut target = Instance::new(
            source.owner_id,
            target_provider,
            &gpu_type,
            source.gpu_count,
            &image,
        );
        let created = adapter
            .create_instance(&CreateInstanceRequest {
                instance_id: target.id,
                gpu_type: gpu_type.clone(),
                gpu_count: source.gpu_count,
                image,
                env: vec![],
            })
            .await?;
        target.remote_id = Some(created.remote_id.clone());
        self.complete_step(task_id, MigrationStep::Create).await?;

        // Deploy: the replacement becomes a tracked record.
        let target_id = target.id;
        self.store.insert_instance(target).await;
        self.store
            .update_migration(task_id, |t| t.target_instance_id = Some(target_id))
            .await?;
        self.complete_step(task_id, MigrationStep::Deploy).await?;

        // Verify: the replacement must reach Running before the source is
        // touched.
        self.verify_running(&created.remote_id, target_id, target_provider)
            .await?;
        self.complete_step(task_id, MigrationStep::Verify).await?;

        // Cleanup: stop the source. A stop failure is logged, not fatal;
        // the workload is already served by the replacement.
        if let Err(e) = self.stop_source(&source).await {
            warn!(instance_id = %source.id, error = %e,
                "source stop failed during migration cleanup");
        }
        self.complete_step(task_id, MigrationStep::Cleanup).await?;
        Ok(())
    }

    async fn verify_running(
        &self,
        remote_id: &str,
        target_instance_id: Uuid,
        provider: ProviderKind,
    ) -> anyhow::Result<()> {
        let adapter = self.registry.get_adapter(provider, None).await?;
        let deadline = tokio::time::Instant::now() + self.verify_timeout;

        loop {
            match adapter.get_status(remote_id).await {
                Ok(remote) if remote.status == InstanceStatus::Running => {
                    self.store
                        .update_instance(target_instance_id, |i| {
                            crate::state_machine::merge_remote_status(i, &remote);
                        })
                        .await?;
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(remote_id, error = %e, "verify status probe failed, will retry");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "replacement instance {} did not reach running within {:?}",
                    remote_id,
                    self.verify_timeout
                );
            }
            sleep(self.verify_poll_interval).await;
        }
    }

    async fn stop_source(&self, source: &Instance) -> anyhow::Result<()> {
        let Some(remote_id) = source.remote_id.as_deref() else {
            return Ok(());
        };
        let lock = self.locks.lock_for(source.id).await;
        let _guard = lock.lock().await;

        let adapter = self
            .registry
            .get_adapter(source.provider, source.api_credential.as_deref())
            .await?;
        adapter.stop_instance(remote_id).await?;
        self.store
            .update_instance(source.id, |i| {
                if crate::state_machine::can_transition(i.status, InstanceStatus::Stopped) {
                    i.status = InstanceStatus::Stopped;
                }
            })
            .await?;
        Ok(())
    }

    /// Compensation for a failed migration: bring the source back up and
    /// tear the half-built replacement down. Only Failed tasks are eligible.
    pub async fn rollback(&self, task_id: Uuid) -> anyhow::Result<MigrationTask> {
        let task = self
            .store
            .get_migration(task_id)
            .await
            .ok_or(DomainError::MigrationNotFound(task_id))?;
        if task.status != MigrationStatus::Failed {
            return Err(DomainError::RollbackNotAllowed {
                id: task_id,
                status: task.status,
            }
            .into());
        }

        let log_id = log_action_start(
            &self.store,
            "migration_rollback",
            Some(task.source_instance_id),
            None,
        )
        .await;

        // Restore the source first; it matters more than the cleanup.
        if let Some(source) = self.store.get_instance(task.source_instance_id).await {
            if source.status == InstanceStatus::Stopped {
                if let Err(e) = self.start_source(&source).await {
                    warn!(instance_id = %source.id, error = %e, "source restart during rollback failed");
                }
            }
        }

        // Best-effort teardown of the replacement.
        if let Some(target_id) = task.target_instance_id {
            if let Some(target) = self.store.get_instance(target_id).await {
                if let Some(remote_id) = target.remote_id.as_deref() {
                    if let Ok(adapter) = self.registry.get_adapter(target.provider, None).await {
                        if let Err(e) = adapter.delete_instance(remote_id).await {
                            warn!(instance_id = %target_id, error = %e,
                                "replacement delete during rollback failed");
                        }
                    }
                }
                let _ = self.store.soft_delete_instance(target_id).await;
            }
        }

        log_action_success(&self.store, log_id).await;
        let task = self
            .store
            .update_migration(task_id, |t| t.status = MigrationStatus::RolledBack)
            .await?;
        info!(%task_id, "migration rolled back");
        Ok(task)
    }

    async fn start_source(&self, source: &Instance) -> anyhow::Result<()> {
        let Some(remote_id) = source.remote_id.as_deref() else {
            return Ok(());
        };
        let lock = self.locks.lock_for(source.id).await;
        let _guard = lock.lock().await;

        let adapter = self
            .registry
            .get_adapter(source.provider, source.api_credential.as_deref())
            .await?;
        adapter.start_instance(remote_id).await?;
        self.store
            .update_instance(source.id, |i| {
                if crate::state_machine::can_transition(i.status, InstanceStatus::Running) {
                    i.status = InstanceStatus::Running;
                }
            })
            .await?;
        Ok(())
    }

    /// Periodic sweep over Migrate-action rules: a running instance whose
    /// current hourly price exceeds the rule's ceiling is migrated to the
    /// rule's target provider.
    pub async fn check_migration_triggers(&self) {
        let rules = self.store.list_enabled_rules_v2().await;
        for rule in rules {
            if rule.action != ActionType::Migrate {
                continue;
            }
            let trigger: MigrateTriggerConfig = parse_config(&rule.trigger_config);
            let action: MigrateActionConfig = parse_config(&rule.action_config);
            let (Some(ceiling), Some(target_provider)) =
                (trigger.max_hourly_price, action.target_provider)
            else {
                continue;
            };

            let instances = match rule.target {
                RuleTarget::Instance(id) => self.store.get_instance(id).await.into_iter().collect(),
                RuleTarget::Owner(owner_id) => {
                    let all = self.store.list_instances().await;
                    all.into_iter()
                        .filter(|i| i.owner_id == owner_id)
                        .collect::<Vec<_>>()
                }
            };

            for instance in instances {
                if instance.status != InstanceStatus::Running
                    || instance.provider == target_provider
                {
                    continue;
                }
                let Ok(adapter) = self
                    .registry
                    .get_adapter(instance.provider, instance.api_credential.as_deref())
                    .await
                else {
                    continue;
                };
                let Ok(Some(price)) = adapter.get_price(&instance.gpu_type).await else {
                    continue;
                };
                if price <= ceiling {
                    continue;
                }

                info!(instance_id = %instance.id, price, ceiling, target = %target_provider,
                    "price ceiling exceeded, triggering migration");
                if let Err(e) = self
                    .migrate(instance.id, target_provider, rule.action_config.clone())
                    .await
                {
                    warn!(instance_id = %instance.id, error = %e, "triggered migration failed to start");
                }
                let _ = self
                    .store
                    .update_rule_v2(rule.id, |r| {
                        r.last_triggered_at = Some(Utc::now());
                        r.trigger_count += 1;
                    })
                    .await;
            }
        }
    }
}
