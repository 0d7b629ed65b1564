//! Per-project lock coordination
//!
//! `LockSession` owns the canonical [`LockStore`] for one project and is the
//! only mutation path into it. Every mutation holds the session's write
//! gate for its whole duration, so two lock operations on the same project
//! never interleave even when callers race.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::bulk::{BulkOperationCoordinator, BulkPreparation};
use super::detector::{CheckFailurePolicy, ConflictDetector};
use super::event::ProjectUpdate;
use super::resolver::{ConflictResolver, ResolutionOutcome, ResolutionPlan};
use super::store::{LockStore, StoreChange};
use super::types::{
    AuditEntry, BulkLockOperation, ComponentLock, ConflictCheck, LockConflict, LockLevel,
    LockOperation, LockType,
};
use crate::api::LockApi;
use crate::channel::{ChannelEvent, Subscription};
use crate::config::Config;
use crate::error::{Error, Result};

/// Result of submitting a lock operation
#[derive(Debug, Clone)]
pub enum Submission {
    /// The operation was applied; these components changed
    Applied { component_ids: Vec<String> },
    /// Conflicts were found; nothing was sent
    NeedsResolution(ConflictResolver),
}

impl Submission {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[derive(Debug)]
pub struct LockSession {
    project_id: String,
    user_id: String,
    api: LockApi,
    coordinator: BulkOperationCoordinator,
    store: Arc<RwLock<LockStore>>,
    write_gate: Mutex<()>,
}

impl LockSession {
    pub fn new(api: LockApi, project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let detector = ConflictDetector::new(api.clone());
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
            coordinator: BulkOperationCoordinator::new(api.clone(), detector),
            api,
            store: Arc::new(RwLock::new(LockStore::new())),
            write_gate: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config, project_id: impl Into<String>) -> Result<Self> {
        Ok(Self::new(
            LockApi::from_config(config)?,
            project_id,
            config.api.user_id.clone(),
        ))
    }

    /// Block operations when the conflict pre-check cannot be performed
    pub fn fail_closed(self) -> Self {
        self.with_check_policy(CheckFailurePolicy::FailClosed)
    }

    pub fn with_check_policy(mut self, policy: CheckFailurePolicy) -> Self {
        let detector = ConflictDetector::new(self.api.clone()).with_policy(policy);
        self.coordinator = BulkOperationCoordinator::new(self.api.clone(), detector);
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn api(&self) -> &LockApi {
        &self.api
    }

    /// Shared read handle to the lock state
    pub fn store(&self) -> Arc<RwLock<LockStore>> {
        self.store.clone()
    }

    pub async fn snapshot(&self) -> LockStore {
        self.store.read().await.clone()
    }

    pub async fn lock_for(&self, component_id: &str) -> Option<ComponentLock> {
        self.store.read().await.get(component_id).cloned()
    }

    /// Whether a mutation is currently in flight
    pub fn is_busy(&self) -> bool {
        self.write_gate.try_lock().is_err()
    }

    /// Re-fetch all locks from the backend, bypassing the cache
    pub async fn refresh(&self) -> Result<usize> {
        let locks_path = format!("/projects/{}/locks", self.project_id);
        self.api.invalidate_cache(Some(locks_path.as_str()));
        let locks = self.api.fetch_locks(&self.project_id).await?;
        let count = self.store.write().await.replace_all(locks);
        debug!(project_id = %self.project_id, count, "Lock state refreshed");
        Ok(count)
    }

    /// Run the conflict pre-check and record the conflicts found
    pub async fn check(&self, operation: &LockOperation) -> Result<ConflictCheck> {
        let check = self
            .coordinator
            .detector()
            .check(&self.project_id, operation)
            .await?;
        self.store
            .write()
            .await
            .set_conflicts(check.conflicts.clone());
        Ok(check)
    }

    /// Lock one component for the session user
    pub async fn lock_component(
        &self,
        component_id: &str,
        level: LockLevel,
        lock_type: LockType,
        reason: &str,
    ) -> Result<Submission> {
        if reason.trim().is_empty() {
            return Err(Error::Validation("a reason is required to lock a component".to_string()));
        }
        let _gate = self.write_gate.lock().await;

        let operation = LockOperation::Lock {
            component_ids: [component_id.to_string()].into_iter().collect(),
            level,
            lock_type: Some(lock_type),
            reason: reason.to_string(),
        };
        let check = self.check(&operation).await?;
        if check.has_conflicts || !check.can_proceed {
            return Ok(Submission::NeedsResolution(ConflictResolver::new(
                operation,
                check.conflicts,
            )));
        }

        let lock = ComponentLock::new(component_id, level, lock_type, reason, self.user_id.as_str());
        self.api
            .update_lock(&self.project_id, component_id, &lock)
            .await?;
        self.store.write().await.upsert(lock);
        Ok(Submission::Applied {
            component_ids: vec![component_id.to_string()],
        })
    }

    pub async fn unlock(
        &self,
        component_ids: impl IntoIterator<Item = impl Into<String>>,
        reason: &str,
    ) -> Result<Submission> {
        self.submit(LockOperation::Unlock {
            component_ids: component_ids.into_iter().map(Into::into).collect(),
            reason: reason.to_string(),
        })
        .await
    }

    pub async fn change_level(
        &self,
        component_ids: impl IntoIterator<Item = impl Into<String>>,
        level: LockLevel,
        reason: &str,
    ) -> Result<Submission> {
        self.submit(LockOperation::ChangeLevel {
            component_ids: component_ids.into_iter().map(Into::into).collect(),
            level,
            reason: reason.to_string(),
        })
        .await
    }

    pub async fn submit_bulk(&self, operation: BulkLockOperation) -> Result<Submission> {
        self.submit(LockOperation::Bulk {
            operations: vec![operation],
        })
        .await
    }

    /// Pre-check an operation and apply it if it has no conflicts
    pub async fn submit(&self, operation: LockOperation) -> Result<Submission> {
        let _gate = self.write_gate.lock().await;

        match self.coordinator.prepare(&self.project_id, operation).await? {
            BulkPreparation::Ready(operation) => {
                let operations = operation.to_bulk();
                let outcome = self
                    .coordinator
                    .submit(&self.project_id, operations.clone())
                    .await?;
                self.mirror(&operations).await;
                Ok(Submission::Applied {
                    component_ids: outcome.affected_components,
                })
            }
            BulkPreparation::NeedsResolution(resolver) => {
                self.store
                    .write()
                    .await
                    .set_conflicts(resolver.conflicts().to_vec());
                Ok(Submission::NeedsResolution(resolver))
            }
        }
    }

    /// Confirm the resolver's resolutions and apply the filtered operation.
    ///
    /// On failure the resolver returns to its resolvable state.
    pub async fn apply_resolution(&self, resolver: &mut ConflictResolver) -> Result<ResolutionOutcome> {
        if resolver.is_resolving() {
            return Err(Error::ResolutionInProgress);
        }
        let _gate = self.write_gate.lock().await;

        let outcome = resolver
            .confirm(|plan| async move { self.execute(plan).await })
            .await?;
        self.store.write().await.clear_conflicts();
        Ok(outcome)
    }

    /// Abandon a resolution cycle
    pub async fn cancel_resolution(&self, resolver: &mut ConflictResolver) -> ResolutionOutcome {
        self.store.write().await.clear_conflicts();
        resolver.cancel()
    }

    /// Fold a push update into the store; bulk broadcasts trigger a refresh
    pub async fn apply_push(&self, update: ProjectUpdate) -> StoreChange {
        if update.project_id != self.project_id {
            debug!(
                project_id = %self.project_id,
                update_project = %update.project_id,
                "Ignoring update for another project"
            );
            return StoreChange::Unchanged;
        }

        let change = self.store.write().await.apply(update.update);
        if let StoreChange::NeedsRefresh { component_ids } = &change {
            debug!(affected = component_ids.len(), "Bulk change announced, refreshing");
            if let Err(e) = self.refresh().await {
                warn!(project_id = %self.project_id, error = %e, "Refresh after bulk change failed");
            }
        }
        change
    }

    /// Fold every lock update from `subscription` into the store.
    ///
    /// Malformed updates are logged and skipped. State is re-fetched whenever
    /// the channel reopens after an interruption, since pushes sent while it
    /// was down are lost. Returns `Ok` when the subscription is closed or
    /// `on_change` breaks, and a channel error once reconnection gives up.
    pub async fn follow<F>(&self, subscription: &mut Subscription, mut on_change: F) -> Result<()>
    where
        F: FnMut(&StoreChange) -> ControlFlow<()>,
    {
        let mut interrupted = false;

        while let Some(event) = subscription.recv().await {
            match event {
                ChannelEvent::Opened => {
                    if std::mem::take(&mut interrupted)
                        && let Err(e) = self.refresh().await
                    {
                        warn!(project_id = %self.project_id, error = %e, "Refresh after reconnect failed");
                    }
                }
                ChannelEvent::Message(value) => match ProjectUpdate::from_message(&value) {
                    Ok(Some(update)) => {
                        let change = self.apply_push(update).await;
                        if on_change(&change).is_break() {
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(project_id = %self.project_id, error = %e, "Skipping malformed lock update");
                    }
                },
                ChannelEvent::Interrupted { reason } => {
                    debug!(project_id = %self.project_id, reason = %reason, "Lock updates interrupted");
                    interrupted = true;
                }
                ChannelEvent::MaxReconnectAttemptsReached { attempts } => {
                    self.store.write().await.mark_stale();
                    return Err(Error::Channel(format!(
                        "connection lost after {} reconnect attempts",
                        attempts
                    )));
                }
            }
        }
        Ok(())
    }

    pub async fn audit_trail(&self) -> Vec<AuditEntry> {
        self.api.get_audit_trail(&self.project_id).await
    }

    /// Conflicts recorded server-side for this project
    pub async fn server_conflicts(&self) -> Vec<LockConflict> {
        self.api.get_conflicts(&self.project_id).await
    }

    async fn execute(&self, plan: ResolutionPlan) -> Result<()> {
        self.coordinator
            .execute_plan(&self.project_id, &plan)
            .await?;

        let mut store = self.store.write().await;
        for component_id in &plan.unlock_first {
            store.remove(component_id);
        }
        for op in plan.operation.to_bulk() {
            store.apply_bulk(&op, &self.user_id);
        }
        info!(
            project_id = %self.project_id,
            skipped = plan.skipped.len(),
            "Resolved operation applied"
        );
        Ok(())
    }

    async fn mirror(&self, operations: &[BulkLockOperation]) {
        let mut store = self.store.write().await;
        for op in operations {
            store.apply_bulk(op, &self.user_id);
        }
    }
}
