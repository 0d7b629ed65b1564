//! Conflict pre-check before a lock operation is applied

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::store::LockStore;
use super::types::{ConflictCheck, ConflictKind, ConflictPriority, LockConflict, LockOperation};
use crate::api::LockApi;
use crate::error::Result;

/// What to do when the pre-check itself cannot be performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckFailurePolicy {
    /// Proceed as if there were no conflicts; the result is flagged `degraded`
    #[default]
    FailOpen,
    /// Propagate the failure and block the operation
    FailClosed,
}

/// Asks the backend which components of an operation conflict with recorded locks
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    api: LockApi,
    policy: CheckFailurePolicy,
}

impl ConflictDetector {
    pub fn new(api: LockApi) -> Self {
        Self {
            api,
            policy: CheckFailurePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: CheckFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> CheckFailurePolicy {
        self.policy
    }

    /// Run the pre-check for `operation`
    pub async fn check(&self, project_id: &str, operation: &LockOperation) -> Result<ConflictCheck> {
        if operation.is_empty() {
            return Ok(ConflictCheck::clear());
        }

        match self.api.try_check_conflicts(project_id, operation).await {
            Ok(check) => {
                debug!(
                    project_id = %project_id,
                    conflicts = check.conflicts.len(),
                    can_proceed = check.can_proceed,
                    "Conflict check completed"
                );
                Ok(check)
            }
            Err(e) if self.policy == CheckFailurePolicy::FailOpen => {
                warn!(
                    project_id = %project_id,
                    error = %e,
                    "Conflict check failed; failing open"
                );
                Ok(ConflictCheck::degraded())
            }
            Err(e) => Err(e),
        }
    }
}

/// Conflicts an operation would hit against a local snapshot.
///
/// Mirrors the backend rule: any existing lock on a targeted component is a
/// conflict. Locks `user` cannot override rank high.
pub fn local_conflicts(store: &LockStore, operation: &LockOperation, user: &str) -> Vec<LockConflict> {
    let now = Utc::now();
    operation
        .component_ids()
        .into_iter()
        .filter_map(|component_id| {
            let lock = store.get(&component_id)?;
            Some(LockConflict {
                id: format!("conflict-{}", component_id),
                kind: ConflictKind::LockOverride,
                description: format!(
                    "'{}' is already {} locked by {}",
                    component_id, lock.level, lock.locked_by
                ),
                current_state: serde_json::to_value(lock).unwrap_or_default(),
                conflicting_state: serde_json::Value::Null,
                priority: if lock.can_be_overridden_by(user) {
                    ConflictPriority::Medium
                } else {
                    ConflictPriority::High
                },
                affected_users: vec![lock.locked_by.clone()],
                created_at: now,
                component_id,
            })
        })
        .collect()
}
