//! Typed lock backend surface
//!
//! Thin wrappers over [`RequestClient`]. Mutations surface a wrapped
//! [`Error::LockOperation`]; reads that tolerate staleness (locks, audit
//! trail, conflict pre-check, conflict list) log and degrade to a neutral
//! default instead.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::locking::{
    AuditEntry, BulkLockOperation, ComponentLock, ConflictCheck, ConflictKind, ConflictPriority,
    ConflictResolution, LockConflict, LockOperation,
};
use crate::error::{Error, RequestError, Result};
use crate::request::{ApiRequest, RequestClient};

/// Body of `GET /projects/{id}/locks`
#[derive(Debug, Clone, Deserialize)]
struct LocksEnvelope {
    locks: HashMap<String, ComponentLock>,
}

/// What the backend reports after a bulk update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkUpdateOutcome {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub affected_components: Vec<String>,
}

/// Backend health document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_locks: usize,
    #[serde(default)]
    pub total_conflicts: usize,
}

/// Conflict shape returned inside the `{success, data}` envelope
#[derive(Debug, Deserialize)]
struct RawConflict {
    component_id: String,
    #[serde(default)]
    conflict_type: Option<String>,
    #[serde(default)]
    existing_lock: Option<ComponentLock>,
    #[serde(default)]
    can_override: bool,
}

#[derive(Debug, Deserialize)]
struct RawCheckData {
    #[serde(default)]
    conflicts: Vec<RawConflict>,
    can_proceed: bool,
}

#[derive(Debug, Deserialize)]
struct RawCheckEnvelope {
    data: RawCheckData,
}

impl RawConflict {
    fn into_conflict(self, now: DateTime<Utc>) -> LockConflict {
        let holder = self.existing_lock.as_ref().map(|l| l.locked_by.clone());
        let description = match (&self.existing_lock, self.conflict_type.as_deref()) {
            (Some(lock), _) => format!(
                "'{}' is already {} locked by {}",
                self.component_id, lock.level, lock.locked_by
            ),
            (None, Some(kind)) => format!("'{}': {}", self.component_id, kind.replace('_', " ")),
            (None, None) => format!("'{}' conflicts with existing lock state", self.component_id),
        };

        LockConflict {
            id: format!("conflict-{}", self.component_id),
            kind: ConflictKind::LockOverride,
            description,
            current_state: self
                .existing_lock
                .as_ref()
                .and_then(|l| serde_json::to_value(l).ok())
                .unwrap_or(Value::Null),
            conflicting_state: Value::Null,
            priority: if self.can_override {
                ConflictPriority::Medium
            } else {
                ConflictPriority::High
            },
            affected_users: holder.into_iter().collect(),
            created_at: now,
            component_id: self.component_id,
        }
    }
}

/// Decode either the direct `ConflictCheck` shape or the backend envelope
fn parse_conflict_check(body: Value) -> std::result::Result<ConflictCheck, RequestError> {
    if let Ok(check) = serde_json::from_value::<ConflictCheck>(body.clone()) {
        return Ok(check);
    }
    let envelope: RawCheckEnvelope =
        serde_json::from_value(body).map_err(|e| RequestError::Decode(e.to_string()))?;
    let now = Utc::now();
    let conflicts: Vec<LockConflict> = envelope
        .data
        .conflicts
        .into_iter()
        .map(|raw| raw.into_conflict(now))
        .collect();
    Ok(ConflictCheck {
        has_conflicts: !conflicts.is_empty(),
        can_proceed: envelope.data.can_proceed && conflicts.is_empty(),
        conflicts,
        degraded: false,
    })
}

/// Lock endpoints of one backend
#[derive(Debug, Clone)]
pub struct LockApi {
    client: RequestClient,
}

impl LockApi {
    pub fn new(client: RequestClient) -> Self {
        Self { client }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(RequestClient::from_config(config)?))
    }

    pub fn client(&self) -> &RequestClient {
        &self.client
    }

    /// Current locks keyed by component id; strict variant of [`Self::get_locks`]
    pub async fn fetch_locks(&self, project_id: &str) -> Result<HashMap<String, ComponentLock>> {
        let request = ApiRequest::get(format!("/projects/{}/locks", project_id));
        let body = self.client.execute(request).await?;
        // Older servers answer with the bare map
        if body.get("locks").is_some() {
            let envelope: LocksEnvelope =
                serde_json::from_value(body).map_err(|e| RequestError::Decode(e.to_string()))?;
            Ok(envelope.locks)
        } else {
            serde_json::from_value(body).map_err(|e| RequestError::Decode(e.to_string()).into())
        }
    }

    /// Current locks, or an empty map when the backend is unreachable
    pub async fn get_locks(&self, project_id: &str) -> HashMap<String, ComponentLock> {
        match self.fetch_locks(project_id).await {
            Ok(locks) => locks,
            Err(e) => {
                warn!(project_id = %project_id, error = %e, "Failed to fetch locks, using empty set");
                HashMap::new()
            }
        }
    }

    /// Create or replace the lock on one component
    pub async fn update_lock(
        &self,
        project_id: &str,
        component_id: &str,
        lock: &ComponentLock,
    ) -> Result<()> {
        let body = serde_json::to_value(lock).map_err(|e| Error::Other(e.to_string()))?;
        let request = ApiRequest::put(
            format!("/projects/{}/locks/{}", project_id, component_id),
            body,
        );
        self.client
            .execute(request)
            .await
            .map_err(|source| Error::LockOperation {
                operation: "update lock",
                project_id: project_id.to_string(),
                source,
            })?;
        info!(project_id = %project_id, component_id = %component_id, level = %lock.level, "Lock updated");
        Ok(())
    }

    /// Submit bulk operations in one call
    pub async fn bulk_update_locks(
        &self,
        project_id: &str,
        operations: &[BulkLockOperation],
    ) -> Result<BulkUpdateOutcome> {
        let request = ApiRequest::post(
            format!("/projects/{}/locks/bulk", project_id),
            json!({ "operations": operations }),
        );
        let body = self
            .client
            .execute(request)
            .await
            .map_err(|source| Error::LockOperation {
                operation: "apply bulk lock update",
                project_id: project_id.to_string(),
                source,
            })?;
        // The operations were accepted; an unreadable summary is not a failure
        let outcome: BulkUpdateOutcome = match serde_json::from_value(body) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(project_id = %project_id, error = %e, "Unexpected bulk update response, affected components unknown");
                BulkUpdateOutcome::default()
            }
        };
        info!(
            project_id = %project_id,
            operations = operations.len(),
            affected = outcome.affected_components.len(),
            "Bulk lock update applied"
        );
        Ok(outcome)
    }

    /// Strict conflict pre-check
    pub async fn try_check_conflicts(
        &self,
        project_id: &str,
        operation: &LockOperation,
    ) -> Result<ConflictCheck> {
        let mut body = serde_json::to_value(operation).map_err(|e| Error::Other(e.to_string()))?;
        if let Value::Object(map) = &mut body {
            map.insert("components".to_string(), json!(operation.component_ids()));
        }
        let request = ApiRequest::post(
            format!("/projects/{}/locks/check-conflicts", project_id),
            body,
        )
        .as_query();
        let response = self.client.execute(request).await?;
        Ok(parse_conflict_check(response)?)
    }

    /// Conflict pre-check that fails open with a degraded result
    pub async fn check_conflicts(&self, project_id: &str, operation: &LockOperation) -> ConflictCheck {
        match self.try_check_conflicts(project_id, operation).await {
            Ok(check) => check,
            Err(e) => {
                warn!(
                    project_id = %project_id,
                    error = %e,
                    "Conflict check failed, proceeding without conflict information"
                );
                ConflictCheck::degraded()
            }
        }
    }

    /// Report how a conflict was settled
    pub async fn resolve_conflict(
        &self,
        project_id: &str,
        conflict_id: &str,
        resolution: &ConflictResolution,
    ) -> Result<()> {
        let body = serde_json::to_value(resolution).map_err(|e| Error::Other(e.to_string()))?;
        let request = ApiRequest::post(
            format!("/projects/{}/conflicts/{}/resolve", project_id, conflict_id),
            body,
        );
        self.client
            .execute(request)
            .await
            .map_err(|source| Error::LockOperation {
                operation: "resolve conflict",
                project_id: project_id.to_string(),
                source,
            })?;
        Ok(())
    }

    /// Lock history, or empty when unavailable
    pub async fn get_audit_trail(&self, project_id: &str) -> Vec<AuditEntry> {
        let request = ApiRequest::get(format!("/projects/{}/locks/audit", project_id));
        match self.client.execute_json(request).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(project_id = %project_id, error = %e, "Failed to fetch audit trail");
                Vec::new()
            }
        }
    }

    /// Conflicts recorded server-side, or empty when unavailable
    pub async fn get_conflicts(&self, project_id: &str) -> Vec<LockConflict> {
        let request = ApiRequest::get(format!("/projects/{}/conflicts", project_id));
        match self.client.execute_json(request).await {
            Ok(conflicts) => conflicts,
            Err(e) => {
                warn!(project_id = %project_id, error = %e, "Failed to fetch conflicts");
                Vec::new()
            }
        }
    }

    pub async fn health(&self) -> Result<BackendHealth> {
        Ok(self.client.execute_json(ApiRequest::get("/health")).await?)
    }

    pub fn clear_cache(&self) {
        self.client.clear_cache();
    }

    pub fn invalidate_cache(&self, pattern: Option<&str>) -> usize {
        self.client.invalidate_cache(pattern)
    }

    pub fn cancel_pending_requests(&self) -> usize {
        self.client.cancel_pending_requests()
    }

    pub fn cancel_request(&self, key: &str) -> bool {
        self.client.cancel_request(key)
    }
}
