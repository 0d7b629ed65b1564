//! Bulk lock operations
//!
//! The coordinator validates a bulk operation, runs the conflict pre-check
//! and hands the (possibly conflict-filtered) result to the backend as a
//! single `bulk` call.
//!
//! It does not make the operation atomic across components. Operations are
//! applied by the backend in submission order and whatever atomicity the
//! backend offers is all there is; a failure part way through can leave
//! some components changed. Callers should refresh lock state after a failed
//! submission.

use tracing::{debug, info};

use super::detector::ConflictDetector;
use super::resolver::{ConflictResolver, ResolutionPlan};
use super::types::{BulkLockOperation, BulkOperationKind, LockOperation};
use crate::api::{BulkUpdateOutcome, LockApi};
use crate::error::{Error, Result};

/// Outcome of preparing an operation for submission
#[derive(Debug, Clone)]
pub enum BulkPreparation {
    /// No conflicts; submit as is
    Ready(LockOperation),
    /// The user must resolve these conflicts first
    NeedsResolution(ConflictResolver),
}

#[derive(Debug, Clone)]
pub struct BulkOperationCoordinator {
    api: LockApi,
    detector: ConflictDetector,
}

impl BulkOperationCoordinator {
    pub fn new(api: LockApi, detector: ConflictDetector) -> Self {
        Self { api, detector }
    }

    pub fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    /// Validate and pre-check an operation
    pub async fn prepare(&self, project_id: &str, operation: LockOperation) -> Result<BulkPreparation> {
        if operation.is_empty() {
            return Err(Error::Validation("select at least one component".to_string()));
        }
        for op in operation.to_bulk() {
            op.validate()?;
        }

        let check = self.detector.check(project_id, &operation).await?;
        if check.can_proceed && !check.has_conflicts {
            return Ok(BulkPreparation::Ready(operation));
        }

        debug!(
            project_id = %project_id,
            conflicts = check.conflicts.len(),
            "Operation needs conflict resolution"
        );
        Ok(BulkPreparation::NeedsResolution(ConflictResolver::new(
            operation,
            check.conflicts,
        )))
    }

    /// Submit operations as one backend call; empty operations are dropped
    pub async fn submit(
        &self,
        project_id: &str,
        operations: Vec<BulkLockOperation>,
    ) -> Result<BulkUpdateOutcome> {
        let operations: Vec<BulkLockOperation> = operations
            .into_iter()
            .filter(|op| !op.component_ids.is_empty())
            .collect();
        if operations.is_empty() {
            debug!(project_id = %project_id, "Nothing to submit");
            return Ok(BulkUpdateOutcome::default());
        }
        for op in &operations {
            op.validate()?;
        }
        self.api.bulk_update_locks(project_id, &operations).await
    }

    /// Carry out a confirmed resolution plan.
    ///
    /// Rich resolutions are reported first, then one bulk call clears the
    /// `unlock_first` components and applies the remaining operation.
    pub async fn execute_plan(&self, project_id: &str, plan: &ResolutionPlan) -> Result<BulkUpdateOutcome> {
        for (conflict_id, resolution) in &plan.reported {
            self.api
                .resolve_conflict(project_id, conflict_id, resolution)
                .await?;
        }

        let mut operations = Vec::new();
        if !plan.unlock_first.is_empty() {
            operations.push(BulkLockOperation::new(
                BulkOperationKind::Unlock,
                plan.unlock_first.iter().cloned(),
                None,
                "Cleared to resolve conflict",
            ));
        }
        operations.extend(plan.operation.to_bulk());

        let outcome = self.submit(project_id, operations).await?;
        info!(
            project_id = %project_id,
            skipped = plan.skipped.len(),
            unlocked_first = plan.unlock_first.len(),
            "Resolution plan executed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::locking::types::ConflictResolution;
    use crate::request::testing::ScriptedTransport;
    use crate::request::{RequestClient, RetryPolicy};
    use serde_json::json;
    use std::sync::Arc;

    fn coordinator(transport: Arc<ScriptedTransport>) -> BulkOperationCoordinator {
        let client = RequestClient::builder()
            .shared_transport(transport)
            .retry(RetryPolicy::none())
            .build()
            .unwrap();
        let api = LockApi::new(client);
        BulkOperationCoordinator::new(api.clone(), ConflictDetector::new(api))
    }

    fn unlock(ids: &[&str], reason: &str) -> LockOperation {
        LockOperation::Unlock {
            component_ids: ids.iter().map(|s| s.to_string()).collect(),
            reason: reason.to_string(),
        }
    }

    #[tokio::test]
    async fn test_empty_reason_never_reaches_network() {
        let transport = Arc::new(ScriptedTransport::new());
        let coordinator = coordinator(transport.clone());

        let err = coordinator.prepare("p1", unlock(&["a"], "  ")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_prepare_ready_without_conflicts() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(json!({"success": true, "data": {"conflicts": [], "can_proceed": true}}));
        let coordinator = coordinator(transport);

        let prepared = coordinator.prepare("p1", unlock(&["a"], "done")).await.unwrap();
        assert!(matches!(prepared, BulkPreparation::Ready(_)));
    }

    #[tokio::test]
    async fn test_prepare_needs_resolution() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(json!({"success": true, "data": {"conflicts": [{"component_id": "a"}], "can_proceed": false}}));
        let coordinator = coordinator(transport);

        match coordinator.prepare("p1", unlock(&["a", "b"], "done")).await.unwrap() {
            BulkPreparation::NeedsResolution(resolver) => {
                assert_eq!(resolver.unresolved_count(), 1);
            }
            other => panic!("expected resolution, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_plan_issues_one_bulk_call() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(json!({"success": true, "data": {"conflicts": [{"component_id": "a"}], "can_proceed": false}}));
        transport.push_ok(json!({"status": "bulk_updated", "affected_components": ["a", "a", "c"]}));
        let coordinator = coordinator(transport.clone());

        let op = LockOperation::Lock {
            component_ids: ["a", "c"].iter().map(|s| s.to_string()).collect(),
            level: crate::domain::locking::types::LockLevel::Hard,
            lock_type: None,
            reason: "review".to_string(),
        };
        let BulkPreparation::NeedsResolution(mut resolver) = coordinator.prepare("p1", op).await.unwrap() else {
            panic!("expected conflicts");
        };
        resolver.resolve("a", ConflictResolution::unlock()).unwrap();
        let plan = resolver.plan().unwrap();

        coordinator.execute_plan("p1", &plan).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        let ops = &requests[1].body.as_ref().unwrap()["operations"];
        assert_eq!(ops[0]["type"], "unlock");
        assert_eq!(ops[0]["componentIds"], json!(["a"]));
        assert_eq!(ops[1]["type"], "lock");
        assert_eq!(ops[1]["componentIds"], json!(["a", "c"]));
    }

    #[tokio::test]
    async fn test_submit_skips_empty_operations() {
        let transport = Arc::new(ScriptedTransport::new());
        let coordinator = coordinator(transport.clone());

        let outcome = coordinator
            .submit("p1", vec![BulkLockOperation::new(BulkOperationKind::Unlock, Vec::<String>::new(), None, "x")])
            .await
            .unwrap();
        assert!(outcome.affected_components.is_empty());
        assert_eq!(transport.calls(), 0);
    }
}
