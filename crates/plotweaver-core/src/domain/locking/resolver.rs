//! User-driven conflict resolution
//!
//! A [`ConflictResolver`] holds one resolution cycle: the conflicts found by a
//! pre-check and exactly one bound resolution per conflicting component. The
//! operation can be confirmed only once every conflict has a resolution.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::types::{
    BulkOperationKind, ConflictResolution, LockConflict, LockOperation, ResolutionKind,
};
use crate::error::{Error, Result};

/// True iff every conflict's component has a bound resolution
pub fn is_complete(
    conflicts: &[LockConflict],
    resolutions: &HashMap<String, ConflictResolution>,
) -> bool {
    conflicts
        .iter()
        .all(|c| resolutions.contains_key(&c.component_id))
}

/// Lifecycle of one resolution cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverState {
    /// Collecting resolutions
    Resolvable,
    /// A confirm is in flight; resubmission is refused
    Resolving,
    Confirmed,
    Cancelled,
}

/// What confirming the current resolutions will do
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionPlan {
    /// The original operation minus skipped components
    pub operation: LockOperation,
    /// Components whose existing lock is cleared before `operation` runs
    pub unlock_first: BTreeSet<String>,
    pub skipped: BTreeSet<String>,
    /// `(conflict id, resolution)` pairs reported to the backend
    pub reported: Vec<(String, ConflictResolution)>,
}

impl ResolutionPlan {
    /// Nothing left to send
    pub fn is_noop(&self) -> bool {
        self.operation.is_empty() && self.unlock_first.is_empty() && self.reported.is_empty()
    }
}

/// Result of finishing a resolution cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Confirmed {
        submitted: BTreeSet<String>,
        skipped: BTreeSet<String>,
    },
    Cancelled,
}

impl ResolutionOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn skipped(&self) -> BTreeSet<String> {
        match self {
            Self::Confirmed { skipped, .. } => skipped.clone(),
            Self::Cancelled => BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    operation: LockOperation,
    conflicts: Vec<LockConflict>,
    resolutions: HashMap<String, ConflictResolution>,
    state: ResolverState,
    last_error: Option<String>,
}

impl ConflictResolver {
    pub fn new(operation: LockOperation, conflicts: Vec<LockConflict>) -> Self {
        Self {
            operation,
            conflicts,
            resolutions: HashMap::new(),
            state: ResolverState::Resolvable,
            last_error: None,
        }
    }

    pub fn operation(&self) -> &LockOperation {
        &self.operation
    }

    pub fn conflicts(&self) -> &[LockConflict] {
        &self.conflicts
    }

    pub fn resolutions(&self) -> &HashMap<String, ConflictResolution> {
        &self.resolutions
    }

    pub fn resolution_for(&self, component_id: &str) -> Option<&ConflictResolution> {
        self.resolutions.get(component_id)
    }

    pub fn state(&self) -> ResolverState {
        self.state
    }

    pub fn is_resolving(&self) -> bool {
        self.state == ResolverState::Resolving
    }

    /// Error of the last failed confirm, cleared on the next attempt
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Bind `resolution` to the conflict on `component_id`, replacing any earlier choice
    pub fn resolve(&mut self, component_id: &str, resolution: ConflictResolution) -> Result<()> {
        self.ensure_editable()?;
        if !self.conflicts.iter().any(|c| c.component_id == component_id) {
            return Err(Error::UnknownConflict(component_id.to_string()));
        }
        debug!(component_id = %component_id, resolution = %resolution.kind, "Resolution bound");
        self.resolutions.insert(component_id.to_string(), resolution);
        Ok(())
    }

    pub fn clear_resolution(&mut self, component_id: &str) -> Result<Option<ConflictResolution>> {
        self.ensure_editable()?;
        Ok(self.resolutions.remove(component_id))
    }

    /// Bind the same resolution to every conflict
    pub fn resolve_all(&mut self, resolution: ConflictResolution) -> Result<()> {
        self.ensure_editable()?;
        for conflict in &self.conflicts {
            self.resolutions
                .insert(conflict.component_id.clone(), resolution.clone());
        }
        Ok(())
    }

    pub fn unresolved(&self) -> Vec<&LockConflict> {
        self.conflicts
            .iter()
            .filter(|c| !self.resolutions.contains_key(&c.component_id))
            .collect()
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved().len()
    }

    pub fn is_complete(&self) -> bool {
        is_complete(&self.conflicts, &self.resolutions)
    }

    /// Whether the confirm action should be enabled
    pub fn can_confirm(&self) -> bool {
        self.state == ResolverState::Resolvable && self.is_complete()
    }

    /// Partition the conflicts by resolution kind
    pub fn plan(&self) -> Result<ResolutionPlan> {
        let unresolved = self.unresolved_count();
        if unresolved > 0 {
            return Err(Error::UnresolvedConflicts { unresolved });
        }

        let mut skipped = BTreeSet::new();
        let mut unlock_first = BTreeSet::new();
        let mut reported = Vec::new();

        for conflict in &self.conflicts {
            let Some(resolution) = self.resolutions.get(&conflict.component_id) else {
                continue;
            };
            if !resolution.kind.keeps_target() {
                skipped.insert(conflict.component_id.clone());
            }
            match resolution.kind {
                ResolutionKind::Unlock => {
                    unlock_first.insert(conflict.component_id.clone());
                }
                ResolutionKind::Skip => {}
                ResolutionKind::KeepCurrent
                | ResolutionKind::AcceptNew
                | ResolutionKind::Merge
                | ResolutionKind::Custom => {
                    reported.push((conflict.id.clone(), resolution.clone()));
                }
            }
        }

        let operation = self.operation.retain(|id| !skipped.contains(id));

        // An unlock operation already clears these
        let unlocked_by_operation: BTreeSet<String> = operation
            .to_bulk()
            .into_iter()
            .filter(|op| op.kind == BulkOperationKind::Unlock)
            .flat_map(|op| op.component_ids)
            .collect();
        unlock_first.retain(|id| !unlocked_by_operation.contains(id));

        Ok(ResolutionPlan {
            operation,
            unlock_first,
            skipped,
            reported,
        })
    }

    /// Enter the resolving state and hand out the plan to apply
    pub fn begin_confirm(&mut self) -> Result<ResolutionPlan> {
        if self.state == ResolverState::Resolving {
            return Err(Error::ResolutionInProgress);
        }
        self.ensure_editable()?;
        let plan = self.plan()?;
        self.state = ResolverState::Resolving;
        self.last_error = None;
        Ok(plan)
    }

    /// Mark the in-flight confirm as applied
    pub fn complete(&mut self, plan: &ResolutionPlan) -> ResolutionOutcome {
        self.state = ResolverState::Confirmed;
        info!(
            submitted = plan.operation.component_ids().len(),
            skipped = plan.skipped.len(),
            "Conflict resolution confirmed"
        );
        ResolutionOutcome::Confirmed {
            submitted: plan.operation.component_ids(),
            skipped: plan.skipped.clone(),
        }
    }

    /// Return to the resolvable state after a failed confirm
    pub fn fail(&mut self, error: &Error) {
        warn!(error = %error, "Conflict resolution failed; resolutions kept for retry");
        self.state = ResolverState::Resolvable;
        self.last_error = Some(error.to_string());
    }

    /// Confirm with `apply` performing the plan
    pub async fn confirm<F, Fut>(&mut self, apply: F) -> Result<ResolutionOutcome>
    where
        F: FnOnce(ResolutionPlan) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let plan = self.begin_confirm()?;
        match apply(plan.clone()).await {
            Ok(()) => Ok(self.complete(&plan)),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Abandon the cycle regardless of completeness
    pub fn cancel(&mut self) -> ResolutionOutcome {
        debug!(unresolved = self.unresolved_count(), "Conflict resolution cancelled");
        self.state = ResolverState::Cancelled;
        ResolutionOutcome::Cancelled
    }

    fn ensure_editable(&self) -> Result<()> {
        match self.state {
            ResolverState::Resolvable => Ok(()),
            ResolverState::Resolving => Err(Error::ResolutionInProgress),
            ResolverState::Confirmed | ResolverState::Cancelled => Err(Error::Validation(
                "this resolution cycle has already finished".to_string(),
            )),
        }
    }
}
