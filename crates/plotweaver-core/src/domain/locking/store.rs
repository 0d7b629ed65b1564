//! Authoritative in-memory lock state for one project
//!
//! The map is keyed by component id, so at most one lock exists per
//! component at any observation point. All mutation goes through the
//! methods below.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::event::LockUpdate;
use super::types::{BulkLockOperation, BulkOperationKind, ComponentLock, LockConflict, LockType};

/// What applying an update did to the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum StoreChange {
    Upserted { component_id: String },
    Removed { component_id: String },
    Replaced { count: usize },
    ConflictsChanged,
    /// Local state is known to be stale for these components
    NeedsRefresh { component_ids: Vec<String> },
    Unchanged,
}

/// Component locks plus the pending conflict set
#[derive(Debug, Clone, Default)]
pub struct LockStore {
    locks: HashMap<String, ComponentLock>,
    conflicts: Vec<LockConflict>,
    stale: bool,
    synced_at: Option<DateTime<Utc>>,
}

impl LockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, component_id: &str) -> Option<&ComponentLock> {
        self.locks.get(component_id)
    }

    pub fn is_locked(&self, component_id: &str) -> bool {
        self.locks.contains_key(component_id)
    }

    pub fn locks(&self) -> &HashMap<String, ComponentLock> {
        &self.locks
    }

    /// Locks sorted by component id, for stable display
    pub fn sorted_locks(&self) -> Vec<&ComponentLock> {
        let mut locks: Vec<_> = self.locks.values().collect();
        locks.sort_by(|a, b| a.component_id.cmp(&b.component_id));
        locks
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn conflicts(&self) -> &[LockConflict] {
        &self.conflicts
    }

    /// True after a change whose details were not delivered (bulk broadcast)
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Flag local state as untrusted until the next full replacement
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at
    }

    /// Insert or replace the lock for its component
    pub fn upsert(&mut self, lock: ComponentLock) -> Option<ComponentLock> {
        self.locks.insert(lock.component_id.clone(), lock)
    }

    pub fn remove(&mut self, component_id: &str) -> Option<ComponentLock> {
        self.locks.remove(component_id)
    }

    /// Replace every lock with a server snapshot.
    ///
    /// Entries are re-keyed by their own `componentId`; the last one wins if
    /// the server sent duplicates under different keys.
    pub fn replace_all(&mut self, locks: HashMap<String, ComponentLock>) -> usize {
        self.locks = locks
            .into_values()
            .map(|lock| (lock.component_id.clone(), lock))
            .collect();
        self.stale = false;
        self.synced_at = Some(Utc::now());
        self.locks.len()
    }

    pub fn set_conflicts(&mut self, conflicts: Vec<LockConflict>) {
        self.conflicts = conflicts;
    }

    pub fn clear_conflicts(&mut self) {
        self.conflicts.clear();
    }

    /// Mirror a successfully submitted bulk operation locally
    pub fn apply_bulk(&mut self, op: &BulkLockOperation, locked_by: &str) -> usize {
        let mut touched = 0;
        for component_id in &op.component_ids {
            match (op.kind, op.lock_level) {
                (BulkOperationKind::Lock, Some(level)) => {
                    let mut lock = ComponentLock::new(
                        component_id.clone(),
                        level,
                        op.lock_type.unwrap_or(LockType::Personal),
                        op.reason.clone(),
                        locked_by,
                    );
                    lock.can_override = true;
                    self.upsert(lock);
                    touched += 1;
                }
                (BulkOperationKind::Unlock, _) => {
                    if self.remove(component_id).is_some() {
                        touched += 1;
                    }
                }
                (BulkOperationKind::ChangeLevel, Some(level)) => {
                    if let Some(lock) = self.locks.get_mut(component_id) {
                        lock.level = level;
                        lock.reason = op.reason.clone();
                        touched += 1;
                    }
                }
                (_, None) => {}
            }
        }
        touched
    }

    /// Fold an out-of-band update into the store
    pub fn apply(&mut self, update: LockUpdate) -> StoreChange {
        match update {
            LockUpdate::Upserted(lock) => {
                let component_id = lock.component_id.clone();
                self.upsert(lock);
                StoreChange::Upserted { component_id }
            }
            LockUpdate::Removed { component_id } => match self.remove(&component_id) {
                Some(_) => StoreChange::Removed { component_id },
                None => StoreChange::Unchanged,
            },
            LockUpdate::BulkChanged { component_ids } => {
                self.stale = true;
                StoreChange::NeedsRefresh { component_ids }
            }
            LockUpdate::ConflictResolved { conflict_id } => {
                let before = self.conflicts.len();
                self.conflicts.retain(|c| c.id != conflict_id);
                if self.conflicts.len() == before {
                    debug!(conflict_id = %conflict_id, "Resolved conflict was not pending locally");
                    StoreChange::Unchanged
                } else {
                    StoreChange::ConflictsChanged
                }
            }
            LockUpdate::Snapshot { locks, conflicts } => {
                let count = self.replace_all(locks);
                self.conflicts = conflicts;
                StoreChange::Replaced { count }
            }
        }
    }
}
