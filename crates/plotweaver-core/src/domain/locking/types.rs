//! Lock data model
//!
//! Wire names follow the backend's camelCase JSON.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Error;

/// Strictness of an edit restriction: `Soft < Hard < Frozen`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockLevel {
    /// Advisory; other users are warned
    Soft,
    /// Edits require an explicit override
    Hard,
    /// No edits, no overrides
    Frozen,
}

impl LockLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Hard => "hard",
            Self::Frozen => "frozen",
        }
    }

    pub fn is_stricter_than(&self, other: LockLevel) -> bool {
        *self > other
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "soft" => Ok(Self::Soft),
            "hard" => Ok(Self::Hard),
            "frozen" => Ok(Self::Frozen),
            other => Err(Error::Validation(format!(
                "unknown lock level '{}' (expected soft, hard or frozen)",
                other
            ))),
        }
    }
}

/// Who a lock serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Personal,
    Editorial,
    Collaborative,
}

impl LockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Editorial => "editorial",
            Self::Collaborative => "collaborative",
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "personal" => Ok(Self::Personal),
            "editorial" => Ok(Self::Editorial),
            "collaborative" => Ok(Self::Collaborative),
            other => Err(Error::Validation(format!("unknown lock type '{}'", other))),
        }
    }
}

/// An edit restriction on one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentLock {
    pub id: String,
    pub component_id: String,
    pub level: LockLevel,
    #[serde(rename = "type")]
    pub lock_type: LockType,
    pub reason: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    #[serde(default)]
    pub shared_with: BTreeSet<String>,
    #[serde(default)]
    pub can_override: bool,
}

impl ComponentLock {
    /// A new lock held by `locked_by`, stamped now
    pub fn new(
        component_id: impl Into<String>,
        level: LockLevel,
        lock_type: LockType,
        reason: impl Into<String>,
        locked_by: impl Into<String>,
    ) -> Self {
        let component_id = component_id.into();
        Self {
            id: format!("lock-{}-{}", component_id, Uuid::new_v4().simple()),
            component_id,
            level,
            lock_type,
            reason: reason.into(),
            locked_by: locked_by.into(),
            locked_at: Utc::now(),
            shared_with: BTreeSet::new(),
            can_override: level != LockLevel::Frozen,
        }
    }

    pub fn with_shared(mut self, users: impl IntoIterator<Item = String>) -> Self {
        self.shared_with.extend(users);
        self
    }

    /// Whether `user` may edit through this lock without overriding it
    pub fn permits(&self, user: &str) -> bool {
        self.locked_by == user || self.shared_with.contains(user)
    }

    /// Frozen locks are never overridable; otherwise the holder or `canOverride` decides
    pub fn can_be_overridden_by(&self, user: &str) -> bool {
        match self.level {
            LockLevel::Frozen => false,
            _ => self.can_override || self.locked_by == user,
        }
    }
}

/// Kind of detected conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    LockOverride,
    ConcurrentEdit,
    PermissionChange,
    MergeConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// A disagreement between an intended operation and recorded lock state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockConflict {
    pub id: String,
    pub component_id: String,
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub description: String,
    #[serde(default)]
    pub current_state: Value,
    #[serde(default)]
    pub conflicting_state: Value,
    pub priority: ConflictPriority,
    #[serde(default)]
    pub affected_users: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// How the user chose to settle one conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    KeepCurrent,
    AcceptNew,
    Merge,
    Skip,
    Custom,
    /// Clear the existing lock, then apply the operation
    Unlock,
}

impl ResolutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeepCurrent => "keep_current",
            Self::AcceptNew => "accept_new",
            Self::Merge => "merge",
            Self::Skip => "skip",
            Self::Custom => "custom",
            Self::Unlock => "unlock",
        }
    }

    /// Whether the component stays in the operation's target set
    pub fn keeps_target(&self) -> bool {
        match self {
            Self::Skip | Self::KeepCurrent => false,
            Self::AcceptNew | Self::Merge | Self::Custom | Self::Unlock => true,
        }
    }
}

impl fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "keep_current" => Ok(Self::KeepCurrent),
            "accept_new" => Ok(Self::AcceptNew),
            "merge" => Ok(Self::Merge),
            "skip" => Ok(Self::Skip),
            "custom" => Ok(Self::Custom),
            "unlock" => Ok(Self::Unlock),
            other => Err(Error::Validation(format!("unknown resolution '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    #[serde(rename = "type")]
    pub kind: ResolutionKind,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_state: Option<Value>,
}

impl ConflictResolution {
    pub fn new(kind: ResolutionKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            custom_state: None,
        }
    }

    pub fn skip() -> Self {
        Self::new(ResolutionKind::Skip, "Skipped by user")
    }

    pub fn unlock() -> Self {
        Self::new(ResolutionKind::Unlock, "Unlocked by user")
    }

    pub fn custom(reason: impl Into<String>, state: Value) -> Self {
        Self {
            kind: ResolutionKind::Custom,
            reason: reason.into(),
            custom_state: Some(state),
        }
    }
}

/// Action applied uniformly by a bulk operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOperationKind {
    Lock,
    Unlock,
    ChangeLevel,
}

impl BulkOperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::ChangeLevel => "change_level",
        }
    }

    pub fn requires_level(&self) -> bool {
        matches!(self, Self::Lock | Self::ChangeLevel)
    }
}

impl fmt::Display for BulkOperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lock action over several components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkLockOperation {
    #[serde(rename = "type")]
    pub kind: BulkOperationKind,
    pub component_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_level: Option<LockLevel>,
    /// Type of the locks a `lock` action creates; personal when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_type: Option<LockType>,
    pub reason: String,
}

impl BulkLockOperation {
    pub fn new(
        kind: BulkOperationKind,
        component_ids: impl IntoIterator<Item = impl Into<String>>,
        lock_level: Option<LockLevel>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            component_ids: component_ids.into_iter().map(Into::into).collect(),
            lock_level,
            lock_type: None,
            reason: reason.into(),
        }
    }

    pub fn with_lock_type(mut self, lock_type: LockType) -> Self {
        self.lock_type = Some(lock_type);
        self
    }

    /// Client-side submission precondition
    pub fn validate(&self) -> crate::Result<()> {
        if self.reason.trim().is_empty() {
            return Err(Error::Validation("a reason is required for bulk operations".to_string()));
        }
        if self.component_ids.is_empty() {
            return Err(Error::Validation("select at least one component".to_string()));
        }
        if self.kind.requires_level() && self.lock_level.is_none() {
            return Err(Error::Validation(format!(
                "a lock level is required for '{}' operations",
                self.kind
            )));
        }
        Ok(())
    }
}

/// An intended lock operation, as sent to the conflict pre-check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockOperation {
    Lock {
        #[serde(rename = "componentIds")]
        component_ids: BTreeSet<String>,
        level: LockLevel,
        #[serde(rename = "lockType", default, skip_serializing_if = "Option::is_none")]
        lock_type: Option<LockType>,
        reason: String,
    },
    Unlock {
        #[serde(rename = "componentIds")]
        component_ids: BTreeSet<String>,
        reason: String,
    },
    ChangeLevel {
        #[serde(rename = "componentIds")]
        component_ids: BTreeSet<String>,
        level: LockLevel,
        reason: String,
    },
    Bulk {
        operations: Vec<BulkLockOperation>,
    },
}

impl LockOperation {
    /// Every component this operation touches
    pub fn component_ids(&self) -> BTreeSet<String> {
        match self {
            Self::Lock { component_ids, .. }
            | Self::Unlock { component_ids, .. }
            | Self::ChangeLevel { component_ids, .. } => component_ids.clone(),
            Self::Bulk { operations } => operations
                .iter()
                .flat_map(|op| op.component_ids.iter().cloned())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.component_ids().is_empty()
    }

    /// The same operation restricted to `keep`
    pub fn retain(&self, keep: impl Fn(&str) -> bool) -> Self {
        let filter = |ids: &BTreeSet<String>| -> BTreeSet<String> {
            ids.iter().filter(|id| keep(id.as_str())).cloned().collect()
        };
        match self {
            Self::Lock {
                component_ids,
                level,
                lock_type,
                reason,
            } => Self::Lock {
                component_ids: filter(component_ids),
                level: *level,
                lock_type: *lock_type,
                reason: reason.clone(),
            },
            Self::Unlock {
                component_ids,
                reason,
            } => Self::Unlock {
                component_ids: filter(component_ids),
                reason: reason.clone(),
            },
            Self::ChangeLevel {
                component_ids,
                level,
                reason,
            } => Self::ChangeLevel {
                component_ids: filter(component_ids),
                level: *level,
                reason: reason.clone(),
            },
            Self::Bulk { operations } => Self::Bulk {
                operations: operations
                    .iter()
                    .map(|op| BulkLockOperation {
                        component_ids: filter(&op.component_ids),
                        ..op.clone()
                    })
                    .filter(|op| !op.component_ids.is_empty())
                    .collect(),
            },
        }
    }

    /// Bulk operations that carry out this intent
    pub fn to_bulk(&self) -> Vec<BulkLockOperation> {
        match self {
            Self::Lock {
                component_ids,
                level,
                lock_type,
                reason,
            } => vec![BulkLockOperation {
                lock_type: *lock_type,
                ..BulkLockOperation::new(
                    BulkOperationKind::Lock,
                    component_ids.iter().cloned(),
                    Some(*level),
                    reason.clone(),
                )
            }],
            Self::Unlock {
                component_ids,
                reason,
            } => vec![BulkLockOperation::new(
                BulkOperationKind::Unlock,
                component_ids.iter().cloned(),
                None,
                reason.clone(),
            )],
            Self::ChangeLevel {
                component_ids,
                level,
                reason,
            } => vec![BulkLockOperation::new(
                BulkOperationKind::ChangeLevel,
                component_ids.iter().cloned(),
                Some(*level),
                reason.clone(),
            )],
            Self::Bulk { operations } => operations.clone(),
        }
    }
}

impl From<BulkLockOperation> for LockOperation {
    fn from(op: BulkLockOperation) -> Self {
        match op.kind {
            BulkOperationKind::Lock => match op.lock_level {
                Some(level) => Self::Lock {
                    component_ids: op.component_ids,
                    level,
                    lock_type: op.lock_type,
                    reason: op.reason,
                },
                None => Self::Bulk {
                    operations: vec![op],
                },
            },
            BulkOperationKind::Unlock => Self::Unlock {
                component_ids: op.component_ids,
                reason: op.reason,
            },
            BulkOperationKind::ChangeLevel => match op.lock_level {
                Some(level) => Self::ChangeLevel {
                    component_ids: op.component_ids,
                    level,
                    reason: op.reason,
                },
                None => Self::Bulk {
                    operations: vec![op],
                },
            },
        }
    }
}

/// Result of a conflict pre-check
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCheck {
    pub has_conflicts: bool,
    #[serde(default)]
    pub conflicts: Vec<LockConflict>,
    pub can_proceed: bool,
    /// Set when the check itself failed and the result is a fail-open default
    #[serde(default, skip_serializing)]
    pub degraded: bool,
}

impl ConflictCheck {
    pub fn clear() -> Self {
        Self {
            has_conflicts: false,
            conflicts: Vec::new(),
            can_proceed: true,
            degraded: false,
        }
    }

    pub fn from_conflicts(conflicts: Vec<LockConflict>) -> Self {
        Self {
            has_conflicts: !conflicts.is_empty(),
            can_proceed: conflicts.is_empty(),
            conflicts,
            degraded: false,
        }
    }

    /// Fail-open default used when the check could not be performed
    pub fn degraded() -> Self {
        Self {
            degraded: true,
            ..Self::clear()
        }
    }
}

/// One entry of a project's lock history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub action: String,
    #[serde(default)]
    pub component_id: Option<String>,
    #[serde(default)]
    pub lock: Option<ComponentLock>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub user: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lock_level_ordering() {
        assert!(LockLevel::Soft < LockLevel::Hard);
        assert!(LockLevel::Hard < LockLevel::Frozen);
        assert!(LockLevel::Frozen.is_stricter_than(LockLevel::Soft));
        assert!(!LockLevel::Soft.is_stricter_than(LockLevel::Soft));
        assert_eq!("HARD".parse::<LockLevel>().unwrap(), LockLevel::Hard);
        assert!("iron".parse::<LockLevel>().is_err());
    }

    #[test]
    fn test_component_lock_wire_format() {
        let raw = json!({
            "id": "lock_comp123_1",
            "componentId": "comp123",
            "level": "hard",
            "type": "editorial",
            "reason": "Final review",
            "lockedBy": "editor-1",
            "lockedAt": "2024-01-01T12:00:00Z",
            "sharedWith": ["writer-2"],
            "canOverride": false
        });
        let lock: ComponentLock = serde_json::from_value(raw).unwrap();
        assert_eq!(lock.component_id, "comp123");
        assert_eq!(lock.level, LockLevel::Hard);
        assert_eq!(lock.lock_type, LockType::Editorial);
        assert!(lock.permits("writer-2"));
        assert!(!lock.permits("writer-3"));

        let back = serde_json::to_value(&lock).unwrap();
        assert_eq!(back["componentId"], "comp123");
        assert_eq!(back["type"], "editorial");
    }

    #[test]
    fn test_frozen_lock_is_never_overridable() {
        let mut lock = ComponentLock::new("c1", LockLevel::Frozen, LockType::Personal, "done", "alice");
        assert!(!lock.can_override);
        lock.can_override = true;
        assert!(!lock.can_be_overridden_by("alice"));

        let soft = ComponentLock::new("c2", LockLevel::Soft, LockType::Personal, "wip", "alice");
        assert!(soft.can_be_overridden_by("bob"));
    }

    #[test]
    fn test_bulk_validation() {
        let ok = BulkLockOperation::new(BulkOperationKind::Unlock, ["a"], None, "cleanup");
        assert!(ok.validate().is_ok());

        let no_reason = BulkLockOperation::new(BulkOperationKind::Unlock, ["a"], None, "   ");
        assert!(matches!(no_reason.validate(), Err(Error::Validation(_))));

        let no_ids = BulkLockOperation::new(BulkOperationKind::Unlock, Vec::<String>::new(), None, "x");
        assert!(no_ids.validate().is_err());

        let no_level = BulkLockOperation::new(BulkOperationKind::Lock, ["a"], None, "x");
        assert!(no_level.validate().is_err());
    }

    #[test]
    fn test_bulk_operation_wire_format() {
        let op = BulkLockOperation::new(
            BulkOperationKind::Lock,
            ["scene-2", "scene-1"],
            Some(LockLevel::Soft),
            "drafting",
        );
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "lock",
                "componentIds": ["scene-1", "scene-2"],
                "lockLevel": "soft",
                "reason": "drafting"
            })
        );
    }

    #[test]
    fn test_operation_retain_and_component_ids() {
        let op = LockOperation::Unlock {
            component_ids: ["scene-1", "scene-2"].iter().map(|s| s.to_string()).collect(),
            reason: "cleanup".to_string(),
        };
        let filtered = op.retain(|id| id != "scene-1");
        assert_eq!(filtered.component_ids().into_iter().collect::<Vec<_>>(), vec!["scene-2"]);

        let bulk = LockOperation::Bulk {
            operations: vec![
                BulkLockOperation::new(BulkOperationKind::Unlock, ["a"], None, "x"),
                BulkLockOperation::new(BulkOperationKind::Lock, ["b", "c"], Some(LockLevel::Hard), "y"),
            ],
        };
        assert_eq!(bulk.component_ids().len(), 3);
        let filtered = bulk.retain(|id| id != "a");
        assert_eq!(filtered.to_bulk().len(), 1);
    }

    #[test]
    fn test_operation_tagged_serialization() {
        let op = LockOperation::ChangeLevel {
            component_ids: ["c1".to_string()].into_iter().collect(),
            level: LockLevel::Frozen,
            reason: "publish".to_string(),
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "change_level");
        assert_eq!(value["componentIds"], json!(["c1"]));
    }

    #[test]
    fn test_resolution_kinds() {
        assert!(!ResolutionKind::Skip.keeps_target());
        assert!(!ResolutionKind::KeepCurrent.keeps_target());
        assert!(ResolutionKind::Unlock.keeps_target());
        assert_eq!("keep-current".parse::<ResolutionKind>().unwrap(), ResolutionKind::KeepCurrent);

        let value = serde_json::to_value(ConflictResolution::skip()).unwrap();
        assert_eq!(value["type"], "skip");
        assert!(value.get("customState").is_none());
    }

    #[test]
    fn test_conflict_check_constructors() {
        assert!(ConflictCheck::clear().can_proceed);
        let degraded = ConflictCheck::degraded();
        assert!(degraded.can_proceed && degraded.degraded && !degraded.has_conflicts);
        assert!(!ConflictCheck::from_conflicts(vec![]).has_conflicts);
    }
}
