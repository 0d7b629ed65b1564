//! Component locking and conflict resolution
//!
//! # Architecture
//!
//! - **Types**: `ComponentLock`, `LockConflict`, `ConflictResolution`, `BulkLockOperation`
//! - **Store**: `LockStore`, at most one lock per component
//! - **Detector**: `ConflictDetector` pre-checks an operation against the backend
//! - **Resolver**: `ConflictResolver` collects one resolution per conflict
//! - **Bulk**: `BulkOperationCoordinator` submits validated operations as one call
//! - **Session**: `LockSession` serializes every mutation for one project
//! - **Events**: `LockUpdate` decoded from the push channel
//!
//! # Example
//!
//! ```ignore
//! use plotweaver_core::domain::locking::{ConflictResolution, LockSession, Submission};
//!
//! let session = LockSession::from_config(&config, "p1")?;
//! session.refresh().await?;
//!
//! if let Submission::NeedsResolution(mut resolver) =
//!     session.unlock(["scene-1", "scene-2"], "cleanup").await?
//! {
//!     resolver.resolve_all(ConflictResolution::skip())?;
//!     session.apply_resolution(&mut resolver).await?;
//! }
//! ```

pub mod bulk;
pub mod detector;
pub mod event;
pub mod resolver;
pub mod session;
pub mod store;
pub mod types;

pub use bulk::{BulkOperationCoordinator, BulkPreparation};
pub use detector::{CheckFailurePolicy, ConflictDetector, local_conflicts};
pub use event::{LockUpdate, ProjectUpdate};
pub use resolver::{
    ConflictResolver, ResolutionOutcome, ResolutionPlan, ResolverState, is_complete,
};
pub use session::{LockSession, Submission};
pub use store::{LockStore, StoreChange};
pub use types::{
    AuditEntry, BulkLockOperation, BulkOperationKind, ComponentLock, ConflictCheck, ConflictKind,
    ConflictPriority, ConflictResolution, LockConflict, LockLevel, LockOperation, LockType,
    ResolutionKind,
};
