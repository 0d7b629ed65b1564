//! Domain layer
//!
//! Lock coordination and conflict resolution.

pub mod locking;
