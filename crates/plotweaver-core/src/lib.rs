//! PlotWeaver Core Library
//!
//! Client-side lock coordination for collaborative editing:
//! - Component locks with soft/hard/frozen levels (`domain::locking`)
//! - Conflict pre-checks and user-driven resolution
//! - Bulk lock operations submitted as one call
//! - A resilient request layer: TTL cache, in-flight deduplication,
//!   timeouts, cancellation and retry with backoff (`request`, `cache`)
//! - A reconnecting push-update channel (`channel`)

pub mod api;
pub mod cache;
pub mod channel;
pub mod config;
pub mod domain;
pub mod error;
pub mod request;

pub use error::{Error, RequestError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::LockApi;
    pub use crate::channel::{ChannelEvent, ChannelState, ReconnectingChannel, SseConnector};
    pub use crate::config::Config;
    pub use crate::domain::locking::{
        ComponentLock, ConflictResolution, ConflictResolver, LockLevel, LockOperation,
        LockSession, LockType, Submission,
    };
    pub use crate::error::{Error, RequestError, Result};
    pub use crate::request::RequestClient;
}
