//! Reconnecting push-update channel
//!
//! One logical subscription per key. Each subscription is driven by a single
//! cancellable task:
//!
//! ```text
//! Connecting -> Open -> (error | close) -> Reconnecting -> Connecting
//!                                       \-> Terminated   (attempt ceiling reached)
//! ```
//!
//! The server keeps no per-connection state; reconnection is entirely a
//! client concern.

mod reconnect;
mod sse;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use serde_json::Value;

use crate::error::Result;

pub use reconnect::{ReconnectPolicy, ReconnectingChannel, Subscription};
pub use sse::{SseConnector, SseDecoder, SseLine, parse_sse_line};

/// Raw payloads received over one open connection
pub type MessageStream = BoxStream<'static, Result<String>>;

/// Opens one connection for a subscription key.
///
/// The returned stream ends when the server closes the connection and
/// yields `Err` when it breaks.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, key: &str) -> Result<MessageStream>;
}

/// Lifecycle of one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    /// Waiting `delay` before reconnect attempt `attempt`
    Reconnecting { attempt: u32, delay: Duration },
    /// Disconnected on request
    Closed,
    /// Gave up after the attempt ceiling
    Terminated,
}

impl ChannelState {
    /// Whether the subscription task has stopped for good
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Closed | Self::Terminated)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Open => f.write_str("open"),
            Self::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {} in {}ms)", attempt, delay.as_millis())
            }
            Self::Closed => f.write_str("closed"),
            Self::Terminated => f.write_str("connection lost"),
        }
    }
}

/// What a subscriber observes
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A connection was established; the attempt counter is reset
    Opened,
    /// A well-formed JSON payload
    Message(Value),
    /// The connection failed or was closed by the server
    Interrupted { reason: String },
    /// Reconnection stopped; emitted once per subscription
    MaxReconnectAttemptsReached { attempts: u32 },
}
